//! Poses and map geometry.

use super::Window;
use crate::{Result, SlamError};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

/// Continuous pose: position in metres, heading in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub heading: f32,
}

impl Pose {
    pub fn new(x: f32, y: f32, heading: f32) -> Self {
        Self { x, y, heading }
    }

    pub fn from_array(values: [f32; 3]) -> Self {
        Self::new(values[0], values[1], values[2])
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.heading]
    }

    /// Express a full-frame pose relative to `origin`
    pub fn to_local(self, origin: Pose) -> Pose {
        self - origin
    }

    /// Express a local-frame pose in the full frame
    pub fn to_full(self, origin: Pose) -> Pose {
        self + origin
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.heading.is_finite()
    }

    /// Heading bucket fed to the global policy (5 degree bins over [-180, 180))
    pub fn orientation_bucket(&self) -> i64 {
        ((self.heading + 180.0) / 5.0) as i64
    }
}

impl Add for Pose {
    type Output = Pose;

    fn add(self, rhs: Pose) -> Pose {
        Pose::new(self.x + rhs.x, self.y + rhs.y, self.heading + rhs.heading)
    }
}

impl Sub for Pose {
    type Output = Pose;

    fn sub(self, rhs: Pose) -> Pose {
        Pose::new(self.x - rhs.x, self.y - rhs.y, self.heading - rhs.heading)
    }
}

/// Sizes and resolution shared by every map in a run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapGeometry {
    /// Side length of the full map in centimetres
    pub map_size_cm: usize,
    /// Centimetres per cell
    pub resolution_cm: usize,
    /// Full-map to local-map downscaling factor
    pub downscale: usize,
}

impl MapGeometry {
    pub fn new(map_size_cm: usize, resolution_cm: usize, downscale: usize) -> Result<Self> {
        let geometry = Self {
            map_size_cm,
            resolution_cm,
            downscale,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution_cm == 0 {
            return Err(SlamError::InvalidConfig(
                "map resolution must be positive".into(),
            ));
        }
        if self.map_size_cm < self.resolution_cm {
            return Err(SlamError::InvalidConfig(format!(
                "map size {}cm is smaller than one {}cm cell",
                self.map_size_cm, self.resolution_cm
            )));
        }
        if self.downscale.max(1) > self.full_size().0 {
            return Err(SlamError::InvalidConfig(format!(
                "downscale {} leaves an empty local map",
                self.downscale
            )));
        }
        Ok(())
    }

    /// Full map size in cells
    pub fn full_size(&self) -> (usize, usize) {
        let side = self.map_size_cm / self.resolution_cm;
        (side, side)
    }

    /// Local map size in cells
    pub fn local_size(&self) -> (usize, usize) {
        let (w, h) = self.full_size();
        let d = self.downscale.max(1);
        (w / d, h / d)
    }

    /// Metres per cell
    pub fn cell_metres(&self) -> f32 {
        self.resolution_cm as f32 / 100.0
    }

    /// Centre of the full map as a pose
    pub fn center_pose(&self) -> Pose {
        let half = self.map_size_cm as f32 / 100.0 / 2.0;
        Pose::new(half, half, 0.0)
    }

    /// Grid cell `(row, col)` of a pose. Rows follow `y`, columns follow `x`.
    pub fn cell_of(&self, pose: Pose) -> (i64, i64) {
        let scale = 100.0 / self.resolution_cm as f32;
        ((pose.y * scale) as i64, (pose.x * scale) as i64)
    }

    /// Offset of a window's corner in the full frame
    pub fn origin_of(&self, window: &Window) -> Pose {
        let m = self.cell_metres();
        Pose::new(window.y1 as f32 * m, window.x1 as f32 * m, 0.0)
    }
}
