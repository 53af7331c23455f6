//! Local window computation.

use serde::{Deserialize, Serialize};

/// Half-open crop `[x1, x2) x [y1, y2)` into the full map.
///
/// `x` runs along map rows, `y` along map columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub x1: usize,
    pub x2: usize,
    pub y1: usize,
    pub y2: usize,
}

impl Window {
    /// Window covering an entire `full_w x full_h` map
    pub fn full(full_w: usize, full_h: usize) -> Self {
        Self {
            x1: 0,
            x2: full_w,
            y1: 0,
            y2: full_h,
        }
    }

    pub fn width(&self) -> usize {
        self.x2 - self.x1
    }

    pub fn height(&self) -> usize {
        self.y2 - self.y1
    }

    /// Whether a full-map cell lies inside the window
    pub fn contains(&self, row: usize, col: usize) -> bool {
        (self.x1..self.x2).contains(&row) && (self.y1..self.y2).contains(&col)
    }

    /// Bounds as `[x1, x2, y1, y2]`, the layout planners expect
    pub fn as_array(&self) -> [usize; 4] {
        [self.x1, self.x2, self.y1, self.y2]
    }
}

/// Compute the local window for an agent at `agent_loc` (row, col).
///
/// With `downscale <= 1` the window is the whole map. Otherwise the window
/// is centred on the agent and, where it would cross a border, shifted flush
/// against that border. The extent is `local`, capped at `full`.
pub fn compute_window(
    agent_loc: (usize, usize),
    local: (usize, usize),
    full: (usize, usize),
    downscale: usize,
) -> Window {
    let (local_w, local_h) = local;
    let (full_w, full_h) = full;

    if downscale <= 1 {
        return Window::full(full_w, full_h);
    }

    let (x1, x2) = clamp_axis(agent_loc.0, local_w, full_w);
    let (y1, y2) = clamp_axis(agent_loc.1, local_h, full_h);
    Window { x1, x2, y1, y2 }
}

fn clamp_axis(center: usize, extent: usize, limit: usize) -> (usize, usize) {
    let extent = extent.min(limit);
    let start = center as i64 - (extent / 2) as i64;
    let end = start + extent as i64;

    if start < 0 {
        (0, extent)
    } else if end > limit as i64 {
        (limit - extent, limit)
    } else {
        (start as usize, end as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_downscale_is_full_map() {
        let w = compute_window((3, 7), (10, 10), (10, 10), 1);
        assert_eq!(w, Window::full(10, 10));
    }

    #[test]
    fn test_centered_window() {
        let w = compute_window((50, 40), (20, 10), (100, 100), 2);
        assert_eq!(w.as_array(), [40, 60, 35, 45]);
    }

    #[test]
    fn test_clamps_by_shifting() {
        let low = compute_window((2, 1), (20, 20), (100, 100), 4);
        assert_eq!(low.as_array(), [0, 20, 0, 20]);

        let high = compute_window((99, 95), (20, 20), (100, 100), 4);
        assert_eq!(high.as_array(), [80, 100, 80, 100]);
    }

    #[test]
    fn test_window_always_inside_and_fixed_size() {
        let full = (37, 29);
        for downscale in 2..5 {
            let local = (full.0 / downscale, full.1 / downscale);
            for r in 0..full.0 {
                for c in 0..full.1 {
                    let w = compute_window((r, c), local, full, downscale);
                    assert_eq!(w.width(), local.0);
                    assert_eq!(w.height(), local.1);
                    assert!(w.x1 < w.x2 && w.x2 <= full.0);
                    assert!(w.y1 < w.y2 && w.y2 <= full.1);
                }
            }
        }
    }

    #[test]
    fn test_oversized_local_extent_is_capped() {
        let w = compute_window((5, 95), (30, 300), (20, 100), 2);
        assert_eq!(w.as_array(), [0, 20, 0, 100]);

        let w = compute_window((19, 0), (25, 10), (20, 100), 2);
        assert_eq!(w.as_array(), [0, 20, 0, 10]);
    }

    #[test]
    fn test_contains() {
        let w = Window {
            x1: 2,
            x2: 4,
            y1: 0,
            y2: 3,
        };
        assert!(w.contains(2, 0));
        assert!(w.contains(3, 2));
        assert!(!w.contains(4, 0));
        assert!(!w.contains(2, 3));
    }
}
