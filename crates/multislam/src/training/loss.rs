//! Training losses computed from collaborator predictions.

use ndarray::{ArrayView2, ArrayViewD, Axis, Zip};

/// Smallest log value, matching the usual clamp for probabilities of exactly 0 or 1.
const LOG_FLOOR: f64 = -100.0;

/// Mean cross-entropy of `logits` `[batch, classes]` against class targets.
pub fn cross_entropy(logits: ArrayView2<'_, f32>, targets: &[usize]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let total: f64 = logits
        .axis_iter(Axis(0))
        .zip(targets)
        .map(|(row, &target)| {
            let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)) as f64;
            let log_sum = row
                .iter()
                .map(|&v| (v as f64 - max).exp())
                .sum::<f64>()
                .ln()
                + max;
            let logit = row.get(target).copied().unwrap_or(f32::NAN) as f64;
            log_sum - logit
        })
        .sum();
    total / targets.len() as f64
}

/// Mean binary cross-entropy of probabilities against targets in `[0, 1]`.
pub fn binary_cross_entropy(pred: ArrayViewD<'_, f32>, target: ArrayViewD<'_, f32>) -> f64 {
    if pred.is_empty() {
        return 0.0;
    }
    let total = Zip::from(&pred).and(&target).fold(0.0f64, |acc, &p, &t| {
        let p = p as f64;
        let t = t as f64;
        let log_p = p.ln().max(LOG_FLOOR);
        let log_not_p = (1.0 - p).ln().max(LOG_FLOOR);
        acc - (t * log_p + (1.0 - t) * log_not_p)
    });
    total / pred.len() as f64
}

/// Mean squared error.
pub fn mse(pred: ArrayViewD<'_, f32>, target: ArrayViewD<'_, f32>) -> f64 {
    if pred.is_empty() {
        return 0.0;
    }
    let total = Zip::from(&pred).and(&target).fold(0.0f64, |acc, &p, &t| {
        let d = p as f64 - t as f64;
        acc + d * d
    });
    total / pred.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = arr2(&[[0.0f32, 0.0, 0.0], [1.0, 1.0, 1.0]]);
        let loss = cross_entropy(logits.view(), &[0, 2]);
        assert!((loss - 3f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_cross_entropy_prefers_correct_class() {
        let logits = arr2(&[[5.0f32, 0.0], [0.0, 5.0]]);
        let right = cross_entropy(logits.view(), &[0, 1]);
        let wrong = cross_entropy(logits.view(), &[1, 0]);
        assert!(right < 0.01);
        assert!(wrong > 4.0);
    }

    #[test]
    fn test_cross_entropy_out_of_range_target_is_nan() {
        let logits = arr2(&[[0.0f32, 1.0]]);
        assert!(cross_entropy(logits.view(), &[5]).is_nan());
    }

    #[test]
    fn test_bce() {
        let pred = arr1(&[0.5f32, 0.5]);
        let target = arr1(&[1.0f32, 0.0]);
        let loss = binary_cross_entropy(pred.view().into_dyn(), target.view().into_dyn());
        assert!((loss - 2f64.ln()).abs() < 1e-6);

        // saturated predictions are clamped instead of producing infinity
        let pred = arr1(&[0.0f32]);
        let target = arr1(&[1.0f32]);
        let loss = binary_cross_entropy(pred.view().into_dyn(), target.view().into_dyn());
        assert_eq!(loss, 100.0);
    }

    #[test]
    fn test_mse() {
        let pred = arr1(&[1.0f32, 3.0]);
        let target = arr1(&[0.0f32, 1.0]);
        assert_eq!(mse(pred.view().into_dyn(), target.view().into_dyn()), 2.5);
    }
}
