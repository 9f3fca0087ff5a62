//! Global anomaly threshold.

use anyhow::{bail, Result};
use ndarray::{Array3, ArrayBase, Data, Dimension};
use statrs::statistics::{Data as Sample, OrderStatistics};
use tracing::info;

/// The `percentile`-th quantile (0..1) over every finite value of `anomaly`.
///
/// Uses statrs' order statistics (R-8 estimator).
pub fn global_percentile<S, D>(anomaly: &ArrayBase<S, D>, percentile: f64) -> Result<f64>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    if !(percentile > 0.0 && percentile < 1.0) {
        bail!("Percentile must be strictly between 0 and 1, got {}", percentile);
    }

    let finite: Vec<f64> = anomaly.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        bail!("No finite anomalies to threshold");
    }

    let count = finite.len();
    let mut sample = Sample::new(finite);
    let threshold = sample.quantile(percentile);
    info!(
        "Global {:.1}th percentile over {} anomalies: {:.4}",
        percentile * 100.0,
        count,
        threshold
    );
    Ok(threshold)
}

/// Whether `value` counts as a heatwave step. NaN never does.
pub fn exceeds(value: f64, threshold: f64) -> bool {
    value > threshold
}

/// Strict exceedance mask over a whole cube.
pub fn exceedance_mask(anomaly: &Array3<f64>, threshold: f64) -> Array3<bool> {
    anomaly.mapv(|v| exceeds(v, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array3};

    #[test]
    fn test_percentile_ignores_nan() {
        let mut values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        values.extend([f64::NAN; 50]);
        let data = Array1::from(values);

        let p90 = global_percentile(&data, 0.9).unwrap();
        assert!(p90 > 89.0 && p90 < 92.0, "{}", p90);

        let p50 = global_percentile(&data, 0.5).unwrap();
        assert!((p50 - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_errors() {
        let data = Array1::from(vec![f64::NAN, f64::NAN]);
        assert!(global_percentile(&data, 0.9).is_err());

        let data = Array1::from(vec![1.0, 2.0]);
        assert!(global_percentile(&data, 0.0).is_err());
        assert!(global_percentile(&data, 1.0).is_err());
    }

    #[test]
    fn test_exceedance_is_strict() {
        let anomaly = Array3::from_shape_vec((4, 1, 1), vec![0.5, 1.0, 1.5, f64::NAN]).unwrap();
        let mask = exceedance_mask(&anomaly, 1.0);
        assert_eq!(mask.iter().copied().collect::<Vec<_>>(), vec![false, false, true, false]);
    }
}
