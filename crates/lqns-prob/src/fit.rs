//! Sampling parameters and quality reporting for CDF fits.

use serde::{Deserialize, Serialize};

/// Tunables for the sampled-CDF fitting strategies.
///
/// The defaults reproduce the classic solver behaviour: sample until the
/// Chebyshev bound at 99.9% coverage, 100 steps per mean, and flag fits
/// whose sampled mean is more than 4% off (0.4% for the variance).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitParams {
    /// Coverage used for the Chebyshev sampling horizon and the early stop.
    pub chebyshev_probability: f64,
    /// Number of sampling steps per mean; the step is `mean / steps_per_mean`.
    pub steps_per_mean: f64,
    /// A sample is kept once `ΔF * t` exceeds this fraction of the mean.
    pub threshold_fraction: f64,
    /// Mean error (percent) above which a fit is reported.
    pub mean_error_pct: f64,
    /// Variance error (percent) above which a fit is reported.
    pub variance_error_pct: f64,
    /// Hard cap on sampling-loop iterations.
    pub max_samples: usize,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            chebyshev_probability: 0.999,
            steps_per_mean: 100.0,
            threshold_fraction: 0.001,
            mean_error_pct: 4.0,
            variance_error_pct: 0.4,
            max_samples: 100_000,
        }
    }
}

/// Outcome of one fit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FitQuality {
    /// Percentage error of the sampled mean against the expected mean.
    pub mean_error_pct: f64,
    /// Percentage error of the sampled variance, when the strategy checks it.
    pub variance_error_pct: Option<f64>,
    /// Number of CDF points kept.
    pub points: usize,
    /// True when an error exceeded its threshold and a warning was logged.
    pub warned: bool,
}

impl FitParams {
    /// Build a [`FitQuality`] and log a warning when it exceeds the thresholds.
    pub(crate) fn judge(
        &self,
        strategy: &'static str,
        mean_error_pct: f64,
        variance_error_pct: Option<f64>,
        points: usize,
    ) -> FitQuality {
        let mean_bad = mean_error_pct.abs() > self.mean_error_pct;
        let variance_bad = variance_error_pct.is_some_and(|v| v.abs() > self.variance_error_pct);
        let warned = mean_bad || variance_bad;
        if warned {
            tracing::warn!(
                strategy,
                mean_error_pct,
                ?variance_error_pct,
                points,
                "distribution fit is inaccurate; results may carry a significant error \
                 (raise chebyshev_probability or steps_per_mean)"
            );
        }
        FitQuality {
            mean_error_pct,
            variance_error_pct,
            points,
            warned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_object() {
        let params: FitParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params, FitParams::default());

        let params: FitParams = serde_json::from_str(r#"{"steps_per_mean": 400}"#).unwrap();
        assert_eq!(params.steps_per_mean, 400.0);
        assert_eq!(params.chebyshev_probability, 0.999);
    }

    #[test]
    fn judge_flags_large_errors() {
        let params = FitParams::default();
        assert!(!params.judge("test", 1.0, None, 3).warned);
        assert!(params.judge("test", -5.0, None, 3).warned);
        assert!(params.judge("test", 0.0, Some(0.5), 3).warned);
        assert!(!params.judge("test", 0.0, Some(0.1), 3).warned);
    }
}
