//! Sampled cumulative distribution functions.
//!
//! A [`DiscretePoints`] pairs a two-moment record with a step-function CDF
//! given by parallel `t`/`A` arrays: `A[k]` is the probability of completion
//! by `t[k]`, and the CDF holds that value until the next point. Fork/join
//! completion times are computed by combining these step functions.

use std::ops::{AddAssign, MulAssign, SubAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exponential::Exponential;
use crate::fit::{FitParams, FitQuality};
use crate::gamma::{factorial, gamma_p, GammaDistribution};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DiscreteError {
    #[error("CDF has {times} time points but {probabilities} probabilities")]
    LengthMismatch { times: usize, probabilities: usize },
    #[error("CDF time points must be strictly increasing (index {index})")]
    NotIncreasing { index: usize },
}

/// Two-moment record with a sampled CDF.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscretePoints {
    moments: Exponential,
    t: Vec<f64>,
    a: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

/// Result of one sampling sweep over a CDF.
#[derive(Debug, Default)]
struct Sweep {
    t: Vec<f64>,
    a: Vec<f64>,
}

impl DiscretePoints {
    /// Record with the given moments and no CDF points.
    pub fn new(mean: f64, variance: f64) -> Self {
        Self::from_moments(Exponential::new(mean, variance))
    }

    pub fn from_moments(moments: Exponential) -> Self {
        Self {
            moments,
            ..Self::default()
        }
    }

    /// Deterministic completion at `at`.
    pub fn point_mass(at: f64) -> Self {
        Self {
            moments: Exponential::with_mean(at),
            t: vec![at],
            a: vec![1.0],
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn moments(&self) -> Exponential {
        self.moments
    }

    pub fn mean(&self) -> f64 {
        self.moments.mean()
    }

    pub fn variance(&self) -> f64 {
        self.moments.variance()
    }

    pub fn set_mean(&mut self, mean: f64) {
        self.moments.set_mean(mean);
    }

    pub fn set_variance(&mut self, variance: f64) {
        self.moments.set_variance(variance);
    }

    pub fn times(&self) -> &[f64] {
        &self.t
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.a
    }

    /// Number of CDF points.
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Replace the CDF points, keeping the moments.
    ///
    /// # Parameters
    /// - `t`: Strictly increasing sample times.
    /// - `a`: Cumulative probabilities, one per time.
    ///
    /// # Returns
    /// [`DiscreteError`] when the arrays differ in length or `t` is not
    /// strictly increasing; the receiver is left unchanged in that case.
    pub fn set_cdf(&mut self, t: Vec<f64>, a: Vec<f64>) -> Result<(), DiscreteError> {
        if t.len() != a.len() {
            return Err(DiscreteError::LengthMismatch {
                times: t.len(),
                probabilities: a.len(),
            });
        }
        if let Some(index) = t.windows(2).position(|w| !(w[0] < w[1])) {
            return Err(DiscreteError::NotIncreasing { index: index + 1 });
        }
        self.t = t;
        self.a = a;
        Ok(())
    }

    pub fn clear_cdf(&mut self) {
        self.t.clear();
        self.a.clear();
    }

    /// CDF value at `at`: the probability at the last point not after `at`,
    /// or `None` before the first point.
    pub fn step_value(&self, at: f64) -> Option<f64> {
        let idx = self.t.partition_point(|&x| x <= at);
        idx.checked_sub(1).map(|i| self.a[i])
    }

    /// Three-point CDF matched to the mean and variance.
    ///
    /// The moments are re-derived from the new points afterwards, so the
    /// reported errors compare the requested moments with the fitted ones.
    pub fn estimate_cdf(&mut self, params: &FitParams) -> FitQuality {
        let x = self.mean();
        let variance = self.variance();
        let std_dev = variance.sqrt();
        if x == 0.0 {
            return FitQuality {
                points: self.len(),
                ..FitQuality::default()
            };
        }
        if std_dev == 0.0 {
            self.t = vec![x];
            self.a = vec![1.0];
            return FitQuality {
                points: 1,
                ..FitQuality::default()
            };
        }

        let t1 = if x > std_dev { x - std_dev } else { 0.0 };
        let t2 = x;
        let t3 = if std_dev >= x {
            x + 2.0 * variance / x
        } else {
            x + 2.0 * std_dev
        };

        let second = variance + x * x;
        let delta = t1 * t1 * (t3 - t2) + t2 * t2 * (t1 - t3) + t3 * t3 * (t2 - t1);
        let a1 = (second * (t3 - t2) + t2 * t2 * (x - t3) + t3 * t3 * (t2 - x)) / delta;
        let a3 = (t1 * t1 * (x - t2) + t2 * t2 * (t1 - x) + second * (t2 - t1)) / delta;

        self.t = vec![t1, t2, t3];
        self.a = vec![a1, 1.0 - a3, 1.0];

        self.mean_var();
        let mean_error = 100.0 * (x - self.mean()) / x;
        let variance_error = 100.0 * (variance - self.variance()) / variance;
        params.judge("three-point", mean_error, Some(variance_error), 3)
    }

    /// Tabulate the CDF of the moment-matched gamma distribution.
    ///
    /// Sampling runs from zero in steps of `mean / steps_per_mean` up to the
    /// Chebyshev horizon `sqrt(var / (1 - p))`, stopping early once the CDF
    /// passes `p`. A point is kept only when `ΔF * t` exceeds the threshold.
    /// The moments are left as given.
    pub fn calc_gamma_points(&mut self, params: &FitParams) -> FitQuality {
        let mean = self.mean();
        let variance = self.variance();
        if variance == 0.0 {
            self.t = vec![mean];
            self.a = vec![1.0];
            return FitQuality {
                points: 1,
                ..FitQuality::default()
            };
        }
        let Ok(gamma) = GammaDistribution::from_moments(mean, variance) else {
            return FitQuality {
                points: self.len(),
                ..FitQuality::default()
            };
        };

        let horizon = (variance / (1.0 - params.chebyshev_probability)).sqrt();
        let step = mean / params.steps_per_mean;
        let threshold = mean * params.threshold_fraction;
        let sweep = sweep_cdf(params, horizon, step, threshold, true, |t| gamma.cdf(t));
        self.install(sweep);
        self.judge_sample(params, "gamma", mean, variance)
    }

    /// Exponential fit: set the variance to the squared mean and sample the gamma CDF.
    pub fn calc_exp_points(&mut self, params: &FitParams) -> FitQuality {
        let mean = self.mean();
        self.set_variance(mean * mean);
        self.calc_gamma_points(params)
    }

    /// Sample the closed-form CDF of a thread with a deterministic number of
    /// remote calls.
    ///
    /// # Parameters
    /// - `calls`: Mean number of calls to lower-level servers.
    /// - `level1`: Mean local (processor) time.
    /// - `level2`: Mean time of one remote call.
    /// - `params`: Sampling parameters.
    ///
    /// # Returns
    /// The fit report. A non-positive total mean yields a point mass at zero.
    pub fn closed_form_det_points(
        &mut self,
        calls: f64,
        level1: f64,
        level2: f64,
        params: &FitParams,
    ) -> FitQuality {
        let calc_variance = level1 * level1 / (calls + 1.0) + calls * level2 * level2;
        let calc_mean = level1 + calls * level2;
        if !(calc_mean > 0.0) {
            self.t = vec![0.0];
            self.a = vec![1.0];
            return FitQuality {
                points: 1,
                ..FitQuality::default()
            };
        }

        let horizon = calc_variance.sqrt() / (1.0 - params.chebyshev_probability);
        let step = calc_mean / params.steps_per_mean;
        let threshold = calc_mean * params.threshold_fraction;
        let theta_c = level1 / (calls + 1.0);
        let sweep = sweep_cdf(params, horizon, step, threshold, false, |t| {
            closed_form_det(t, calls, theta_c, level2)
        });

        self.install(sweep);
        self.judge_sample(params, "closed-form deterministic", calc_mean, calc_variance)
    }

    /// Sample the closed-form CDF of a thread with a geometric number of
    /// remote calls. Without remote calls the thread is exponential.
    pub fn closed_form_geo_points(
        &mut self,
        calls: f64,
        level1: f64,
        level2: f64,
        params: &FitParams,
    ) -> FitQuality {
        if calls == 0.0 || level2 == 0.0 {
            self.set_mean(level1);
            return self.calc_exp_points(params);
        }

        let calc_variance =
            level1 * level1 + ((calls + 1.0) * (calls + 1.0) - 1.0) * level2 * level2;
        let calc_mean = level1 + calls * level2;
        if !(calc_mean > 0.0) {
            self.t = vec![0.0];
            self.a = vec![1.0];
            return FitQuality {
                points: 1,
                ..FitQuality::default()
            };
        }

        let horizon = calc_variance.sqrt() / (1.0 - params.chebyshev_probability);
        let step = calc_mean / params.steps_per_mean;
        let threshold = level2 * params.threshold_fraction;
        let p = 1.0 / (calls + 1.0);
        let sweep = sweep_cdf(params, horizon, step, threshold, true, |t| {
            closed_form_geo(t, level1 * p, level2, p)
        });

        self.install(sweep);
        self.judge_sample(params, "closed-form geometric", calc_mean, calc_variance)
    }

    fn install(&mut self, sweep: Sweep) {
        self.t = sweep.t;
        self.a = sweep.a;
    }

    /// Compare the moments of the sampled CDF against the ones it was fitted to.
    fn judge_sample(&self, params: &FitParams, strategy: &'static str, mean: f64, variance: f64) -> FitQuality {
        let sampled = self.sampled_moments();
        let error = |got: f64, want: f64| if want > 0.0 { 100.0 * (got - want) / want } else { 0.0 };
        params.judge(
            strategy,
            error(sampled.mean(), mean),
            Some(error(sampled.variance(), variance)),
            self.len(),
        )
    }

    /// Insert the time points of `arg` that the receiver lacks. Each new
    /// point takes the receiver's CDF value at that time; duplicates are
    /// skipped.
    pub fn merge(&mut self, arg: &DiscretePoints) -> &mut Self {
        let mut last_a = 0.0;
        let mut j = 0;
        for &x in &arg.t {
            loop {
                if j >= self.t.len() {
                    self.t.push(x);
                    self.a.push(last_a);
                    break;
                }
                if x < self.t[j] {
                    self.t.insert(j, x);
                    self.a.insert(j, last_a);
                    break;
                }
                if x == self.t[j] {
                    break;
                }
                last_a = self.a[j];
                j += 1;
            }
        }
        self
    }

    /// `1 - (1 - F)(1 - G)`: the CDF of the minimum of independent variables.
    pub fn inverse_multiply(&mut self, arg: &DiscretePoints) -> &mut Self {
        if arg.is_empty() {
            return self;
        }
        self.merge(arg);
        self.negate();
        for (t, a) in self.t.iter().zip(self.a.iter_mut()) {
            *a *= arg.step_value(*t).map_or(1.0, |g| 1.0 - g);
        }
        self.negate()
    }

    /// Max of the receiver and `arg`.
    ///
    /// An empty receiver takes `arg` wholesale. With exponential paths the
    /// moments are combined analytically; otherwise the CDFs are multiplied
    /// and the moments re-derived.
    pub fn max(&mut self, arg: &DiscretePoints, exponential_paths: bool) -> &mut Self {
        if self.is_empty() {
            *self = arg.clone();
        } else if exponential_paths {
            self.moments.max(&arg.moments);
        } else {
            *self *= arg;
            self.mean_var();
        }
        self
    }

    /// Min of the receiver and `arg`; see [`DiscretePoints::max`].
    pub fn min(&mut self, arg: &DiscretePoints, exponential_paths: bool) -> &mut Self {
        if self.is_empty() {
            *self = arg.clone();
        } else if exponential_paths {
            self.moments.min(&arg.moments);
        } else {
            self.inverse_multiply(arg);
            self.mean_var();
        }
        self
    }

    /// Point-by-point product over the union of both time grids.
    /// Either side empty gives an empty CDF.
    pub fn point_by_point_mul(&mut self, arg: &DiscretePoints) -> &mut Self {
        if self.is_empty() || arg.is_empty() {
            self.clear_cdf();
            return self;
        }
        self.combine(arg, |x, y| x * y)
    }

    /// Point-by-point sum over the union of both time grids.
    pub fn point_by_point_add(&mut self, arg: &DiscretePoints) -> &mut Self {
        if arg.is_empty() {
            return self;
        }
        if self.is_empty() {
            *self = arg.clone();
            return self;
        }
        self.combine(arg, |x, y| x + y)
    }

    /// Merge-walk both grids; before its first point a side contributes 0,
    /// after its last point it holds its final value.
    fn combine(&mut self, arg: &DiscretePoints, op: impl Fn(f64, f64) -> f64) -> &mut Self {
        let (n, m) = (self.t.len(), arg.t.len());
        let mut t = Vec::with_capacity(n + m);
        let mut a = Vec::with_capacity(n + m);
        let (mut i, mut j) = (0, 0);
        while i < n && j < m {
            if self.t[i] == arg.t[j] {
                t.push(self.t[i]);
                a.push(op(self.a[i], arg.a[j]));
                i += 1;
                j += 1;
            } else if self.t[i] < arg.t[j] {
                let other = if j > 0 { arg.a[j - 1] } else { 0.0 };
                t.push(self.t[i]);
                a.push(op(self.a[i], other));
                i += 1;
            } else {
                let mine = if i > 0 { self.a[i - 1] } else { 0.0 };
                t.push(arg.t[j]);
                a.push(op(mine, arg.a[j]));
                j += 1;
            }
        }
        while i < n {
            t.push(self.t[i]);
            a.push(op(self.a[i], arg.a[m - 1]));
            i += 1;
        }
        while j < m {
            t.push(arg.t[j]);
            a.push(op(self.a[n - 1], arg.a[j]));
            j += 1;
        }
        self.t = t;
        self.a = a;
        self
    }

    /// `1 - F`, anchoring the CDF at `(0, 0)` first when it starts later.
    pub fn point_by_point_negate(&mut self) -> &mut Self {
        if self.t.first().is_some_and(|&t0| t0 > 0.0) {
            self.t.insert(0, 0.0);
            self.a.insert(0, 0.0);
        }
        self.negate()
    }

    /// `A = 1 - A` on the existing points.
    pub fn negate(&mut self) -> &mut Self {
        for a in &mut self.a {
            *a = 1.0 - *a;
        }
        self
    }

    /// Shift every time point by `offset`.
    pub fn shift_times(&mut self, offset: f64) -> &mut Self {
        for t in &mut self.t {
            *t += offset;
        }
        self
    }

    /// Re-derive mean and variance from the CDF increments.
    pub fn mean_var(&mut self) -> &mut Self {
        self.moments = self.sampled_moments();
        self
    }

    fn sampled_moments(&self) -> Exponential {
        let mut last = 0.0;
        let mut mean = 0.0;
        for (&t, &a) in self.t.iter().zip(&self.a) {
            mean += (a - last) * t;
            last = a;
        }
        let mut last = 0.0;
        let mut variance = 0.0;
        for (&t, &a) in self.t.iter().zip(&self.a) {
            variance += (a - last) * (t - mean) * (t - mean);
            last = a;
        }
        Exponential::new(mean, variance)
    }
}

impl MulAssign<f64> for DiscretePoints {
    /// Scale the cumulative probabilities.
    fn mul_assign(&mut self, scalar: f64) {
        for a in &mut self.a {
            *a *= scalar;
        }
    }
}

impl MulAssign<&DiscretePoints> for DiscretePoints {
    /// CDF product: the max of independent variables. An empty argument
    /// contributes nothing.
    fn mul_assign(&mut self, arg: &DiscretePoints) {
        if arg.is_empty() {
            return;
        }
        self.merge(arg);
        for (t, a) in self.t.iter().zip(self.a.iter_mut()) {
            *a *= arg.step_value(*t).unwrap_or(0.0);
        }
    }
}

impl AddAssign<Exponential> for DiscretePoints {
    fn add_assign(&mut self, rhs: Exponential) {
        self.moments += rhs;
    }
}

impl SubAssign<Exponential> for DiscretePoints {
    fn sub_assign(&mut self, rhs: Exponential) {
        self.moments -= rhs;
    }
}

/// Run the shared sampling loop used by the gamma and closed-form fits.
fn sweep_cdf(
    params: &FitParams,
    horizon: f64,
    step: f64,
    threshold: f64,
    stop_at_coverage: bool,
    cdf: impl Fn(f64) -> f64,
) -> Sweep {
    let mut sweep = Sweep::default();
    if !(step > 0.0) {
        return sweep;
    }
    let mut previous = 0.0;
    let mut value = 0.0;
    for i in 0..params.max_samples {
        let time = i as f64 * step;
        if time > horizon || (stop_at_coverage && value > params.chebyshev_probability) {
            break;
        }
        value = cdf(time);
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            tracing::trace!(time, value, "skipping out-of-range CDF sample");
            continue;
        }
        let increment = value - previous;
        if increment * time > threshold {
            sweep.t.push(time);
            sweep.a.push(value);
            previous = value;
        }
    }
    sweep
}

/// CDF at `time` of `k + 1` exponential stages with mean `theta_c` followed
/// by `k` stages with mean `theta_s`, where `k` is the integer part of
/// `calls`.
pub fn closed_form_det(time: f64, calls: f64, theta_c: f64, theta_s: f64) -> f64 {
    let k = calls as i32;
    let kf = f64::from(k);
    if theta_c == 0.0 && theta_s > 0.0 {
        return gamma_p(time, kf, theta_s);
    }
    if theta_s == 0.0 && theta_c > 0.0 {
        return gamma_p(time, kf + 1.0, theta_c);
    }
    if theta_c == 0.0 && theta_s == 0.0 {
        return 1.0;
    }
    if theta_c == theta_s {
        return gamma_p(time, 2.0 * kf + 1.0, theta_c);
    }
    // Fewer than one call: only the single local stage remains.
    if k == 0 {
        return gamma_p(time, 1.0, theta_c);
    }

    let sign = |n: i32| if n % 2 != 0 { -1.0 } else { 1.0 };
    let b = 2.0 * theta_c * theta_s / (theta_c - theta_s).abs();
    let c = (theta_c + theta_s) / (theta_c - theta_s).abs();
    let x = time / b;
    let constant = (c * c - 1.0).powi(k) * b / (factorial(k) * 2.0_f64.powi(k + 1) * theta_c);
    let capital_c = 1.0 / constant;

    let lower = |i: i32| -> f64 {
        (0..=k - i)
            .map(|j| {
                sign(j) * x.powi(k - i - j)
                    / (sign(j + 1) * (c - 1.0).powi(j + 1) * factorial(k - i - j))
            })
            .sum()
    };
    let upper = |i: i32| -> f64 {
        (0..=k - i)
            .map(|j| x.powi(k - i - j) / ((1.0 + c).powi(j + 1) * factorial(k - i - j)))
            .sum()
    };

    if theta_c > theta_s {
        let part1: f64 = (0..=k)
            .map(|i| lower(i) * sign(i) * factorial(k - 1 + i) / (factorial(i) * 2.0_f64.powi(i)))
            .sum::<f64>()
            * 2.0
            * kf
            * (x * (1.0 - c)).exp();
        let part3: f64 = (1..=k)
            .map(|i| upper(i) * factorial(k - 1 + i) / (factorial(i - 1) * 2.0_f64.powi(i)))
            .sum::<f64>()
            * sign(k)
            * 2.0
            * (-x * (1.0 + c)).exp();
        constant * (part1 + part3 + capital_c)
    } else {
        let part1: f64 = (1..=k)
            .map(|i| {
                lower(i) * sign(i) * factorial(k - 1 + i) / (factorial(i - 1) * 2.0_f64.powi(i))
            })
            .sum::<f64>()
            * -2.0
            * (x * (1.0 - c)).exp();
        let part3: f64 = (0..=k)
            .map(|i| upper(i) * factorial(k - 1 + i) / (factorial(i) * 2.0_f64.powi(i)))
            .sum::<f64>()
            * sign(k)
            * 2.0
            * kf
            * (-x * (1.0 + c)).exp();
        constant * (part1 - part3 + capital_c)
    }
}

/// CDF at `x` of a thread whose local and remote stages repeat a geometric
/// number of times with continuation probability `1 - p`.
pub fn closed_form_geo(x: f64, theta1: f64, theta2: f64, p: f64) -> f64 {
    if theta1 == 0.0 {
        return p + (1.0 - p) * (1.0 - (-p * x / theta2).exp());
    }
    let diff = (theta1 - theta2).abs();
    let sum = theta1 + theta2;
    let prod = theta1 * theta2;
    let root = (sum * sum - 4.0 * p * prod).sqrt();

    let alpha = root / diff;
    let lambda1 = 1.0 / theta1;
    let constant = p * theta2 / (alpha * diff);
    let gamma = lambda1 - sum / (2.0 * prod);
    let beta = root / (2.0 * prod);
    let slow = gamma - lambda1 - beta;
    let fast = gamma - lambda1 + beta;

    constant
        * ((gamma + beta) * (slow * x).exp() / slow - (gamma - beta) * (fast * x).exp() / fast)
        - constant * ((gamma + beta) / slow - (gamma - beta) / fast)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cdf(points: &[(f64, f64)]) -> DiscretePoints {
        let mut d = DiscretePoints::default();
        d.set_cdf(
            points.iter().map(|p| p.0).collect(),
            points.iter().map(|p| p.1).collect(),
        )
        .unwrap();
        d.mean_var();
        d
    }

    #[test]
    fn set_cdf_validates_shape() {
        let mut d = DiscretePoints::default();
        assert_eq!(
            d.set_cdf(vec![1.0, 2.0], vec![0.5]),
            Err(DiscreteError::LengthMismatch {
                times: 2,
                probabilities: 1
            })
        );
        assert_eq!(
            d.set_cdf(vec![1.0, 1.0], vec![0.5, 1.0]),
            Err(DiscreteError::NotIncreasing { index: 1 })
        );
        assert!(d.is_empty());
    }

    #[test]
    fn three_point_fit_preserves_moments() {
        let params = FitParams::default();
        for (mean, variance) in [(10.0, 4.0), (1.0, 4.0), (2.0, 4.0)] {
            let mut d = DiscretePoints::new(mean, variance);
            let quality = d.estimate_cdf(&params);
            assert_eq!(d.len(), 3);
            assert!((d.mean() - mean).abs() < 1e-9, "mean {mean}");
            assert!((d.variance() - variance).abs() < 1e-9, "variance {variance}");
            assert!(!quality.warned);
            assert_eq!(d.probabilities()[2], 1.0);
        }
    }

    #[test]
    fn three_point_deterministic_and_zero() {
        let params = FitParams::default();
        let mut d = DiscretePoints::new(5.0, 0.0);
        d.estimate_cdf(&params);
        assert_eq!(d.times(), &[5.0]);
        assert_eq!(d.probabilities(), &[1.0]);

        let mut z = DiscretePoints::new(0.0, 3.0);
        z.estimate_cdf(&params);
        assert!(z.is_empty());
    }

    #[test]
    fn gamma_fit_recovers_moments() {
        let params = FitParams::default();
        let mut d = DiscretePoints::new(10.0, 4.0);
        let quality = d.calc_gamma_points(&params);
        assert!(quality.mean_error_pct.abs() < 4.0);
        assert!(d.len() > 10);
        // The moments of the record itself are not touched.
        assert_eq!(d.mean(), 10.0);
        assert_eq!(d.variance(), 4.0);

        let mut sampled = d.clone();
        sampled.mean_var();
        assert!((sampled.mean() - 10.0).abs() / 10.0 < 0.04);
        assert!(d.probabilities().windows(2).all(|w| w[0] <= w[1]));

        // Either the sampled variance is within 0.4% or the fit was flagged.
        let variance_error = quality.variance_error_pct.unwrap();
        assert!((100.0 * (sampled.variance() - 4.0) / 4.0 - variance_error).abs() < 1e-9);
        assert!(variance_error.abs() < 0.4 || quality.warned, "{quality:?}");
    }

    #[test]
    fn truncated_gamma_tail_trips_the_variance_guard() {
        // Sampling stops at 99.9% coverage, which loses about 2% of the variance.
        let mut d = DiscretePoints::new(10.0, 4.0);
        let quality = d.calc_gamma_points(&FitParams::default());
        assert!(quality.mean_error_pct.abs() < 4.0, "{quality:?}");
        assert!(quality.variance_error_pct.unwrap() < -0.4, "{quality:?}");
        assert!(quality.warned);

        let relaxed = FitParams {
            variance_error_pct: 5.0,
            ..FitParams::default()
        };
        let mut d = DiscretePoints::new(10.0, 4.0);
        assert!(!d.calc_gamma_points(&relaxed).warned);
    }

    #[test]
    fn gamma_fit_with_zero_variance_is_a_point_mass() {
        let mut d = DiscretePoints::new(10.0, 0.0);
        let quality = d.calc_gamma_points(&FitParams::default());
        assert!(!quality.warned);
        assert_eq!(d.times(), &[10.0]);
        assert_eq!(d.probabilities(), &[1.0]);
        d.mean_var();
        assert_eq!(d.mean(), 10.0);
        assert_eq!(d.variance(), 0.0);
    }

    #[test]
    fn coarse_sampling_takes_the_warning_path() {
        let params = FitParams {
            steps_per_mean: 2.0,
            ..FitParams::default()
        };
        let mut d = DiscretePoints::new(10.0, 4.0);
        let quality = d.calc_gamma_points(&params);
        assert!(quality.warned, "{quality:?}");
    }

    #[test]
    fn exponential_fit_sets_variance() {
        let mut d = DiscretePoints::new(2.0, 0.0);
        let quality = d.calc_exp_points(&FitParams::default());
        assert_eq!(d.variance(), 4.0);
        assert!(quality.mean_error_pct.abs() < 4.0, "{quality:?}");
        assert!(quality.variance_error_pct.is_some());
    }

    #[test]
    fn closed_form_det_special_cases() {
        assert_eq!(closed_form_det(3.0, 2.0, 0.0, 0.0), 1.0);
        let expected = gamma_p(3.0, 2.0, 1.5);
        assert!((closed_form_det(3.0, 2.0, 0.0, 1.5) - expected).abs() < 1e-12);
        let expected = gamma_p(3.0, 3.0, 1.5);
        assert!((closed_form_det(3.0, 2.0, 1.5, 0.0) - expected).abs() < 1e-12);
        let expected = gamma_p(3.0, 5.0, 1.5);
        assert!((closed_form_det(3.0, 2.0, 1.5, 1.5) - expected).abs() < 1e-12);
    }

    #[test]
    fn closed_form_det_below_one_call_is_exponential() {
        let expected = 1.0 - (-2.0_f64).exp();
        assert!((closed_form_det(2.0, 0.5, 1.0, 2.0) - expected).abs() < 1e-6);
        assert!((closed_form_det(2.0, 0.5, 1.0, 0.5) - expected).abs() < 1e-6);

        let mut d = DiscretePoints::default();
        d.closed_form_det_points(0.5, 1.5, 2.0, &FitParams::default());
        assert!(!d.is_empty());
        assert!(d.probabilities().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn closed_form_det_is_hypoexponential() {
        // Two stages of mean 1 followed by one stage of mean 2, and the reverse.
        assert!((closed_form_det(2.0, 1.0, 1.0, 2.0) - 0.205159).abs() < 1e-5);
        assert!((closed_form_det(5.0, 1.0, 1.0, 2.0) - 0.725564).abs() < 1e-5);
        assert!((closed_form_det(5.0, 1.0, 2.0, 1.0) - 0.582837).abs() < 1e-5);
    }

    #[test]
    fn closed_form_fits_match_expected_mean() {
        let params = FitParams::default();
        let mut det = DiscretePoints::default();
        let quality = det.closed_form_det_points(1.0, 1.0, 2.0, &params);
        assert!(quality.mean_error_pct.abs() < 4.0, "{quality:?}");
        assert!(quality.variance_error_pct.is_some());
        assert!(!det.is_empty());

        let mut geo = DiscretePoints::default();
        let quality = geo.closed_form_geo_points(1.0, 1.0, 2.0, &params);
        assert!(quality.mean_error_pct.abs() < 4.0, "{quality:?}");
        assert!(quality.variance_error_pct.is_some());
        assert!(geo.probabilities().iter().all(|a| (0.0..=1.0).contains(a)));

        let mut zero = DiscretePoints::default();
        zero.closed_form_det_points(0.0, 0.0, 0.0, &params);
        assert_eq!(zero.times(), &[0.0]);
    }

    #[test]
    fn closed_form_geo_limits() {
        assert!(closed_form_geo(0.0, 0.5, 2.0, 0.5).abs() < 1e-12);
        assert!((closed_form_geo(40.0, 0.5, 2.0, 0.5) - 1.0).abs() < 1e-3);
        assert_eq!(closed_form_geo(0.0, 0.0, 2.0, 0.25), 0.25);
    }

    #[test]
    fn merge_inserts_with_step_values() {
        let mut d = cdf(&[(1.0, 0.2), (3.0, 1.0)]);
        d.merge(&cdf(&[(0.5, 0.1), (1.0, 0.5), (2.0, 1.0), (4.0, 1.0)]));
        assert_eq!(d.times(), &[0.5, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(d.probabilities(), &[0.0, 0.2, 0.2, 1.0, 1.0]);
    }

    #[test]
    fn product_is_cdf_of_max() {
        let mut a = cdf(&[(1.0, 0.5), (2.0, 1.0)]);
        let b = cdf(&[(1.5, 1.0)]);
        a.max(&b, false);
        assert_eq!(a.times(), &[1.0, 1.5, 2.0]);
        assert_eq!(a.probabilities(), &[0.0, 0.5, 1.0]);
        assert!((a.mean() - 1.75).abs() < 1e-12);
    }

    #[test]
    fn inverse_multiply_is_cdf_of_min() {
        let mut a = cdf(&[(1.0, 0.5), (2.0, 1.0)]);
        let b = cdf(&[(1.5, 1.0)]);
        a.min(&b, false);
        assert_eq!(a.probabilities(), &[0.5, 1.0, 1.0]);
        assert!((a.mean() - 1.25).abs() < 1e-12);
    }

    #[test]
    fn max_with_empty_receiver_copies_argument() {
        let mut a = DiscretePoints::default();
        let b = cdf(&[(1.5, 1.0)]);
        a.max(&b, false);
        assert_eq!(a, b);
    }

    #[test]
    fn point_by_point_operations() {
        let a = cdf(&[(1.0, 0.5), (3.0, 1.0)]);
        let b = cdf(&[(2.0, 0.4), (3.0, 1.0)]);

        let mut product = a.clone();
        product.point_by_point_mul(&b);
        assert_eq!(product.times(), &[1.0, 2.0, 3.0]);
        assert_eq!(product.probabilities(), &[0.0, 0.2, 1.0]);

        let mut sum = a.clone();
        sum.point_by_point_add(&b);
        assert_eq!(sum.probabilities(), &[0.5, 0.9, 2.0]);

        let mut empty = DiscretePoints::default();
        empty.point_by_point_add(&a);
        assert_eq!(empty.times(), a.times());
        let mut cleared = a.clone();
        cleared.point_by_point_mul(&DiscretePoints::default());
        assert!(cleared.is_empty());
    }

    #[test]
    fn negate_anchors_at_zero() {
        let mut a = cdf(&[(1.0, 0.25), (2.0, 1.0)]);
        a.point_by_point_negate();
        assert_eq!(a.times(), &[0.0, 1.0, 2.0]);
        assert_eq!(a.probabilities(), &[1.0, 0.75, 0.0]);
    }

    #[test]
    fn scalar_operations() {
        let mut a = cdf(&[(1.0, 0.5), (2.0, 1.0)]);
        a *= 2.0;
        assert_eq!(a.probabilities(), &[1.0, 2.0]);
        a.shift_times(0.5);
        assert_eq!(a.times(), &[1.5, 2.5]);

        let mut d = DiscretePoints::new(4.0, 1.0);
        d += Exponential::new(1.0, 2.0);
        assert_eq!(d.moments(), Exponential::new(5.0, 3.0));
        d -= Exponential::new(2.0, 2.0);
        assert_eq!(d.moments(), Exponential::new(3.0, 3.0));
    }

    #[test]
    fn exponential_paths_use_moments() {
        let mut a = DiscretePoints::point_mass(1.0);
        a.set_variance(1.0);
        let mut b = DiscretePoints::point_mass(1.0);
        b.set_variance(1.0);
        a.max(&b, true);
        assert!((a.mean() - 1.5).abs() < 1e-9);
    }
}
