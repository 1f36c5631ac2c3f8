//! Two-moment random variable record.
//!
//! [`Exponential`] carries a mean and a variance and supports the reduction
//! rules used when aggregating activity graphs: scaling for repetition,
//! addition for sequences, the mixture variance term for OR-choices, and
//! Mak's Erlang approximation for the max/min of two variables.

use std::ops::{Add, AddAssign, DivAssign, Mul, MulAssign, SubAssign};

use serde::{Deserialize, Serialize};

use crate::gamma::factorial;

/// Stage count cap for [`Exponential::erlang`] when no explicit limit is given.
pub const DEFAULT_MAX_ERLANG_STAGES: u32 = 20;

/// Mean and variance of a non-negative random variable.
///
/// The variance is never stored negative; every constructor and setter
/// clamps it at zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Exponential {
    mean: f64,
    variance: f64,
}

/// Erlang fit of an [`Exponential`]: `m` stages each with mean `a`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Erlang {
    /// Mean of one stage.
    pub a: f64,
    /// Number of stages (at least 1).
    pub m: u32,
}

fn non_negative(value: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        0.0
    }
}

impl Exponential {
    /// Construct a record, clamping a negative variance to zero.
    pub fn new(mean: f64, variance: f64) -> Self {
        Self {
            mean,
            variance: non_negative(variance),
        }
    }

    /// Record with the given mean and no variance.
    pub fn with_mean(mean: f64) -> Self {
        Self::new(mean, 0.0)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn set_mean(&mut self, mean: f64) {
        self.mean = mean;
    }

    pub fn set_variance(&mut self, variance: f64) {
        self.variance = non_negative(variance);
    }

    /// Squared coefficient of variation, zero when the mean is zero.
    pub fn cv_sqr(&self) -> f64 {
        let x2 = self.mean * self.mean;
        if x2 == 0.0 {
            0.0
        } else {
            self.variance / x2
        }
    }

    /// Fit an Erlang distribution to this record's mean and variance.
    ///
    /// Hyper-exponential records (`cv² > 1`) fall back to a single stage;
    /// records with `cv² < 1/max_stages` are truncated to `max_stages`.
    ///
    /// # Parameters
    /// - `max_stages`: Upper bound on the number of stages.
    ///
    /// # Returns
    /// Stage mean and count. A zero-mean record yields `a = 0, m = 1`.
    pub fn erlang(&self, max_stages: u32) -> Erlang {
        let x2 = self.mean * self.mean;
        if x2 == 0.0 {
            return Erlang { a: 0.0, m: 1 };
        }
        let max_stages = max_stages.max(1);
        let cv = self.variance / x2;
        let m = if cv > 1.0 {
            1
        } else if cv < 1.0 / f64::from(max_stages) {
            max_stages
        } else {
            ((1.0 / cv + 0.5).floor() as u32).clamp(1, max_stages)
        };
        Erlang {
            a: self.mean / f64::from(m),
            m,
        }
    }

    /// Replace the receiver with the max of itself and `other` (Mak, p. 264).
    ///
    /// Both operands are approximated by Erlang distributions. A zero-mean
    /// operand contributes nothing, so the other operand is returned as-is.
    pub fn max(&mut self, other: &Exponential) -> &mut Self {
        if other.mean == 0.0 {
            return self;
        }
        if self.mean == 0.0 {
            *self = *other;
            return self;
        }
        let a = self.erlang(DEFAULT_MAX_ERLANG_STAGES);
        let b = other.erlang(DEFAULT_MAX_ERLANG_STAGES);
        let m = self.mean + other.mean - ab_term(&a, &b, 0) - ab_term(&b, &a, 0);
        let v = self.mean * self.mean
            + other.mean * other.mean
            + self.variance
            + other.variance
            - m * m
            - ab_term(&a, &b, 1)
            - ab_term(&b, &a, 1);
        self.mean = m;
        self.variance = non_negative(v);
        self
    }

    /// Replace the receiver with the min of itself and `other` (Mak, eq. 9).
    ///
    /// Exact for exponential operands; the variance is taken as the square
    /// of the resulting mean.
    pub fn min(&mut self, other: &Exponential) -> &mut Self {
        self.mean = 1.0 / (1.0 / self.mean + 1.0 / other.mean);
        self.variance = non_negative(self.mean * self.mean);
        self
    }
}

impl Mul<Exponential> for f64 {
    type Output = Exponential;

    /// Scale by a repeat count; the variance scales by the square.
    fn mul(self, rhs: Exponential) -> Exponential {
        Exponential::new(rhs.mean * self, rhs.variance * self * self)
    }
}

impl MulAssign<f64> for Exponential {
    fn mul_assign(&mut self, rhs: f64) {
        self.mean *= rhs;
        self.variance *= rhs * rhs;
    }
}

impl DivAssign<f64> for Exponential {
    fn div_assign(&mut self, rhs: f64) {
        self.mean /= rhs;
        self.variance /= rhs * rhs;
    }
}

impl Add for Exponential {
    type Output = Exponential;

    fn add(self, rhs: Exponential) -> Exponential {
        Exponential::new(self.mean + rhs.mean, self.variance + rhs.variance)
    }
}

impl AddAssign for Exponential {
    fn add_assign(&mut self, rhs: Exponential) {
        self.mean += rhs.mean;
        self.variance = non_negative(self.variance + rhs.variance);
    }
}

impl AddAssign<f64> for Exponential {
    /// Shift the mean only.
    fn add_assign(&mut self, rhs: f64) {
        self.mean += rhs;
    }
}

impl SubAssign for Exponential {
    /// Remove the mean of an earlier phase. The variance is left alone:
    /// the receiver holds a total variance that cannot be split.
    fn sub_assign(&mut self, rhs: Exponential) {
        self.mean -= rhs.mean;
    }
}

/// Probability that `a` completes before `b` (Mak, eq. 8).
///
/// Only meaningful for Erlang/exponential operands.
pub fn pr_a_lt_b(a: &Exponential, b: &Exponential) -> f64 {
    if a.mean == 0.0 {
        return 1.0;
    }
    if b.mean == 0.0 {
        return 0.0;
    }
    let a = a.erlang(DEFAULT_MAX_ERLANG_STAGES);
    let b = b.erlang(DEFAULT_MAX_ERLANG_STAGES);
    ab_term(&a, &b, -1)
}

/// Pairwise OR-choice variance term (Smith, p. 178).
///
/// # Parameters
/// - `p1`, `a`: Probability and record of the first branch.
/// - `p2`, `b`: Probability and record of the second branch.
///
/// # Returns
/// A zero-mean record whose variance is `(mean_a - mean_b)^2 * p1 * p2`.
pub fn variance_term(p1: f64, a: &Exponential, p2: f64, b: &Exponential) -> Exponential {
    let difference = a.mean - b.mean;
    Exponential::new(0.0, difference * difference * (p1 * p2))
}

/// Repeat-loop variance term (Smith, p. 178).
///
/// Loop counts are geometric, so the loop contributes the square of the
/// body mean to the variance.
pub fn repeat_variance_term(body: &Exponential) -> Exponential {
    Exponential::new(0.0, body.mean * body.mean)
}

/// Shared series of the Mak max and Pr[A < B] expressions.
fn ab_term(a: &Erlang, b: &Erlang, offset: i32) -> f64 {
    let x_a = 1.0 / a.a;
    let x_b = 1.0 / b.a;
    let m = a.m as i32;
    let denominator = factorial(m - 1);
    let mut sum = factorial(m + offset) / denominator;
    let mut prod = 1.0;
    for k in 1..b.m as i32 {
        prod *= x_b / (x_a + x_b);
        sum += prod * factorial(m + k + offset) / (denominator * factorial(k));
    }
    (x_a / (x_a + x_b)).powi(m) / (x_a + x_b).powi(offset + 1) * sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9 * (1.0 + a.abs().max(b.abs()))
    }

    #[test]
    fn negative_variance_is_clamped() {
        let e = Exponential::new(1.0, -3.0);
        assert_eq!(e.variance(), 0.0);
        let mut e = Exponential::new(1.0, 1.0);
        e.set_variance(-0.5);
        assert_eq!(e.variance(), 0.0);
    }

    #[test]
    fn scaling_squares_the_variance() {
        let e = 3.0 * Exponential::new(2.0, 1.0);
        assert_eq!(e.mean(), 6.0);
        assert_eq!(e.variance(), 9.0);

        let mut d = Exponential::new(6.0, 9.0);
        d /= 3.0;
        assert_eq!(d, Exponential::new(2.0, 1.0));
    }

    #[test]
    fn subtraction_only_touches_the_mean() {
        let mut e = Exponential::new(5.0, 2.0);
        e -= Exponential::new(1.5, 7.0);
        assert_eq!(e.mean(), 3.5);
        assert_eq!(e.variance(), 2.0);
    }

    #[test]
    fn erlang_stage_selection() {
        assert_eq!(Exponential::new(0.0, 0.0).erlang(20), Erlang { a: 0.0, m: 1 });
        // cv^2 = 2 > 1 -> exponential.
        assert_eq!(Exponential::new(1.0, 2.0).erlang(20).m, 1);
        // cv^2 = 0.25 -> 4 stages.
        let e = Exponential::new(2.0, 1.0).erlang(20);
        assert_eq!(e.m, 4);
        assert!(close(e.a, 0.5));
        // Deterministic -> truncated at the stage limit.
        assert_eq!(Exponential::new(2.0, 0.0).erlang(20).m, 20);
    }

    #[test]
    fn max_of_two_exponentials_matches_closed_form() {
        // E[max(X, Y)] for iid exponential(1) is 1.5, Var is 1.25.
        let mut a = Exponential::new(1.0, 1.0);
        a.max(&Exponential::new(1.0, 1.0));
        assert!(close(a.mean(), 1.5), "mean = {}", a.mean());
        assert!(close(a.variance(), 1.25), "variance = {}", a.variance());
    }

    #[test]
    fn max_with_zero_operand_is_identity() {
        let mut a = Exponential::new(2.0, 1.0);
        a.max(&Exponential::default());
        assert_eq!(a, Exponential::new(2.0, 1.0));
        let mut z = Exponential::default();
        z.max(&Exponential::new(2.0, 1.0));
        assert_eq!(z, Exponential::new(2.0, 1.0));
    }

    #[test]
    fn min_of_two_exponentials() {
        let mut a = Exponential::new(2.0, 4.0);
        a.min(&Exponential::new(2.0, 4.0));
        assert!(close(a.mean(), 1.0));
        assert!(close(a.variance(), 1.0));
    }

    #[test]
    fn probability_a_before_b() {
        let a = Exponential::new(1.0, 1.0);
        assert!(close(pr_a_lt_b(&a, &a), 0.5));
        assert_eq!(pr_a_lt_b(&Exponential::default(), &a), 1.0);
        assert_eq!(pr_a_lt_b(&a, &Exponential::default()), 0.0);
        // Rates 1 and 3: P[A < B] = 1 / (1 + 3).
        let b = Exponential::new(1.0 / 3.0, 1.0 / 9.0);
        assert!(close(pr_a_lt_b(&a, &b), 0.25));
    }

    #[test]
    fn or_choice_variance_reproduces_mixture() {
        // 50/50 mixture of point masses at 1 and 3 has variance 1.
        let a = Exponential::with_mean(1.0);
        let b = Exponential::with_mean(3.0);
        let mut sum = 0.5 * a + 0.5 * b;
        sum += variance_term(0.5, &b, 0.5, &a);
        assert!(close(sum.mean(), 2.0));
        assert!(close(sum.variance(), 1.0));
    }

    #[test]
    fn repeat_term_is_square_of_mean() {
        assert_eq!(repeat_variance_term(&Exponential::new(3.0, 1.0)).variance(), 9.0);
    }
}
