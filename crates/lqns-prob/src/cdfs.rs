//! Collections of branch CDFs and the k-out-of-n completion time.

use num::bigint::BigInt;
use num::traits::{One, ToPrimitive, Zero};
use thiserror::Error;

use crate::discrete::DiscretePoints;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QuorumError {
    #[error("Invalid quorum: K={k} of N={n} (need 1 <= K <= N)")]
    InvalidQuorum { k: usize, n: usize },
    #[error("Quorum over N={expected} branches needs {expected} CDFs, collection holds {actual}")]
    CollectionSize { expected: usize, actual: usize },
    #[error("Binomial coefficient C({n},{k}) does not fit in an f64")]
    PrecisionOverflow { n: u64, k: u64 },
}

/// Exact binomial coefficient C(n, k).
///
/// # Parameters
/// - `n`: Set size.
/// - `k`: Subset size.
///
/// # Returns
/// `C(n, k)` as a `BigInt`, zero when `k > n`.
pub fn binomial(n: u64, k: u64) -> BigInt {
    if k > n {
        return BigInt::zero();
    }
    let k = k.min(n - k);
    let mut result = BigInt::one();
    for i in 0..k {
        result *= BigInt::from(n - i);
        result /= BigInt::from(i + 1);
    }
    result
}

/// Ordered per-branch CDFs of one AND-fork, indexed by branch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscreteCDFs {
    cdfs: Vec<DiscretePoints>,
}

impl DiscreteCDFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a copy of a branch CDF.
    pub fn add_cdf(&mut self, cdf: &DiscretePoints) {
        self.cdfs.push(cdf.clone());
    }

    pub fn len(&self) -> usize {
        self.cdfs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cdfs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscretePoints> {
        self.cdfs.iter()
    }

    /// Distribution of the time at which at least `k` of the `n` branches
    /// have completed.
    ///
    /// With `f(i, n)` the sum over all `i`-subsets of the product of their
    /// CDFs (built by the recurrence `f(i, m) = f(i-1, m-1)·F_m + f(i, m-1)`),
    /// the result is `Σ_{i=k}^{n} (-1)^{i-k} C(i-1, k-1) f(i, n)`. Branches
    /// without CDF points are treated as complete at time zero.
    ///
    /// # Parameters
    /// - `k`: Quorum count, `1 <= k <= n`.
    /// - `n`: Number of branches; must equal the collection size.
    ///
    /// # Returns
    /// The joint CDF with mean and variance re-derived from its points.
    pub fn quorum_k_of_n(&self, k: usize, n: usize) -> Result<DiscretePoints, QuorumError> {
        if k == 0 || k > n {
            return Err(QuorumError::InvalidQuorum { k, n });
        }
        if self.cdfs.len() != n {
            return Err(QuorumError::CollectionSize {
                expected: n,
                actual: self.cdfs.len(),
            });
        }

        let branches: Vec<DiscretePoints> = self
            .cdfs
            .iter()
            .map(|cdf| {
                if cdf.is_empty() {
                    DiscretePoints::point_mass(0.0)
                } else {
                    cdf.clone()
                }
            })
            .collect();

        // table[i] holds f(i, m) for the branches seen so far; filled left to right.
        let mut table: Vec<DiscretePoints> = vec![DiscretePoints::default(); n + 1];
        for (m, branch) in branches.iter().enumerate().map(|(m, b)| (m + 1, b)) {
            for i in (1..=m).rev() {
                let mut term = if i == 1 {
                    branch.clone()
                } else {
                    let mut term = table[i - 1].clone();
                    term.point_by_point_mul(branch);
                    term
                };
                if i < m {
                    term.point_by_point_add(&table[i]);
                }
                table[i] = term;
            }
        }

        let mut total = DiscretePoints::default();
        for i in k..=n {
            let coefficient = binomial((i - 1) as u64, (k - 1) as u64);
            let coefficient = coefficient.to_f64().ok_or(QuorumError::PrecisionOverflow {
                n: (i - 1) as u64,
                k: (k - 1) as u64,
            })?;
            let sign = if (i - k) % 2 == 1 { -1.0 } else { 1.0 };
            let mut term = table[i].clone();
            term *= sign * coefficient;
            total.point_by_point_add(&term);
        }
        total.mean_var();
        tracing::trace!(k, n, mean = total.mean(), variance = total.variance(), "quorum join");
        Ok(total)
    }
}

impl FromIterator<DiscretePoints> for DiscreteCDFs {
    fn from_iter<I: IntoIterator<Item = DiscretePoints>>(iter: I) -> Self {
        Self {
            cdfs: iter.into_iter().collect(),
        }
    }
}
