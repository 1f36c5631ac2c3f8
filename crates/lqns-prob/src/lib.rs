//! Distribution records and numerics for fork/join synchronization delays.
//!
//! This crate holds the two-moment [`Exponential`] record, the sampled-CDF
//! [`DiscretePoints`] with its fitting strategies, and [`DiscreteCDFs`], which
//! combines per-branch CDFs into the k-out-of-n completion-time distribution.

pub mod cdfs;
pub mod discrete;
pub mod exponential;
pub mod fit;
pub mod gamma;

pub use cdfs::{binomial, DiscreteCDFs, QuorumError};
pub use discrete::{closed_form_det, closed_form_geo, DiscreteError, DiscretePoints};
pub use exponential::{pr_a_lt_b, repeat_variance_term, variance_term, Erlang, Exponential};
pub use fit::{FitParams, FitQuality};
pub use gamma::{factorial, gamma_p, log_gamma, regularized_gamma_p, GammaDistribution, GammaError};
