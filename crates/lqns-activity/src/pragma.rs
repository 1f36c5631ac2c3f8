//! Solver pragmas that steer quorum fitting and graph expansion.

use lqns_prob::FitParams;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PragmaError {
    #[error("Unsupported {pragma} value '{value}'; expected one of: {expected}")]
    Unsupported {
        pragma: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Distribution fitted to each branch of a quorum fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuorumDistribution {
    #[serde(rename = "threepoint")]
    ThreePoint,
    #[default]
    Gamma,
    #[serde(rename = "closedform-deterministic")]
    ClosedFormDeterministic,
    #[serde(rename = "closedform-geometric")]
    ClosedFormGeometric,
}

/// Treatment of calls made by threads still running after a quorum is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuorumDelayedCalls {
    #[default]
    KeepAll,
    AbortAll,
    #[serde(rename = "abort-local")]
    AbortLocalOnly,
    #[serde(rename = "abort-remote")]
    AbortRemoteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pragmas {
    pub quorum_distribution: QuorumDistribution,
    pub quorum_delayed_calls: QuorumDelayedCalls,
    /// Combine branch times with the analytic Erlang max instead of CDFs.
    pub exponential_paths: bool,
    /// Drop the leftover work of threads that miss the quorum.
    pub ignore_overhanging_threads: bool,
    /// Leave quorum joins unexpanded.
    pub disable_expanding_quorum_tree: bool,
    pub fit: FitParams,
}

impl Pragmas {
    pub(crate) fn keeps_delayed_calls(&self) -> bool {
        self.quorum_delayed_calls == QuorumDelayedCalls::KeepAll
    }
}

pub fn parse_quorum_distribution(raw: &str) -> Result<QuorumDistribution, PragmaError> {
    match raw {
        "threepoint" => Ok(QuorumDistribution::ThreePoint),
        "gamma" | "default" => Ok(QuorumDistribution::Gamma),
        "closedform-deterministic" => Ok(QuorumDistribution::ClosedFormDeterministic),
        "closedform-geometric" => Ok(QuorumDistribution::ClosedFormGeometric),
        other => Err(PragmaError::Unsupported {
            pragma: "quorum-distribution",
            value: other.to_string(),
            expected: "threepoint, gamma, closedform-deterministic, closedform-geometric",
        }),
    }
}

pub fn parse_quorum_delayed_calls(raw: &str) -> Result<QuorumDelayedCalls, PragmaError> {
    match raw {
        "keep-all" | "default" => Ok(QuorumDelayedCalls::KeepAll),
        "abort-all" => Ok(QuorumDelayedCalls::AbortAll),
        "abort-local" => Ok(QuorumDelayedCalls::AbortLocalOnly),
        "abort-remote" => Ok(QuorumDelayedCalls::AbortRemoteOnly),
        other => Err(PragmaError::Unsupported {
            pragma: "quorum-delayed-calls",
            value: other.to_string(),
            expected: "keep-all, abort-all, abort-local, abort-remote",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_solver_defaults() {
        let pragmas = Pragmas::default();
        assert_eq!(pragmas.quorum_distribution, QuorumDistribution::Gamma);
        assert_eq!(pragmas.quorum_delayed_calls, QuorumDelayedCalls::KeepAll);
        assert!(!pragmas.exponential_paths);
        assert_eq!(pragmas.fit.chebyshev_probability, 0.999);
    }

    #[test]
    fn parse_accepts_pragma_spellings() {
        assert_eq!(
            parse_quorum_distribution("threepoint"),
            Ok(QuorumDistribution::ThreePoint)
        );
        assert_eq!(
            parse_quorum_distribution("default"),
            Ok(QuorumDistribution::Gamma)
        );
        assert_eq!(
            parse_quorum_distribution("closedform-geometric"),
            Ok(QuorumDistribution::ClosedFormGeometric)
        );
        assert_eq!(
            parse_quorum_delayed_calls("abort-local"),
            Ok(QuorumDelayedCalls::AbortLocalOnly)
        );
    }

    #[test]
    fn parse_rejects_unknown_values() {
        let err = parse_quorum_delayed_calls("drop").unwrap_err();
        assert!(err.to_string().contains("'drop'"));
        assert!(parse_quorum_distribution("beta").is_err());
    }

    #[test]
    fn deserializes_partial_json() {
        let pragmas: Pragmas = serde_json::from_str(
            r#"{"quorum_distribution": "closedform-deterministic", "fit": {"steps_per_mean": 50.0}}"#,
        )
        .unwrap();
        assert_eq!(
            pragmas.quorum_distribution,
            QuorumDistribution::ClosedFormDeterministic
        );
        assert_eq!(pragmas.fit.steps_per_mean, 50.0);
        assert_eq!(pragmas.fit.mean_error_pct, 4.0);
    }
}
