//! Quorum join estimation for AND-forks.
//!
//! Each branch of an AND-fork contributes a fitted completion-time CDF. The
//! join delay is the time at which `K` of the `N` branches are done. When
//! the threads that miss the quorum keep their calls, the branch time is
//! also split into a local part (processor time) and a remote part (calls
//! to lower servers), and the difference between waiting for all branches
//! and waiting for `K` of them is charged to the `localQmDelay_<n>`
//! activity created by [`Model::expand_quorum_graph`].

use lqns_prob::{DiscreteCDFs, DiscretePoints, Exponential};

use crate::error::GraphError;
use crate::model::{ActivityId, CallKind, ListId, Model, PhaseType};
use crate::pragma::QuorumDistribution;

/// Per-branch CDFs collected while walking an AND-fork.
#[derive(Debug, Clone, Default)]
pub struct QuorumCdfs {
    /// Whole branch times.
    pub quorum: DiscreteCDFs,
    pub local: DiscreteCDFs,
    pub remote: DiscreteCDFs,
    /// A leftover-work CDF was appended to `quorum`.
    pub active: bool,
    /// Local time of branches that also make remote calls.
    pub parallel_local: f64,
    /// Local time of branches without remote calls.
    pub sequential_local: f64,
}

/// Split of one branch's time into its local and remote parts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelMeans {
    /// Total processor time.
    pub level1: f64,
    /// Mean time of one remote call.
    pub level2: f64,
    /// Mean number of remote calls.
    pub calls: f64,
}

/// Which fitting routine a branch uses.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Fit {
    ThreePoint,
    Gamma { deterministic: bool },
    ClosedFormDet,
    ClosedFormGeo,
}

impl Model {
    /// Local and remote means of an activity, as seen by its task acting
    /// as a client one submodel below its own.
    pub fn level_means(&self, activity: ActivityId) -> LevelMeans {
        let a = &self.activities[activity];
        let submodel = self.tasks[a.task].submodel + 1;

        let level1 = a
            .processor_call
            .as_ref()
            .filter(|p| p.submodel == submodel)
            .map_or(0.0, |p| p.wait);

        let blocking = a
            .calls
            .iter()
            .filter(|c| c.kind != CallKind::SendNoReply && c.submodel == submodel);
        let calls: f64 = blocking.clone().map(|c| c.rate).sum();
        // Average over servers when the activity calls more than one.
        let level2 = if calls > 0.0 {
            blocking.map(|c| c.wait * c.rate / calls).sum()
        } else {
            0.0
        };

        LevelMeans {
            level1,
            level2,
            calls,
        }
    }

    fn quorum_fit(&self, activity: ActivityId) -> Fit {
        let a = &self.activities[activity];
        let distribution = self.pragmas.quorum_distribution;
        if a.local_quorum_delay {
            return match distribution {
                QuorumDistribution::ThreePoint => Fit::ThreePoint,
                _ => Fit::Gamma {
                    deterministic: true,
                },
            };
        }
        match (a.phase_type, distribution) {
            (_, QuorumDistribution::ThreePoint) => Fit::ThreePoint,
            (PhaseType::Deterministic, QuorumDistribution::ClosedFormDeterministic) => Fit::ClosedFormDet,
            (PhaseType::Deterministic, _) => Fit::Gamma {
                deterministic: true,
            },
            (PhaseType::Stochastic, QuorumDistribution::Gamma) => Fit::Gamma {
                deterministic: false,
            },
            (PhaseType::Stochastic, _) => Fit::ClosedFormGeo,
        }
    }

    /// Fit the CDF of one AND-fork branch and add it to `cdfs`.
    ///
    /// # Parameters
    /// - `activity`: First activity of the branch.
    /// - `sum_total`: Branch time summed over the phases.
    /// - `keep`: The join is a quorum and delayed calls are kept, so the
    ///   local and remote parts are fitted as well.
    /// - `cdfs`: Collected CDFs of the fork.
    pub(crate) fn estimate_quorum_join_cdfs(
        &mut self,
        activity: ActivityId,
        mut sum_total: DiscretePoints,
        keep: bool,
        cdfs: &mut QuorumCdfs,
    ) {
        let means = self.level_means(activity);
        if means.level2 > 0.0 {
            cdfs.parallel_local += means.level1;
        } else {
            cdfs.sequential_local += means.level1;
        }
        let fit = self.quorum_fit(activity);
        let params = self.pragmas.fit;
        let LevelMeans {
            level1,
            level2,
            calls,
        } = means;

        match fit {
            Fit::ThreePoint | Fit::Gamma { .. } => {
                if keep {
                    let deterministic = match fit {
                        Fit::Gamma { deterministic } => deterministic,
                        _ => self.activities[activity].phase_type == PhaseType::Deterministic,
                    };
                    let (mut local, mut remote) = split_branch(&self.activities[activity].name, &means, deterministic, &sum_total);
                    if fit == Fit::ThreePoint {
                        local.estimate_cdf(&params);
                        remote.estimate_cdf(&params);
                    } else {
                        local.calc_gamma_points(&params);
                        remote.calc_gamma_points(&params);
                    }
                    cdfs.local.add_cdf(&local);
                    cdfs.remote.add_cdf(&remote);
                }
                if fit == Fit::ThreePoint {
                    sum_total.estimate_cdf(&params);
                } else {
                    sum_total.calc_gamma_points(&params);
                }
            }
            Fit::ClosedFormDet | Fit::ClosedFormGeo => {
                let closed_form = |points: &mut DiscretePoints, calls: f64, level1: f64, level2: f64| {
                    if fit == Fit::ClosedFormDet {
                        points.closed_form_det_points(calls, level1, level2, &params)
                    } else {
                        points.closed_form_geo_points(calls, level1, level2, &params)
                    }
                };
                if keep {
                    let mut local = DiscretePoints::default();
                    let mut remote = DiscretePoints::default();
                    closed_form(&mut local, 0.0, level1, 0.0);
                    closed_form(&mut remote, calls, 0.0, level2);
                    cdfs.local.add_cdf(&local);
                    cdfs.remote.add_cdf(&remote);
                }
                closed_form(&mut sum_total, calls, level1, level2);
            }
        }
        cdfs.quorum.add_cdf(&sum_total);

        let threepoint = fit == Fit::ThreePoint;
        let remote_delay = &mut self.activities[activity].remote_quorum_delay;
        if remote_delay.mean() > 0.0 {
            if threepoint {
                remote_delay.estimate_cdf(&params);
            } else {
                remote_delay.calc_gamma_points(&params);
            }
            cdfs.quorum.add_cdf(remote_delay);
            cdfs.active = true;
        }

        tracing::debug!(
            activity = %self.activities[activity].name,
            ?fit,
            level1,
            level2,
            calls,
            mean = sum_total.mean(),
            variance = sum_total.variance(),
            "quorum branch"
        );
    }

    /// Completion-time distribution of an AND-fork's join.
    ///
    /// A join without a quorum waits for all branches; so does a fork
    /// whose join was never found. With a leftover-work CDF in play the
    /// quorum grows by one on both sides. In the join-delay submodel the
    /// mean is also recorded on every thread entry.
    pub(crate) fn calc_quorum_k_of_n(
        &mut self,
        submodel: usize,
        fork: ListId,
        cdfs: &QuorumCdfs,
    ) -> Result<DiscretePoints, GraphError> {
        let Some(and_fork) = self.lists[fork].as_and_fork() else {
            return Ok(DiscretePoints::default());
        };
        let n = and_fork.branches.len();
        let threads = and_fork.threads.clone();
        let (k, n) = match and_fork.join.and_then(|j| self.lists[j].as_and_join()) {
            Some(join) if cdfs.active => (join.effective_quorum() + 1, n + 1),
            Some(join) => (join.effective_quorum(), n),
            None => (n, n),
        };

        let join = if self.pragmas.exponential_paths {
            if k != n {
                return Err(GraphError::NotImplemented(
                    "quorum join with exponential paths".to_string(),
                ));
            }
            let moments = cdfs.quorum.iter().fold(Exponential::default(), |mut acc, cdf| {
                acc.max(&cdf.moments());
                acc
            });
            DiscretePoints::from_moments(moments)
        } else {
            cdfs.quorum.quorum_k_of_n(k, n)?
        };
        tracing::debug!(k, n, mean = join.mean(), variance = join.variance(), "quorum of");

        if self.is_sync_submodel(submodel) {
            for thread in threads {
                self.entries[thread].set_join_delay(join.mean());
            }
        }
        Ok(join)
    }

    /// Charge the work left over by threads that miss the quorum to the
    /// fork's `localQmDelay_<n>` activity.
    ///
    /// # Parameters
    /// - `fork`: An AND-fork whose join is a quorum.
    /// - `quorum_join`: The `K`-of-`N` join distribution.
    /// - `cdfs`: Branch CDFs gathered for the join.
    /// - `p_seq`: Share of local time spent in branches that also make
    ///   remote calls.
    pub(crate) fn save_quorum_delayed_threads_service_time(
        &mut self,
        fork: ListId,
        quorum_join: &DiscretePoints,
        cdfs: &QuorumCdfs,
        p_seq: f64,
    ) -> Result<(), GraphError> {
        let Some(and_fork) = self.lists[fork].as_and_fork() else {
            return Ok(());
        };
        let n = and_fork.branches.len();
        let Some(join) = and_fork.join.and_then(|j| self.lists[j].as_and_join()) else {
            return Ok(());
        };
        let k = join.effective_quorum();
        let name = format!("localQmDelay_{}", join.quorum_index);
        let task = self.lists[fork].task;

        let difference = |cdfs: &DiscreteCDFs| -> Result<Exponential, GraphError> {
            let quorum = cdfs.quorum_k_of_n(k, n)?;
            let all = cdfs.quorum_k_of_n(n, n)?;
            Ok(join_difference(&all, &quorum))
        };
        let local = difference(&cdfs.local)?;
        let remote = difference(&cdfs.remote)?;
        let all = cdfs.quorum.quorum_k_of_n(n, n)?;
        let total = join_difference(&all, quorum_join);

        let Some(activity) = self.find_activity(task, &name) else {
            return Err(GraphError::MissingQuorumDelayActivity { name });
        };
        let ignore = self.pragmas.ignore_overhanging_threads;
        let a = &mut self.activities[activity];
        let (service_time, remote_delay) = if ignore {
            (0.0, Exponential::default())
        } else {
            (
                (1.0 - p_seq) * local.mean(),
                Exponential::new(
                    remote.mean() + local.mean() * p_seq,
                    remote.variance() + local.variance() * p_seq,
                ),
            )
        };
        a.set_service_time(service_time);
        if let Some(processor) = a.processor_call.as_mut() {
            processor.service_time = service_time;
            processor.wait = service_time;
            processor.cv_sqr = if service_time > 0.0 {
                (1.0 - p_seq) * local.variance() / (service_time * service_time)
            } else {
                1.0
            };
        }
        a.remote_quorum_delay.set_mean(remote_delay.mean());
        a.remote_quorum_delay.set_variance(remote_delay.variance());

        tracing::debug!(
            activity = %name,
            p_seq,
            service_time,
            remote_mean = remote_delay.mean(),
            remote_variance = remote_delay.variance(),
            quorum_difference = total.mean(),
            "quorum leftover work"
        );
        Ok(())
    }
}

/// Local and remote records of a branch for the fitted strategies. A
/// negative remote variance is clamped to zero.
fn split_branch(
    name: &str,
    means: &LevelMeans,
    deterministic: bool,
    sum_total: &DiscretePoints,
) -> (DiscretePoints, DiscretePoints) {
    let local_variance = if deterministic {
        // Deterministic number of exponential slices: Erlang.
        means.level1 * means.level1 / (means.calls + 1.0)
    } else {
        // Geometric number of exponential slices: exponential.
        means.level1 * means.level1
    };
    let mut remote_variance = 0.0;
    if means.calls > 0.0 {
        remote_variance = sum_total.variance() - local_variance;
    }
    if remote_variance < 0.0 {
        tracing::warn!(
            activity = name,
            variance = remote_variance,
            "negative remote variance clamped to zero"
        );
        remote_variance = 0.0;
    }
    (
        DiscretePoints::new(means.level1, local_variance),
        DiscretePoints::new(means.level2 * means.calls, remote_variance),
    )
}

/// Gap between waiting for every branch and waiting for the quorum.
fn join_difference(all: &DiscretePoints, quorum: &DiscretePoints) -> Exponential {
    Exponential::new(
        (all.mean() - quorum.mean()).abs(),
        (all.variance() + quorum.variance()).abs(),
    )
}
