//! Quorum join expansion.
//!
//! Threads that miss the quorum keep running after the join releases its
//! successor. Their leftover work is modelled by a `localQmDelay_<n>`
//! activity that runs in parallel with the continuation:
//!
//! ```text
//! before:  ... & (K) -> X -> J
//! after:   ... & (K) -> (localQmDelay_n & X) -> (localQmDelay_n & X) -> final_n -> J
//! ```
//!
//! `final_n` takes the place of `X` in `X`'s old output list `J`. A quorum
//! join without a continuation gets a fork holding only the delay activity.

use std::collections::HashSet;

use lqns_prob::DiscretePoints;

use crate::actlist::{ListKind, ListShape};
use crate::error::GraphError;
use crate::model::{Activity, ActivityId, ListId, Model, ProcessorCall, TaskId};

impl Model {
    /// Expand every quorum join of every task. Joins expanded by an
    /// earlier call are left alone.
    ///
    /// # Returns
    /// `Err` when an activity on a quorum branch replies to its entry.
    pub fn expand_quorum_graph(&mut self) -> Result<(), GraphError> {
        if self.pragmas.disable_expanding_quorum_tree {
            return Ok(());
        }
        let mut index = self
            .lists
            .iter()
            .filter_map(|l| l.as_and_join())
            .map(|j| j.quorum_index)
            .max()
            .unwrap_or(0);

        for task in 0..self.tasks.len() {
            let joins: Vec<ListId> = self.tasks[task]
                .lists
                .iter()
                .copied()
                .filter(|&l| {
                    self.lists[l]
                        .as_and_join()
                        .is_some_and(|j| j.has_quorum() && j.quorum_index == 0)
                })
                .collect();
            for join in joins {
                self.check_quorum_replies(join)?;
                let continuation = match self.lists[join].next {
                    None => None,
                    Some(next) => match self.lists[next].kind {
                        ListKind::Fork(Some(activity)) => Some((next, activity)),
                        _ => {
                            self.report(GraphError::UnsupportedQuorumContinuation {
                                join: self.list_name(join),
                            });
                            continue;
                        }
                    },
                };
                index += 1;
                self.expand_quorum_join(task, join, index, continuation)?;
            }
        }
        Ok(())
    }

    /// Activities on the branches of a quorum join may not reply. The walk
    /// goes back from each branch through plain sequences.
    fn check_quorum_replies(&self, join: ListId) -> Result<(), GraphError> {
        let Some(and_join) = self.lists[join].as_and_join() else {
            return Ok(());
        };
        let mut seen = HashSet::new();
        for &branch in &and_join.branches {
            let mut current = Some(branch);
            while let Some(activity) = current {
                if !seen.insert(activity) {
                    break;
                }
                let a = &self.activities[activity];
                if !a.replies.is_empty() {
                    return Err(GraphError::QuorumReply {
                        activity: a.name.clone(),
                    });
                }
                current = a
                    .prev_fork
                    .filter(|&f| matches!(self.lists[f].kind, ListKind::Fork(_)))
                    .and_then(|f| self.lists[f].prev)
                    .and_then(|j| match self.lists[j].kind {
                        ListKind::Join(prev) => prev,
                        _ => None,
                    });
            }
        }
        Ok(())
    }

    fn expand_quorum_join(
        &mut self,
        task: TaskId,
        join: ListId,
        index: usize,
        continuation: Option<(ListId, ActivityId)>,
    ) -> Result<(), GraphError> {
        let submodel = self.tasks[task].submodel + 1;

        let mut delay = Activity::new(format!("localQmDelay_{index}"), task);
        delay.set_service_time(0.0);
        delay.local_quorum_delay = true;
        delay.processor_call = Some(ProcessorCall::new(submodel));
        delay.remote_quorum_delay = DiscretePoints::default().with_name(format!("remoteQmDelay_{index}"));
        let delay = self.add_activity(delay);

        let mut last = Activity::new(format!("final_{index}"), task);
        last.set_service_time(0.0);
        let last = self.add_activity(last);

        // The continuation's fork list becomes the new AND-fork.
        let fork = match continuation {
            Some((fork, _)) => {
                self.lists[fork].kind = ListKind::empty(ListShape::AndFork);
                fork
            }
            None => {
                let fork = self.add_list(task, ListShape::AndFork);
                self.act_connect(join, fork);
                fork
            }
        };
        let new_join = self.add_list(task, ListShape::AndJoin);
        self.fork_list_add(fork, delay, None)?;
        self.join_list_add(new_join, delay)?;

        if let Some((_, activity)) = continuation {
            let old_join = self.activities[activity].next_join.take();
            self.activities[activity].prev_fork = None;
            self.fork_list_add(fork, activity, None)?;
            self.join_list_add(new_join, activity)?;
            if let Some(old_join) = old_join {
                self.replace_join_member(old_join, activity, last);
            }
        }

        let final_fork = self.add_list(task, ListShape::Fork);
        self.fork_list_add(final_fork, last, None)?;
        self.act_connect(new_join, final_fork);

        if let Some(j) = self.lists[join].as_and_join_mut() {
            j.quorum_index = index;
        }
        tracing::debug!(
            join = %self.list_name(join),
            index,
            continuation = continuation.map(|(_, a)| self.activities[a].name.as_str()),
            "expanded quorum join"
        );
        Ok(())
    }

    fn replace_join_member(&mut self, list: ListId, from: ActivityId, to: ActivityId) {
        let replace = |members: &mut Vec<ActivityId>| {
            for member in members.iter_mut().filter(|m| **m == from) {
                *member = to;
            }
        };
        match &mut self.lists[list].kind {
            ListKind::Join(slot) => {
                if *slot == Some(from) {
                    *slot = Some(to);
                }
            }
            ListKind::AndJoin(j) => replace(&mut j.branches),
            ListKind::OrJoin(j) => replace(&mut j.branches),
            _ => return,
        }
        self.activities[to].next_join = Some(list);
    }
}
