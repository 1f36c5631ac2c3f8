//! Precedence list nodes.
//!
//! An activity feeds into at most one join-side list (`Join`, `AndJoin`,
//! `OrJoin`) and is entered from at most one fork-side list (`Fork`,
//! `AndFork`, `OrFork`, `Repeat`). A join-side list links forward to a
//! fork-side list through `next`; the fork side links back through `prev`.
//! The variant of a list is fixed when it is created.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{ActivityId, EntryId, ListId, TaskId};

/// Tolerance used by the OR-fork probability and reply-count checks.
pub const EPSILON: f64 = 1e-6;

/// Shape of a list, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListShape {
    Fork,
    Join,
    AndFork,
    AndJoin,
    OrFork,
    OrJoin,
    Repeat,
}

impl ListShape {
    /// True for the lists an activity is entered from.
    pub fn is_fork_side(self) -> bool {
        matches!(
            self,
            ListShape::Fork | ListShape::AndFork | ListShape::OrFork | ListShape::Repeat
        )
    }
}

impl fmt::Display for ListShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListShape::Fork => "fork",
            ListShape::Join => "join",
            ListShape::AndFork => "and-fork",
            ListShape::AndJoin => "and-join",
            ListShape::OrFork => "or-fork",
            ListShape::OrJoin => "or-join",
            ListShape::Repeat => "repeat",
        };
        f.write_str(name)
    }
}

/// How an AND-join relates to the forks that feed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    #[default]
    NotDefined,
    /// Every branch backtracks to the same AND-fork.
    InternalForkJoin,
    /// Branches come from independently started paths.
    SynchronizationPoint,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AndFork {
    pub(crate) branches: Vec<ActivityId>,
    /// Thread entry per branch, in branch order.
    pub(crate) threads: Vec<EntryId>,
    /// Matching join, found while linking.
    pub(crate) join: Option<ListId>,
    /// Enclosing fork at the time of linking.
    pub(crate) parent: Option<ListId>,
    pub join_delay: f64,
    pub join_variance: f64,
}

impl AndFork {
    pub fn branches(&self) -> &[ActivityId] {
        &self.branches
    }

    pub fn threads(&self) -> &[EntryId] {
        &self.threads
    }

    pub fn join(&self) -> Option<ListId> {
        self.join
    }

    pub fn parent(&self) -> Option<ListId> {
        self.parent
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrFork {
    pub(crate) branches: Vec<ActivityId>,
    pub(crate) probabilities: Vec<f64>,
    /// Virtual entry per branch.
    pub(crate) entries: Vec<EntryId>,
}

impl OrFork {
    pub fn branches(&self) -> &[ActivityId] {
        &self.branches
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub(crate) fn probability_sum(&self) -> f64 {
        self.probabilities.iter().sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AndJoin {
    pub(crate) branches: Vec<ActivityId>,
    pub(crate) join_type: JoinType,
    /// `K`; zero means all branches.
    pub(crate) quorum_count: usize,
    /// Matched fork per branch.
    pub(crate) fork_lists: Vec<Option<ListId>>,
    /// Originating activity per branch, for synchronization points.
    pub(crate) sources: Vec<Option<ActivityId>>,
    /// Number of the expanded quorum, zero when not expanded.
    pub(crate) quorum_index: usize,
}

impl AndJoin {
    pub fn branches(&self) -> &[ActivityId] {
        &self.branches
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn quorum_count(&self) -> usize {
        self.quorum_count
    }

    pub fn quorum_index(&self) -> usize {
        self.quorum_index
    }

    pub fn fork_lists(&self) -> &[Option<ListId>] {
        &self.fork_lists
    }

    /// A genuine quorum: `0 < K < N`.
    pub fn has_quorum(&self) -> bool {
        self.quorum_count > 0 && self.quorum_count < self.branches.len()
    }

    pub fn is_sync_point(&self) -> bool {
        self.join_type == JoinType::SynchronizationPoint
    }

    /// Quorum count with zero read as all branches.
    pub fn effective_quorum(&self) -> usize {
        if self.quorum_count == 0 {
            self.branches.len()
        } else {
            self.quorum_count
        }
    }

    /// Fix the join type. Returns false when it was already set differently.
    pub(crate) fn set_join_type(&mut self, join_type: JoinType) -> bool {
        if self.join_type == JoinType::NotDefined {
            self.join_type = join_type;
            true
        } else {
            self.join_type == join_type
        }
    }

    /// Record `activity` as the source of branch `i`. Fails when the slot
    /// holds another activity or `activity` already feeds another branch.
    pub(crate) fn add_to_src_list(&mut self, i: usize, activity: ActivityId) -> bool {
        match self.sources[i] {
            Some(existing) if existing != activity => return false,
            _ => self.sources[i] = Some(activity),
        }
        !self
            .sources
            .iter()
            .enumerate()
            .any(|(j, src)| j != i && *src == Some(activity))
    }

    pub(crate) fn push_branch(&mut self, activity: ActivityId) {
        self.branches.push(activity);
        self.fork_lists.push(None);
        self.sources.push(None);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrJoin {
    pub(crate) branches: Vec<ActivityId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Repeat {
    /// Continuation once the loop completes.
    pub(crate) exit: Option<ActivityId>,
    pub(crate) branches: Vec<ActivityId>,
    /// Mean repeat count per branch.
    pub(crate) counts: Vec<f64>,
    /// Virtual entry per branch.
    pub(crate) entries: Vec<EntryId>,
}

impl Repeat {
    pub fn exit(&self) -> Option<ActivityId> {
        self.exit
    }

    pub fn branches(&self) -> &[ActivityId] {
        &self.branches
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListKind {
    /// Single-activity fork side of a sequence.
    Fork(Option<ActivityId>),
    /// Single-activity join side of a sequence.
    Join(Option<ActivityId>),
    AndFork(AndFork),
    AndJoin(AndJoin),
    OrFork(OrFork),
    OrJoin(OrJoin),
    Repeat(Repeat),
}

impl ListKind {
    pub fn empty(shape: ListShape) -> Self {
        match shape {
            ListShape::Fork => ListKind::Fork(None),
            ListShape::Join => ListKind::Join(None),
            ListShape::AndFork => ListKind::AndFork(AndFork::default()),
            ListShape::AndJoin => ListKind::AndJoin(AndJoin::default()),
            ListShape::OrFork => ListKind::OrFork(OrFork::default()),
            ListShape::OrJoin => ListKind::OrJoin(OrJoin::default()),
            ListShape::Repeat => ListKind::Repeat(Repeat::default()),
        }
    }

    pub fn shape(&self) -> ListShape {
        match self {
            ListKind::Fork(_) => ListShape::Fork,
            ListKind::Join(_) => ListShape::Join,
            ListKind::AndFork(_) => ListShape::AndFork,
            ListKind::AndJoin(_) => ListShape::AndJoin,
            ListKind::OrFork(_) => ListShape::OrFork,
            ListKind::OrJoin(_) => ListShape::OrJoin,
            ListKind::Repeat(_) => ListShape::Repeat,
        }
    }

    /// Member activities in insertion order. A repeat list reports its
    /// loop branches followed by the exit activity.
    pub fn activities(&self) -> Vec<ActivityId> {
        match self {
            ListKind::Fork(a) | ListKind::Join(a) => a.iter().copied().collect(),
            ListKind::AndFork(f) => f.branches.clone(),
            ListKind::AndJoin(j) => j.branches.clone(),
            ListKind::OrFork(f) => f.branches.clone(),
            ListKind::OrJoin(j) => j.branches.clone(),
            ListKind::Repeat(r) => r.branches.iter().copied().chain(r.exit).collect(),
        }
    }
}

/// One node of a task's precedence graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityList {
    pub(crate) task: TaskId,
    pub(crate) prev: Option<ListId>,
    pub(crate) next: Option<ListId>,
    pub(crate) kind: ListKind,
}

impl ActivityList {
    pub fn new(task: TaskId, shape: ListShape) -> Self {
        Self {
            task,
            prev: None,
            next: None,
            kind: ListKind::empty(shape),
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn prev(&self) -> Option<ListId> {
        self.prev
    }

    pub fn next(&self) -> Option<ListId> {
        self.next
    }

    pub fn kind(&self) -> &ListKind {
        &self.kind
    }

    pub fn shape(&self) -> ListShape {
        self.kind.shape()
    }

    pub fn as_and_fork(&self) -> Option<&AndFork> {
        match &self.kind {
            ListKind::AndFork(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_and_join(&self) -> Option<&AndJoin> {
        match &self.kind {
            ListKind::AndJoin(j) => Some(j),
            _ => None,
        }
    }

    pub(crate) fn as_and_fork_mut(&mut self) -> Option<&mut AndFork> {
        match &mut self.kind {
            ListKind::AndFork(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn as_and_join_mut(&mut self) -> Option<&mut AndJoin> {
        match &mut self.kind {
            ListKind::AndJoin(j) => Some(j),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_needs_fewer_than_all_branches() {
        let mut join = AndJoin::default();
        for a in 0..3 {
            join.push_branch(a);
        }
        assert!(!join.has_quorum());
        assert_eq!(join.effective_quorum(), 3);
        join.quorum_count = 2;
        assert!(join.has_quorum());
        join.quorum_count = 3;
        assert!(!join.has_quorum());
    }

    #[test]
    fn join_type_is_fixed_once() {
        let mut join = AndJoin::default();
        assert!(join.set_join_type(JoinType::InternalForkJoin));
        assert!(join.set_join_type(JoinType::InternalForkJoin));
        assert!(!join.set_join_type(JoinType::SynchronizationPoint));
        assert_eq!(join.join_type(), JoinType::InternalForkJoin);
    }

    #[test]
    fn source_list_rejects_shared_origins() {
        let mut join = AndJoin::default();
        join.push_branch(10);
        join.push_branch(11);
        assert!(join.add_to_src_list(0, 1));
        assert!(join.add_to_src_list(0, 1));
        assert!(!join.add_to_src_list(0, 2));
        assert!(!join.add_to_src_list(1, 1));
    }

    #[test]
    fn repeat_members_end_with_exit() {
        let kind = ListKind::Repeat(Repeat {
            exit: Some(7),
            branches: vec![3, 4],
            counts: vec![2.0, 0.5],
            entries: vec![],
        });
        assert_eq!(kind.activities(), vec![3, 4, 7]);
        assert_eq!(kind.shape(), ListShape::Repeat);
        assert!(ListShape::Repeat.is_fork_side());
        assert!(!ListShape::OrJoin.is_fork_side());
    }
}
