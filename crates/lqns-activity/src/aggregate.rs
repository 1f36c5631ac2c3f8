//! Walks that fold activity results into entries.
//!
//! Every walk starts at an entry's start activity and follows `next_join`
//! links. The activities on the current path are kept on a stack so that a
//! cyclic graph stops instead of recursing forever. A reply to the entry at
//! the bottom of the entry stack moves the rest of the chain into phase 2.
//!
//! OR-fork and repeat branches are folded into a virtual entry per branch
//! and AND-fork branches into a thread entry per branch; the list then
//! combines the branch entries into the entry on top of the stack.

use std::collections::HashMap;

use lqns_prob::{repeat_variance_term, variance_term, DiscretePoints, Exponential};

use crate::actlist::{ListKind, EPSILON};
use crate::error::GraphError;
use crate::model::{ActivityId, Call, CalledBy, EntryId, ListId, Model};
use crate::quorum::QuorumCdfs;

/// Quantity pushed from activities into entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Submodel wait, or the variance when the submodel is zero.
    Wait,
    ServiceTime,
    /// Copy the entry throughput into its activities.
    Throughput,
}

/// One activity reached from an entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityVisit {
    pub activity: ActivityId,
    pub phase: usize,
    /// Visits per entry invocation.
    pub rate: f64,
}

/// A call made on the path of an entry, handed to [`Model::calls_perform`].
#[derive(Debug, Clone, Copy)]
pub struct CallVisit<'a> {
    pub entry: EntryId,
    pub activity: ActivityId,
    pub phase: usize,
    pub rate: f64,
    pub call: &'a Call,
}

/// Activities reached while following an entry for interlock analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterlockPath {
    pub visits: Vec<ActivityVisit>,
    /// Longest activity chain followed.
    pub depth: usize,
}

#[derive(Debug)]
struct Walk {
    entry_stack: Vec<EntryId>,
    activity_stack: Vec<ActivityId>,
    submodel: usize,
    payload: Payload,
}

impl Walk {
    fn new(entry: EntryId, submodel: usize, payload: Payload) -> Self {
        Self {
            entry_stack: vec![entry],
            activity_stack: Vec::new(),
            submodel,
            payload,
        }
    }

    fn top(&self) -> EntryId {
        self.entry_stack[self.entry_stack.len() - 1]
    }

    fn bottom(&self) -> EntryId {
        self.entry_stack[0]
    }
}

#[derive(Debug)]
struct VisitWalk {
    entry: EntryId,
    activity_stack: Vec<ActivityId>,
    /// Arrivals per OR-join in this walk.
    or_visits: HashMap<ListId, usize>,
    /// Follow AND-fork branches instead of only the path after the join.
    through_forks: bool,
    visits: Vec<ActivityVisit>,
    depth: usize,
}

impl VisitWalk {
    fn new(entry: EntryId, through_forks: bool) -> Self {
        Self {
            entry,
            activity_stack: Vec::new(),
            or_visits: HashMap::new(),
            through_forks,
            visits: Vec::new(),
            depth: 0,
        }
    }
}

impl Model {
    /// Count replies and total up the service time of an activity entry.
    ///
    /// Reply problems are reported; an entry called with rendezvous that
    /// generates no reply at all is accepted, since the reply then happens
    /// once every thread has finished.
    pub fn configure(&mut self, entry: EntryId) -> Result<(), GraphError> {
        let Some(start) = self.entries[entry].start_activity else {
            return Ok(());
        };
        let mut stack = Vec::new();
        let (replies, _) = self.replies_activity(entry, &mut stack, start, 1, 1.0);
        if self.entries[entry].called_by == CalledBy::Rendezvous
            && replies != 0.0
            && (replies - 1.0).abs() > EPSILON
        {
            let name = self.entries[entry].name.clone();
            self.report(GraphError::NonUnityReplies {
                entry: name,
                replies,
            });
        }

        self.entries[entry].reset_service_time();
        let mut walk = Walk::new(entry, 0, Payload::ServiceTime);
        self.aggregate_activity(&mut walk, start, 1)?;
        let total: f64 = self.entries[entry]
            .phases()
            .iter()
            .map(|ph| ph.service_time)
            .sum();
        self.entries[entry].total_mut().service_time = total;
        tracing::debug!(entry = %self.entries[entry].name, replies, service_time = total, "configured");
        Ok(())
    }

    /// Fold the activity waits of `submodel` into the entry's phases.
    ///
    /// # Parameters
    /// - `entry`: An activity entry; other entries are left alone.
    /// - `submodel`: A submodel number, never zero.
    ///
    /// # Returns
    /// The total wait of the entry in `submodel`.
    pub fn update_wait(&mut self, entry: EntryId, submodel: usize) -> Result<f64, GraphError> {
        if submodel == 0 {
            return Err(GraphError::InvalidSubmodel(submodel));
        }
        let Some(start) = self.entries[entry].start_activity else {
            return Ok(self.entries[entry].total().wait(submodel));
        };
        let max_phase = self.entries[entry].max_phase();
        for p in 1..=max_phase {
            self.entries[entry].phase_mut(p).set_wait(submodel, 0.0);
        }
        let mut walk = Walk::new(entry, submodel, Payload::Wait);
        self.aggregate_activity(&mut walk, start, 1)?;

        let e = &mut self.entries[entry];
        let total: f64 = e.phases().iter().map(|ph| ph.wait(submodel)).sum();
        e.total_mut().set_wait(submodel, total);
        tracing::trace!(entry = %e.name, submodel, total, "update wait");
        Ok(total)
    }

    /// Recompute the per-phase variances of an activity entry.
    pub fn compute_variance(&mut self, entry: EntryId) -> Result<f64, GraphError> {
        let Some(start) = self.entries[entry].start_activity else {
            return Ok(self.entries[entry].total().variance);
        };
        for p in 1..=self.entries[entry].max_phase() {
            self.entries[entry].phase_mut(p).variance = 0.0;
        }
        let mut walk = Walk::new(entry, 0, Payload::Wait);
        self.aggregate_activity(&mut walk, start, 1)?;

        let e = &mut self.entries[entry];
        let total: f64 = e.phases().iter().map(|ph| ph.variance).sum();
        e.total_mut().variance = total;
        Ok(total)
    }

    /// Set the entry throughput and push it to every reachable activity.
    pub fn set_throughput(&mut self, entry: EntryId, value: f64) -> Result<(), GraphError> {
        self.entries[entry].throughput = value;
        let Some(start) = self.entries[entry].start_activity else {
            return Ok(());
        };
        let mut walk = Walk::new(entry, 0, Payload::Throughput);
        self.aggregate_activity(&mut walk, start, 1)?;
        Ok(())
    }

    /// Number of threads that may run at once inside an entry, and raise
    /// the owning task's maximum accordingly.
    pub fn concurrent_threads(&mut self, entry: EntryId) -> usize {
        let Some(start) = self.entries[entry].start_activity else {
            return 1;
        };
        let mut walk = VisitWalk::new(entry, true);
        let n = self.threads_activity(&mut walk, start, 1);
        let task = self.entries[entry].task;
        let max_threads = &mut self.tasks[task].max_threads;
        *max_threads = (*max_threads).max(n);
        n
    }

    /// Apply `f` to every call in `submodel` made along the root path of an
    /// activity entry. Submodel zero selects every call. AND-fork branches
    /// are left to their thread entries.
    pub fn calls_perform<F>(&self, entry: EntryId, submodel: usize, mut f: F)
    where
        F: FnMut(&CallVisit<'_>),
    {
        let Some(start) = self.entries[entry].start_activity else {
            return;
        };
        let mut walk = VisitWalk::new(entry, false);
        self.visit_activity(&mut walk, start, 1, 1.0);

        for visit in &walk.visits {
            for call in &self.activities[visit.activity].calls {
                if submodel != 0 && call.submodel != submodel {
                    continue;
                }
                f(&CallVisit {
                    entry,
                    activity: visit.activity,
                    phase: visit.phase,
                    rate: visit.rate,
                    call,
                });
            }
        }
    }

    /// Every activity an entry can reach, AND-fork branches included, with
    /// the phase it runs in.
    pub fn follow_interlock(&self, entry: EntryId) -> InterlockPath {
        let Some(start) = self.entries[entry].start_activity else {
            return InterlockPath::default();
        };
        let mut walk = VisitWalk::new(entry, true);
        self.visit_activity(&mut walk, start, 1, 1.0);
        InterlockPath {
            visits: walk.visits,
            depth: walk.depth,
        }
    }

    // aggregate

    fn apply_payload(&mut self, walk: &Walk, activity: ActivityId, p: usize) {
        let entry = walk.top();
        match walk.payload {
            Payload::Wait => {
                let a = &self.activities[activity];
                let phase = self.entries[entry].phase_mut(p);
                if walk.submodel != 0 {
                    *phase.wait_mut(walk.submodel) += a.wait(walk.submodel);
                } else {
                    phase.variance += a.variance;
                }
            }
            Payload::ServiceTime => {
                let service_time = self.activities[activity].service_time;
                self.entries[entry].add_service_time(p, service_time);
            }
            Payload::Throughput => {
                self.activities[activity].throughput = self.entries[entry].throughput;
            }
        }
    }

    /// # Returns
    /// The phase the chain ends in.
    fn aggregate_activity(
        &mut self,
        walk: &mut Walk,
        activity: ActivityId,
        p: usize,
    ) -> Result<usize, GraphError> {
        if walk.activity_stack.contains(&activity) {
            return Ok(p);
        }
        self.apply_payload(walk, activity, p);

        let next_p = if self.activities[activity].replies_to(walk.bottom()) {
            2
        } else {
            p
        };
        let Some(list) = self.activities[activity].next_join else {
            return Ok(next_p);
        };
        walk.activity_stack.push(activity);
        let result = self.aggregate_list(walk, list, next_p);
        walk.activity_stack.pop();
        result
    }

    fn aggregate_list(&mut self, walk: &mut Walk, list: ListId, curr_p: usize) -> Result<usize, GraphError> {
        let next = self.lists[list].next;
        match &self.lists[list].kind {
            ListKind::Fork(Some(activity)) => self.aggregate_activity(walk, *activity, curr_p),
            ListKind::Fork(None) => Ok(curr_p),
            ListKind::Join(_) | ListKind::OrJoin(_) => match next {
                Some(next) => self.aggregate_list(walk, next, curr_p),
                None => Ok(curr_p),
            },
            // An internal join is continued by its fork once every branch is done.
            ListKind::AndJoin(join) => match next {
                Some(next) if join.is_sync_point() => self.aggregate_list(walk, next, curr_p),
                _ => Ok(curr_p),
            },
            ListKind::OrFork(_) => self.or_fork_aggregate(walk, list, curr_p),
            ListKind::AndFork(_) => self.and_fork_aggregate(walk, list, curr_p),
            ListKind::Repeat(_) => self.repeat_aggregate(walk, list, curr_p),
        }
    }

    /// Reset the part of `dst` the payload is about to rebuild.
    fn init_entry(&mut self, walk: &Walk, dst: EntryId, rate: f64) {
        let src = walk.top();
        let max_phase = self.entries[src].max_phase();
        match walk.payload {
            Payload::ServiceTime => {
                let d = &mut self.entries[dst];
                d.set_max_phase(max_phase);
                d.reset_service_time();
            }
            Payload::Throughput => {
                self.entries[dst].throughput = self.entries[src].throughput * rate;
            }
            Payload::Wait => {
                let d = &mut self.entries[dst];
                for p in 1..=max_phase.max(d.max_phase()) {
                    if walk.submodel == 0 {
                        d.phase_mut(p).variance = 0.0;
                    } else {
                        d.phase_mut(p).set_wait(walk.submodel, 0.0);
                    }
                }
            }
        }
    }

    /// Walk one branch into its own entry.
    fn aggregate_branch(
        &mut self,
        walk: &mut Walk,
        entry: EntryId,
        activity: ActivityId,
        curr_p: usize,
        rate: f64,
    ) -> Result<usize, GraphError> {
        self.init_entry(walk, entry, rate);
        walk.entry_stack.push(entry);
        let result = self.aggregate_activity(walk, activity, curr_p);
        walk.entry_stack.pop();
        result
    }

    /// Branch result in phase `p` of `entry`: elapsed time and variance for
    /// the variance pass, the submodel wait otherwise.
    fn branch_moments(&self, entry: EntryId, submodel: usize, p: usize) -> Exponential {
        let phase = self.entries[entry].phase(p);
        if submodel == 0 {
            Exponential::new(phase.elapsed_time(), phase.variance)
        } else {
            Exponential::with_mean(phase.wait(submodel))
        }
    }

    fn or_fork_aggregate(&mut self, walk: &mut Walk, list: ListId, curr_p: usize) -> Result<usize, GraphError> {
        let ListKind::OrFork(fork) = &self.lists[list].kind else {
            return Ok(curr_p);
        };
        let fork = fork.clone();
        let top = walk.top();
        let submodel = walk.submodel;
        let max_phase = self.entries[top].max_phase().max(curr_p);

        match walk.payload {
            Payload::Wait => {
                let mut sum = vec![Exponential::default(); max_phase];
                let mut branch = vec![vec![Exponential::default(); max_phase]; fork.branches.len()];
                for i in 0..fork.branches.len() {
                    self.aggregate_branch(walk, fork.entries[i], fork.branches[i], curr_p, 1.0)?;
                    let pr_i = fork.probabilities[i];
                    for p in 1..=max_phase {
                        let b = self.branch_moments(fork.entries[i], submodel, p);
                        if submodel == 0 {
                            // Skip branches whose time is unusable.
                            if !b.mean().is_finite() {
                                continue;
                            }
                            branch[i][p - 1] = b;
                            for j in 0..=i {
                                sum[p - 1] += variance_term(
                                    pr_i,
                                    &branch[i][p - 1],
                                    fork.probabilities[j],
                                    &branch[j][p - 1],
                                );
                            }
                            // Mixture: branch variances are weighted by p, not p².
                            sum[p - 1] += Exponential::new(pr_i * b.mean(), pr_i * b.variance());
                        } else {
                            sum[p - 1] += pr_i * b;
                        }
                    }
                }
                for (p, addend) in sum.iter().enumerate() {
                    self.entries[top].aggregate(submodel, p + 1, addend);
                }
            }
            Payload::ServiceTime => {
                let mut sum = vec![0.0; max_phase];
                for i in 0..fork.branches.len() {
                    self.aggregate_branch(walk, fork.entries[i], fork.branches[i], curr_p, 1.0)?;
                    for (p, s) in sum.iter_mut().enumerate() {
                        *s += fork.probabilities[i] * self.entries[fork.entries[i]].service_time(p + 1);
                    }
                }
                for (p, s) in sum.into_iter().enumerate() {
                    self.entries[top].add_service_time(p + 1, s);
                }
            }
            Payload::Throughput => {
                for i in 0..fork.branches.len() {
                    let rate = fork.probabilities[i];
                    self.aggregate_branch(walk, fork.entries[i], fork.branches[i], curr_p, rate)?;
                }
            }
        }
        Ok(curr_p)
    }

    fn and_fork_aggregate(&mut self, walk: &mut Walk, list: ListId, curr_p: usize) -> Result<usize, GraphError> {
        let Some(fork) = self.lists[list].as_and_fork().cloned() else {
            return Ok(curr_p);
        };
        let join = fork.join.and_then(|j| self.lists[j].as_and_join().cloned());
        let join_next = fork.join.and_then(|j| self.lists[j].next);
        let top = walk.top();
        let submodel = walk.submodel;
        let max_phase = self.entries[top].max_phase().max(curr_p);
        let mut next_p = curr_p;

        match walk.payload {
            Payload::Wait => {
                let keep = join.as_ref().is_some_and(|j| j.has_quorum())
                    && self.pragmas.keeps_delayed_calls();
                let tracks_join = submodel == 0 || self.is_sync_submodel(submodel);

                // Thread start time: what the parent has accumulated so far.
                let current = &self.entries[top];
                let time = current.start_time_for(submodel)
                    + (1..=max_phase)
                        .map(|p| {
                            if submodel == 0 {
                                current.variance(p)
                            } else {
                                current.wait(p, submodel)
                            }
                        })
                        .sum::<f64>();

                let mut cdfs = QuorumCdfs::default();
                let mut phase_one = Exponential::default();
                for (i, &thread) in fork.threads.iter().enumerate() {
                    let branch_p = self.aggregate_branch(walk, thread, fork.branches[i], curr_p, 1.0)?;
                    next_p = next_p.max(branch_p);
                    self.entries[thread].set_start_time(submodel, time);

                    let branch: Vec<Exponential> = (1..=max_phase)
                        .map(|p| {
                            let phase = self.entries[thread].phase(p);
                            Exponential::new(phase.elapsed_time(), phase.variance)
                        })
                        .collect();
                    let t = &mut self.entries[thread];
                    if submodel == 0 {
                        let total: f64 = t.phases().iter().map(|ph| ph.variance).sum();
                        t.total_mut().variance = total;
                    } else {
                        let total: f64 = t.phases().iter().map(|ph| ph.wait(submodel)).sum();
                        t.total_mut().set_wait(submodel, total);
                    }

                    if tracks_join {
                        let mut sum_total = DiscretePoints::default();
                        for b in &branch {
                            sum_total += *b;
                        }
                        self.estimate_quorum_join_cdfs(fork.branches[i], sum_total, keep, &mut cdfs);
                    }
                    if branch_p != curr_p {
                        phase_one = branch.get(curr_p - 1).copied().unwrap_or_default();
                    }
                }

                if tracks_join {
                    let joined = self.calc_quorum_k_of_n(submodel, list, &cdfs)?;
                    if let Some(f) = self.lists[list].as_and_fork_mut() {
                        if submodel == 0 {
                            f.join_variance = joined.variance();
                        } else {
                            f.join_delay = joined.mean();
                        }
                    }
                    tracing::debug!(
                        fork = %self.list_name(list),
                        submodel,
                        mean = joined.mean(),
                        variance = joined.variance(),
                        "fork/join delay"
                    );

                    let mut delay = joined.moments();
                    if next_p != curr_p {
                        self.entries[top].aggregate(submodel, curr_p, &phase_one);
                        delay -= phase_one;
                    }
                    self.entries[top].aggregate(submodel, next_p, &delay);

                    if keep
                        && self.is_sync_submodel(submodel)
                        && !self.pragmas.disable_expanding_quorum_tree
                    {
                        let local = cdfs.parallel_local + cdfs.sequential_local;
                        let p_seq = if local > 0.0 { cdfs.parallel_local / local } else { 0.0 };
                        self.save_quorum_delayed_threads_service_time(list, &joined, &cdfs, p_seq)?;
                    }
                }
            }
            Payload::ServiceTime => {
                let mut sum = vec![0.0; max_phase];
                for (i, &thread) in fork.threads.iter().enumerate() {
                    let branch_p = self.aggregate_branch(walk, thread, fork.branches[i], curr_p, 1.0)?;
                    next_p = next_p.max(branch_p);
                    for (p, s) in sum.iter_mut().enumerate() {
                        *s += self.entries[thread].service_time(p + 1);
                    }
                }
                for (p, s) in sum.into_iter().enumerate() {
                    self.entries[top].add_service_time(p + 1, s);
                }
            }
            Payload::Throughput => {
                for (i, &thread) in fork.threads.iter().enumerate() {
                    let branch_p = self.aggregate_branch(walk, thread, fork.branches[i], curr_p, 1.0)?;
                    next_p = next_p.max(branch_p);
                }
            }
        }

        match join_next {
            Some(next) => self.aggregate_list(walk, next, next_p),
            None => Ok(next_p),
        }
    }

    fn repeat_aggregate(&mut self, walk: &mut Walk, list: ListId, curr_p: usize) -> Result<usize, GraphError> {
        let ListKind::Repeat(repeat) = &self.lists[list].kind else {
            return Ok(curr_p);
        };
        let repeat = repeat.clone();
        let next_p = match repeat.exit {
            Some(exit) => self.aggregate_activity(walk, exit, curr_p)?,
            None => curr_p,
        };
        let top = walk.top();
        let submodel = walk.submodel;

        for (i, &branch) in repeat.branches.iter().enumerate() {
            let rate = repeat.counts[i];
            let entry = repeat.entries[i];
            self.aggregate_branch(walk, entry, branch, curr_p, rate)?;
            match walk.payload {
                Payload::Wait => {
                    for p in 1..=self.entries[top].max_phase().max(curr_p) {
                        let body = self.branch_moments(entry, submodel, p);
                        let sum = rate * body + repeat_variance_term(&body);
                        self.entries[top].aggregate(submodel, p, &sum);
                    }
                }
                Payload::ServiceTime => {
                    let service_time = rate * self.entries[entry].service_time(curr_p);
                    self.entries[top].add_service_time(curr_p, service_time);
                }
                Payload::Throughput => {}
            }
        }
        Ok(next_p)
    }

    // replies

    fn aggregate_replies(&mut self, entry: EntryId, activity: ActivityId, p: usize, rate: f64) -> f64 {
        if !self.activities[activity].replies_to(entry) {
            if p > 1 {
                self.entries[entry].set_max_phase(p);
            }
            return 0.0;
        }
        let names = || {
            (
                self.activities[activity].name.clone(),
                self.entries[entry].name.clone(),
            )
        };
        let error = match self.entries[entry].called_by {
            CalledBy::SendNoReply | CalledBy::OpenArrival => {
                let (activity, entry) = names();
                Some(GraphError::ReplyForSendNoReply { activity, entry })
            }
            _ if rate <= 0.0 => {
                let (activity, entry) = names();
                Some(GraphError::InvalidReply { activity, entry })
            }
            _ if p > 1 => {
                let (activity, entry) = names();
                Some(GraphError::DuplicateReply { activity, entry })
            }
            _ => None,
        };
        match error {
            Some(error) => {
                self.report(error);
                0.0
            }
            None => rate,
        }
    }

    /// Sum the reply rate to `entry` along a chain.
    ///
    /// # Returns
    /// The reply sum and the phase the chain ends in.
    fn replies_activity(
        &mut self,
        entry: EntryId,
        stack: &mut Vec<ActivityId>,
        activity: ActivityId,
        p: usize,
        rate: f64,
    ) -> (f64, usize) {
        if stack.contains(&activity) {
            return (0.0, p);
        }
        let mut sum = self.aggregate_replies(entry, activity, p, rate);
        let mut next_p = if self.activities[activity].replies_to(entry) {
            2
        } else {
            p
        };
        if let Some(list) = self.activities[activity].next_join {
            stack.push(activity);
            let (s, np) = self.replies_list(entry, stack, list, next_p, rate);
            stack.pop();
            sum += s;
            next_p = np;
        }
        (sum, next_p)
    }

    fn replies_list(
        &mut self,
        entry: EntryId,
        stack: &mut Vec<ActivityId>,
        list: ListId,
        curr_p: usize,
        rate: f64,
    ) -> (f64, usize) {
        let next = self.lists[list].next;
        match self.lists[list].kind.clone() {
            ListKind::Fork(Some(activity)) => self.replies_activity(entry, stack, activity, curr_p, rate),
            ListKind::Fork(None) => (0.0, curr_p),
            ListKind::Join(_) | ListKind::OrJoin(_) => match next {
                Some(next) => self.replies_list(entry, stack, next, curr_p, rate),
                None => (0.0, curr_p),
            },
            ListKind::AndJoin(join) => match next {
                Some(next) if join.is_sync_point() => self.replies_list(entry, stack, next, curr_p, rate),
                _ => (0.0, curr_p),
            },
            ListKind::OrFork(fork) => {
                let mut sum = 0.0;
                let mut next_p = curr_p;
                for (&branch, &pr) in fork.branches.iter().zip(&fork.probabilities) {
                    let (s, branch_p) = self.replies_activity(entry, stack, branch, curr_p, rate * pr);
                    sum += s;
                    next_p = next_p.max(branch_p);
                }
                (sum, next_p)
            }
            ListKind::AndFork(fork) => {
                let join = fork.join.map(|j| &self.lists[j]);
                // Replies from quorum branches are not allowed.
                let branch_rate = if join.and_then(|j| j.as_and_join()).is_some_and(|j| j.has_quorum()) {
                    0.0
                } else {
                    rate
                };
                let join_next = join.and_then(|j| j.next);
                let mut sum = 0.0;
                let mut next_p = curr_p;
                for &branch in &fork.branches {
                    let (s, branch_p) = self.replies_activity(entry, stack, branch, curr_p, branch_rate);
                    sum += s;
                    next_p = next_p.max(branch_p);
                }
                match join_next {
                    Some(next) => {
                        let (s, np) = self.replies_list(entry, stack, next, next_p, rate);
                        (sum + s, np)
                    }
                    None => {
                        self.entries[entry].set_max_phase(next_p);
                        (sum, next_p)
                    }
                }
            }
            ListKind::Repeat(repeat) => {
                let (mut sum, next_p) = match repeat.exit {
                    Some(exit) => self.replies_activity(entry, stack, exit, curr_p, rate),
                    None => (0.0, curr_p),
                };
                // Loop bodies may not reply.
                for &branch in &repeat.branches {
                    sum += self.replies_activity(entry, stack, branch, curr_p, 0.0).0;
                }
                (sum, next_p)
            }
        }
    }

    // visits

    /// # Returns
    /// The phase the chain ends in.
    fn visit_activity(&self, walk: &mut VisitWalk, activity: ActivityId, p: usize, rate: f64) -> usize {
        if walk.activity_stack.contains(&activity) {
            return p;
        }
        walk.visits.push(ActivityVisit {
            activity,
            phase: p,
            rate,
        });
        let next_p = if self.activities[activity].replies_to(walk.entry) {
            2
        } else {
            p
        };
        let Some(list) = self.activities[activity].next_join else {
            walk.depth = walk.depth.max(walk.activity_stack.len() + 1);
            return next_p;
        };
        walk.activity_stack.push(activity);
        walk.depth = walk.depth.max(walk.activity_stack.len());
        let next_p = self.visit_list(walk, list, next_p, rate);
        walk.activity_stack.pop();
        next_p
    }

    fn visit_list(&self, walk: &mut VisitWalk, list: ListId, curr_p: usize, rate: f64) -> usize {
        let next = self.lists[list].next;
        match &self.lists[list].kind {
            ListKind::Fork(Some(activity)) => self.visit_activity(walk, *activity, curr_p, rate),
            ListKind::Fork(None) => curr_p,
            ListKind::Join(_) => match next {
                Some(next) => self.visit_list(walk, next, curr_p, rate),
                None => curr_p,
            },
            ListKind::OrJoin(join) => {
                let Some(next) = next else {
                    return curr_p;
                };
                if walk.through_forks {
                    // Continue once, after the last branch arrives.
                    let visits = walk.or_visits.entry(list).or_insert(0);
                    *visits += 1;
                    if *visits < join.branches.len() {
                        return curr_p;
                    }
                    walk.or_visits.remove(&list);
                }
                self.visit_list(walk, next, curr_p, rate)
            }
            ListKind::AndJoin(join) => match next {
                Some(next) if join.is_sync_point() => self.visit_list(walk, next, curr_p, rate),
                _ => curr_p,
            },
            ListKind::OrFork(fork) => fork
                .branches
                .iter()
                .zip(&fork.probabilities)
                .fold(curr_p, |next_p, (&branch, &pr)| {
                    next_p.max(self.visit_activity(walk, branch, curr_p, rate * pr))
                }),
            ListKind::AndFork(fork) => {
                let mut next_p = curr_p;
                if walk.through_forks {
                    for &branch in &fork.branches {
                        next_p = next_p.max(self.visit_activity(walk, branch, curr_p, rate));
                    }
                }
                match fork.join.and_then(|j| self.lists[j].next) {
                    Some(next) => self.visit_list(walk, next, next_p, rate),
                    None => next_p,
                }
            }
            ListKind::Repeat(repeat) => {
                let next_p = match repeat.exit {
                    Some(exit) => self.visit_activity(walk, exit, curr_p, rate),
                    None => curr_p,
                };
                for (&branch, &count) in repeat.branches.iter().zip(&repeat.counts) {
                    self.visit_activity(walk, branch, curr_p, rate * count);
                }
                next_p
            }
        }
    }

    // concurrent threads

    fn threads_activity(&self, walk: &mut VisitWalk, activity: ActivityId, n: usize) -> usize {
        if walk.activity_stack.contains(&activity) {
            return n;
        }
        let Some(list) = self.activities[activity].next_join else {
            return n;
        };
        walk.activity_stack.push(activity);
        let n = self.threads_list(walk, list, n);
        walk.activity_stack.pop();
        n
    }

    fn threads_list(&self, walk: &mut VisitWalk, list: ListId, n: usize) -> usize {
        let next = self.lists[list].next;
        match &self.lists[list].kind {
            ListKind::Fork(Some(activity)) => self.threads_activity(walk, *activity, n),
            ListKind::Fork(None) => n,
            ListKind::Join(_) => next.map_or(n, |next| self.threads_list(walk, next, n)),
            ListKind::AndJoin(join) => match next {
                Some(next) if join.is_sync_point() => self.threads_list(walk, next, n),
                _ => n,
            },
            ListKind::OrJoin(join) => {
                let Some(next) = next else {
                    return n;
                };
                let visits = walk.or_visits.entry(list).or_insert(0);
                *visits += 1;
                if *visits == join.branches.len() {
                    walk.or_visits.remove(&list);
                    self.threads_list(walk, next, n)
                } else {
                    n
                }
            }
            ListKind::OrFork(fork) => fork
                .branches
                .iter()
                .fold(n, |acc, &branch| acc.max(self.threads_activity(walk, branch, n))),
            ListKind::AndFork(fork) => {
                let m: usize = fork
                    .branches
                    .iter()
                    .map(|&branch| self.threads_activity(walk, branch, 1))
                    .sum();
                // The forking thread is one of the branches.
                let n = n.max((n + m).saturating_sub(1));
                match fork.join.and_then(|j| self.lists[j].next) {
                    Some(next) => self.threads_list(walk, next, n),
                    None => n,
                }
            }
            ListKind::Repeat(repeat) => {
                let mut n = match repeat.exit {
                    Some(exit) => self.threads_activity(walk, exit, n),
                    None => n,
                };
                for &branch in &repeat.branches {
                    n = n.max(self.threads_activity(walk, branch, n));
                }
                n
            }
        }
    }
}
