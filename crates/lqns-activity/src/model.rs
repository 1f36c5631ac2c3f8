//! Arena of tasks, entries, activities, and precedence lists.
//!
//! Every object is addressed by its index in the owning [`Model`]. Graph
//! links are indices too, so lists and activities refer to each other
//! without shared ownership.

use indexmap::IndexSet;
use lqns_prob::{DiscretePoints, Exponential};
use serde::{Deserialize, Serialize};

use crate::actlist::{ActivityList, ListShape};
use crate::error::GraphError;
use crate::pragma::Pragmas;

/// Index of an activity in [`Model::activities`].
pub type ActivityId = usize;
/// Index of a precedence list.
pub type ListId = usize;
/// Index of an entry, including virtual and thread entries.
pub type EntryId = usize;
/// Index of a task.
pub type TaskId = usize;

/// Service-time distribution of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    #[default]
    Stochastic,
    Deterministic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    #[default]
    Rendezvous,
    SendNoReply,
    Forward,
}

/// How an entry is invoked by its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalledBy {
    #[default]
    NotCalled,
    Rendezvous,
    SendNoReply,
    OpenArrival,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryKind {
    /// Phase-based entry without activities.
    #[default]
    Standard,
    /// Entry whose work is an activity graph.
    Activity,
    /// Aggregation target for one OR or repeat branch.
    Virtual,
    /// Aggregation target for one AND-fork branch.
    Thread,
}

/// A request from an activity to an entry of another task.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub destination: String,
    pub kind: CallKind,
    /// Mean number of calls per activity execution.
    pub rate: f64,
    /// Submodel in which the call is resolved.
    pub submodel: usize,
    /// Waiting time per call, supplied by the solver.
    pub wait: f64,
}

/// The activity's request for its host processor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorCall {
    pub submodel: usize,
    /// Waiting time at the processor, supplied by the solver.
    pub wait: f64,
    pub service_time: f64,
    pub cv_sqr: f64,
}

impl ProcessorCall {
    pub fn new(submodel: usize) -> Self {
        Self {
            submodel,
            wait: 0.0,
            service_time: 0.0,
            cv_sqr: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub name: String,
    pub task: TaskId,
    pub service_time: f64,
    pub cv_sqr: f64,
    pub phase_type: PhaseType,
    pub calls: Vec<Call>,
    pub processor_call: Option<ProcessorCall>,
    wait: Vec<f64>,
    pub variance: f64,
    pub throughput: f64,
    pub(crate) prev_fork: Option<ListId>,
    pub(crate) next_join: Option<ListId>,
    pub(crate) replies: IndexSet<EntryId>,
    pub(crate) specified: bool,
    pub(crate) reachable: bool,
    pub(crate) local_quorum_delay: bool,
    /// Leftover work of threads that missed the quorum.
    pub remote_quorum_delay: DiscretePoints,
}

impl Activity {
    pub fn new(name: impl Into<String>, task: TaskId) -> Self {
        Self {
            name: name.into(),
            task,
            service_time: 0.0,
            cv_sqr: 1.0,
            phase_type: PhaseType::default(),
            calls: Vec::new(),
            processor_call: None,
            wait: Vec::new(),
            variance: 0.0,
            throughput: 0.0,
            prev_fork: None,
            next_join: None,
            replies: IndexSet::new(),
            specified: false,
            reachable: false,
            local_quorum_delay: false,
            remote_quorum_delay: DiscretePoints::default(),
        }
    }

    /// Waiting time in `submodel`, zero when never set.
    pub fn wait(&self, submodel: usize) -> f64 {
        self.wait.get(submodel).copied().unwrap_or(0.0)
    }

    pub fn set_wait(&mut self, submodel: usize, value: f64) {
        if self.wait.len() <= submodel {
            self.wait.resize(submodel + 1, 0.0);
        }
        self.wait[submodel] = value;
    }

    /// Sum of the waits over all submodels.
    pub fn elapsed_time(&self) -> f64 {
        self.wait.iter().sum()
    }

    /// Recompute the wait in `submodel` from the blocking calls resolved
    /// there and the processor call.
    ///
    /// # Returns
    /// The new wait.
    pub fn update_wait(&mut self, submodel: usize) -> f64 {
        let calls: f64 = self
            .calls
            .iter()
            .filter(|c| c.submodel == submodel && c.kind != CallKind::SendNoReply)
            .map(|c| c.rate * c.wait)
            .sum();
        let processor = self
            .processor_call
            .as_ref()
            .filter(|p| p.submodel == submodel)
            .map_or(0.0, |p| p.wait);
        let wait = calls + processor;
        self.set_wait(submodel, wait);
        wait
    }

    pub fn set_service_time(&mut self, value: f64) {
        self.service_time = value;
        self.specified = true;
    }

    /// Processor utilization: throughput times service time.
    pub fn utilization(&self) -> f64 {
        self.throughput * self.service_time
    }

    pub fn prev_fork(&self) -> Option<ListId> {
        self.prev_fork
    }

    pub fn next_join(&self) -> Option<ListId> {
        self.next_join
    }

    pub fn replies(&self) -> &IndexSet<EntryId> {
        &self.replies
    }

    pub fn replies_to(&self, entry: EntryId) -> bool {
        self.replies.contains(&entry)
    }

    pub fn is_specified(&self) -> bool {
        self.specified
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn is_local_quorum_delay(&self) -> bool {
        self.local_quorum_delay
    }
}

/// Per-phase results of an entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseResults {
    wait: Vec<f64>,
    pub variance: f64,
    pub service_time: f64,
}

static EMPTY_PHASE: PhaseResults = PhaseResults {
    wait: Vec::new(),
    variance: 0.0,
    service_time: 0.0,
};

impl PhaseResults {
    pub fn wait(&self, submodel: usize) -> f64 {
        self.wait.get(submodel).copied().unwrap_or(0.0)
    }

    pub fn wait_mut(&mut self, submodel: usize) -> &mut f64 {
        if self.wait.len() <= submodel {
            self.wait.resize(submodel + 1, 0.0);
        }
        &mut self.wait[submodel]
    }

    pub fn set_wait(&mut self, submodel: usize, value: f64) {
        *self.wait_mut(submodel) = value;
    }

    pub fn elapsed_time(&self) -> f64 {
        self.wait.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub task: TaskId,
    pub kind: EntryKind,
    pub start_activity: Option<ActivityId>,
    pub called_by: CalledBy,
    /// `phases[p - 1]` holds phase `p`; never empty.
    phases: Vec<PhaseResults>,
    pub throughput: f64,
    total: PhaseResults,
    start_time: Vec<f64>,
    start_time_variance: f64,
    join_delay: f64,
}

impl Entry {
    pub fn new(name: impl Into<String>, task: TaskId, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            task,
            kind,
            start_activity: None,
            called_by: CalledBy::default(),
            phases: vec![PhaseResults::default()],
            throughput: 0.0,
            total: PhaseResults::default(),
            start_time: Vec::new(),
            start_time_variance: 0.0,
            join_delay: 0.0,
        }
    }

    pub fn is_activity_entry(&self) -> bool {
        self.start_activity.is_some()
    }

    pub fn max_phase(&self) -> usize {
        self.phases.len()
    }

    /// Grow the phase vector to at least `p` phases.
    pub fn set_max_phase(&mut self, p: usize) {
        if self.phases.len() < p {
            self.phases.resize(p, PhaseResults::default());
        }
    }

    /// Phase `p` (1-based); phases past the last are empty.
    pub fn phase(&self, p: usize) -> &PhaseResults {
        p.checked_sub(1)
            .and_then(|i| self.phases.get(i))
            .unwrap_or(&EMPTY_PHASE)
    }

    /// Phase `p` (1-based), growing the entry when needed.
    pub fn phase_mut(&mut self, p: usize) -> &mut PhaseResults {
        let p = p.max(1);
        self.set_max_phase(p);
        &mut self.phases[p - 1]
    }

    pub fn phases(&self) -> &[PhaseResults] {
        &self.phases
    }

    pub fn total(&self) -> &PhaseResults {
        &self.total
    }

    pub(crate) fn total_mut(&mut self) -> &mut PhaseResults {
        &mut self.total
    }

    pub fn wait(&self, p: usize, submodel: usize) -> f64 {
        self.phase(p).wait(submodel)
    }

    pub fn variance(&self, p: usize) -> f64 {
        self.phase(p).variance
    }

    pub fn service_time(&self, p: usize) -> f64 {
        self.phase(p).service_time
    }

    /// Squared coefficient of variation of phase `p`; zero for an idle phase.
    pub fn cv_sqr(&self, p: usize) -> f64 {
        let phase = self.phase(p);
        let elapsed = phase.elapsed_time();
        if elapsed > 0.0 {
            phase.variance / (elapsed * elapsed)
        } else {
            0.0
        }
    }

    /// Add `value` to the service time of phase `p`. Zero is ignored so
    /// that empty phases are not created.
    pub fn add_service_time(&mut self, p: usize, value: f64) {
        if value == 0.0 {
            return;
        }
        self.phase_mut(p).service_time += value;
        self.total.service_time = self.phases.iter().map(|ph| ph.service_time).sum();
    }

    pub(crate) fn reset_service_time(&mut self) {
        for phase in &mut self.phases {
            phase.service_time = 0.0;
        }
        self.total.service_time = 0.0;
    }

    /// Fold a branch result into phase `p`: the mean for a submodel pass,
    /// the variance for the variance pass (submodel zero). Non-positive
    /// variances are dropped.
    pub fn aggregate(&mut self, submodel: usize, p: usize, addend: &Exponential) {
        if submodel != 0 {
            *self.phase_mut(p).wait_mut(submodel) += addend.mean();
        } else if addend.variance() > 0.0 {
            self.phase_mut(p).variance += addend.variance();
        }
        tracing::trace!(
            entry = %self.name,
            submodel,
            phase = p,
            mean = addend.mean(),
            variance = addend.variance(),
            "aggregate"
        );
    }

    /// Start time of a thread for `submodel`; the variance for submodel zero.
    pub fn start_time_for(&self, submodel: usize) -> f64 {
        if submodel == 0 {
            self.start_time_variance
        } else {
            self.start_time.get(submodel).copied().unwrap_or(0.0)
        }
    }

    pub(crate) fn set_start_time(&mut self, submodel: usize, value: f64) {
        if submodel == 0 {
            self.start_time_variance = value;
        } else {
            if self.start_time.len() <= submodel {
                self.start_time.resize(submodel + 1, 0.0);
            }
            self.start_time[submodel] = value;
        }
    }

    /// Start time over all submodels with its variance.
    pub fn start_time(&self) -> Exponential {
        Exponential::new(self.start_time.iter().sum(), self.start_time_variance)
    }

    /// Mean delay of the join this thread belongs to.
    pub fn join_delay(&self) -> f64 {
        self.join_delay
    }

    pub(crate) fn set_join_delay(&mut self, value: f64) {
        self.join_delay = value;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    /// Submodel in which this task is solved as a server.
    pub submodel: usize,
    pub(crate) entries: Vec<EntryId>,
    pub(crate) activities: Vec<ActivityId>,
    pub(crate) lists: Vec<ListId>,
    pub(crate) max_threads: usize,
}

impl Task {
    pub fn new(name: impl Into<String>, submodel: usize) -> Self {
        Self {
            name: name.into(),
            submodel,
            entries: Vec::new(),
            activities: Vec::new(),
            lists: Vec::new(),
            max_threads: 1,
        }
    }

    pub fn entries(&self) -> &[EntryId] {
        &self.entries
    }

    pub fn activities(&self) -> &[ActivityId] {
        &self.activities
    }

    pub fn lists(&self) -> &[ListId] {
        &self.lists
    }

    /// Largest number of concurrent threads over the task's entries.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }
}

/// All tasks of one model with their precedence graphs.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub(crate) tasks: Vec<Task>,
    pub(crate) entries: Vec<Entry>,
    pub(crate) activities: Vec<Activity>,
    pub(crate) lists: Vec<ActivityList>,
    pub(crate) pragmas: Pragmas,
    pub(crate) sync_submodel: Option<usize>,
    pub(crate) diagnostics: Vec<GraphError>,
}

impl Model {
    pub fn new(pragmas: Pragmas) -> Self {
        Self {
            pragmas,
            ..Self::default()
        }
    }

    pub fn pragmas(&self) -> &Pragmas {
        &self.pragmas
    }

    pub fn set_pragmas(&mut self, pragmas: Pragmas) {
        self.pragmas = pragmas;
    }

    /// Submodel that carries the fork/join synchronization delays.
    pub fn sync_submodel(&self) -> Option<usize> {
        self.sync_submodel
    }

    pub fn set_sync_submodel(&mut self, submodel: Option<usize>) {
        self.sync_submodel = submodel;
    }

    pub(crate) fn is_sync_submodel(&self, submodel: usize) -> bool {
        self.sync_submodel == Some(submodel)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entry(&self, id: EntryId) -> &Entry {
        &self.entries[id]
    }

    pub fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id]
    }

    pub fn activities(&self) -> &[Activity] {
        &self.activities
    }

    pub fn activity(&self, id: ActivityId) -> &Activity {
        &self.activities[id]
    }

    pub fn activity_mut(&mut self, id: ActivityId) -> &mut Activity {
        &mut self.activities[id]
    }

    pub fn list(&self, id: ListId) -> &ActivityList {
        &self.lists[id]
    }

    pub(crate) fn list_mut(&mut self, id: ListId) -> &mut ActivityList {
        &mut self.lists[id]
    }

    pub fn find_task(&self, name: &str) -> Option<TaskId> {
        self.tasks.iter().position(|t| t.name == name)
    }

    /// Entry named `name`; only task, not virtual or thread, entries are searched.
    pub fn find_entry(&self, name: &str) -> Option<EntryId> {
        self.tasks
            .iter()
            .flat_map(|t| t.entries.iter().copied())
            .find(|&e| self.entries[e].name == name)
    }

    pub fn find_activity(&self, task: TaskId, name: &str) -> Option<ActivityId> {
        self.tasks[task]
            .activities
            .iter()
            .copied()
            .find(|&a| self.activities[a].name == name)
    }

    pub fn add_task(&mut self, task: Task) -> TaskId {
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    /// Add a task entry.
    pub fn add_entry(&mut self, entry: Entry) -> EntryId {
        let task = entry.task;
        let id = self.push_entry(entry);
        self.tasks[task].entries.push(id);
        id
    }

    /// Add a virtual or thread entry that belongs to no entry list.
    pub(crate) fn push_entry(&mut self, entry: Entry) -> EntryId {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn add_activity(&mut self, activity: Activity) -> ActivityId {
        let task = activity.task;
        self.activities.push(activity);
        let id = self.activities.len() - 1;
        self.tasks[task].activities.push(id);
        id
    }

    pub(crate) fn add_list(&mut self, task: TaskId, shape: ListShape) -> ListId {
        self.lists.push(ActivityList::new(task, shape));
        let id = self.lists.len() - 1;
        self.tasks[task].lists.push(id);
        id
    }

    /// True when `activity` starts one of its task's entries.
    pub fn is_start_activity(&self, activity: ActivityId) -> bool {
        let task = self.activities[activity].task;
        self.tasks[task]
            .entries
            .iter()
            .any(|&e| self.entries[e].start_activity == Some(activity))
    }

    /// Human-readable name of a list built from its members.
    pub fn list_name(&self, id: ListId) -> String {
        let list = &self.lists[id];
        let separator = match list.shape() {
            ListShape::AndFork | ListShape::AndJoin => " & ",
            ListShape::OrFork | ListShape::OrJoin => " + ",
            ListShape::Repeat => " * ",
            ListShape::Fork | ListShape::Join => ", ",
        };
        list.kind
            .activities()
            .iter()
            .map(|&a| self.activities[a].name.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// Diagnostics collected while building, linking, and aggregating.
    pub fn diagnostics(&self) -> &[GraphError] {
        &self.diagnostics
    }

    pub fn clear_diagnostics(&mut self) {
        self.diagnostics.clear();
    }

    /// Record a diagnostic once; repeats from later passes are dropped.
    pub fn report(&mut self, error: GraphError) {
        if self.diagnostics.contains(&error) {
            return;
        }
        tracing::warn!(%error, "model diagnostic");
        self.diagnostics.push(error);
    }

    pub(crate) fn activity_names(&self, ids: &[ActivityId]) -> Vec<String> {
        ids.iter().map(|&a| self.activities[a].name.clone()).collect()
    }
}
