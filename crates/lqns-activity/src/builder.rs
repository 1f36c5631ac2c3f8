//! Model descriptions and translation into the precedence-graph arena.
//!
//! Translation runs in two passes per task. The first pass visits every
//! activity in declaration order and creates the lists it belongs to, adding
//! all members of a list the first time one of them is seen. Join-side lists
//! that declare a successor are remembered in a pending-connection table, and
//! the second pass wires them once every list exists.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::actlist::{ListKind, ListShape};
use crate::error::GraphError;
use crate::model::{
    Activity, ActivityId, Call, CallKind, CalledBy, Entry, EntryKind, ListId, Model, PhaseType,
    ProcessorCall, Task, TaskId,
};
use crate::pragma::Pragmas;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDescription {
    pub tasks: Vec<TaskDescription>,
}

impl ModelDescription {
    /// Parse a description from its JSON form.
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDescription {
    pub name: String,
    /// Submodel in which the task is a server.
    pub submodel: usize,
    pub entries: Vec<EntryDescription>,
    pub activities: Vec<ActivityDescription>,
    pub lists: Vec<ListDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryDescription {
    pub name: String,
    pub called_by: CalledBy,
    pub start_activity: Option<String>,
    /// Service time per phase, for entries without activities.
    pub phases: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityDescription {
    pub name: String,
    /// Absent when the input never assigns a service time.
    pub service_time: Option<f64>,
    pub cv_sqr: f64,
    pub phase_type: PhaseType,
    pub calls: Vec<CallDescription>,
    /// Submodel of the host processor, when the activity uses one.
    pub processor: Option<usize>,
    /// Names of the entries this activity replies to.
    pub replies: Vec<String>,
}

impl Default for ActivityDescription {
    fn default() -> Self {
        Self {
            name: String::new(),
            service_time: None,
            cv_sqr: 1.0,
            phase_type: PhaseType::default(),
            calls: Vec::new(),
            processor: None,
            replies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDescription {
    pub destination: String,
    #[serde(default)]
    pub kind: CallKind,
    pub rate: f64,
    #[serde(default)]
    pub submodel: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListMember {
    pub activity: String,
    /// Branch probability (OR-fork) or mean repeat count (repeat). The
    /// repeat member without one is the exit.
    #[serde(default)]
    pub parameter: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListDescription {
    pub id: String,
    pub kind: ListShape,
    pub members: Vec<ListMember>,
    /// Fork-side list that follows this join-side list.
    #[serde(default)]
    pub next: Option<String>,
    /// Quorum count of an AND-join; zero means all branches.
    #[serde(default)]
    pub quorum: usize,
}

impl Model {
    /// Translate a description into a model. Input errors are recorded in
    /// [`Model::diagnostics`]; only contract violations are returned.
    pub fn from_description(
        description: &ModelDescription,
        pragmas: Pragmas,
    ) -> Result<Model, GraphError> {
        let mut model = Model::new(pragmas);
        for task in &description.tasks {
            model.add_task_description(task)?;
        }
        Ok(model)
    }

    pub fn add_task_description(&mut self, description: &TaskDescription) -> Result<TaskId, GraphError> {
        let task = self.add_task(Task::new(description.name.clone(), description.submodel));

        for ed in &description.entries {
            let mut entry = Entry::new(ed.name.clone(), task, EntryKind::Standard);
            entry.called_by = ed.called_by;
            for (i, &service_time) in ed.phases.iter().enumerate() {
                entry.add_service_time(i + 1, service_time);
            }
            self.add_entry(entry);
        }

        for ad in &description.activities {
            let mut activity = Activity::new(ad.name.clone(), task);
            activity.cv_sqr = ad.cv_sqr;
            activity.phase_type = ad.phase_type;
            if let Some(service_time) = ad.service_time {
                activity.set_service_time(service_time);
            }
            activity.calls = ad
                .calls
                .iter()
                .map(|c| Call {
                    destination: c.destination.clone(),
                    kind: c.kind,
                    rate: c.rate,
                    submodel: c.submodel,
                    wait: 0.0,
                })
                .collect();
            activity.processor_call = ad.processor.map(|submodel| {
                let mut call = ProcessorCall::new(submodel);
                call.service_time = activity.service_time;
                call.cv_sqr = activity.cv_sqr;
                call
            });
            self.add_activity(activity);
        }

        for ed in &description.entries {
            let Some(start) = &ed.start_activity else {
                continue;
            };
            let entry = self.task_entry(task, &ed.name);
            match (entry, self.find_activity(task, start)) {
                (Some(entry), Some(activity)) => {
                    let entry = &mut self.entries[entry];
                    entry.start_activity = Some(activity);
                    entry.kind = EntryKind::Activity;
                }
                _ => self.report(GraphError::NotDefined {
                    kind: "activity",
                    name: start.clone(),
                }),
            }
        }

        for ad in &description.activities {
            let Some(activity) = self.find_activity(task, &ad.name) else {
                continue;
            };
            for reply in &ad.replies {
                match self.task_entry(task, reply) {
                    Some(entry) => {
                        self.activities[activity].replies.insert(entry);
                    }
                    None => self.report(GraphError::NotDefined {
                        kind: "entry",
                        name: reply.clone(),
                    }),
                }
            }
        }

        let mut builder = GraphBuilder::new(self, task, description);
        builder.add_activity_lists()?;
        builder.complete_connections()?;
        Ok(task)
    }

    fn task_entry(&self, task: TaskId, name: &str) -> Option<usize> {
        self.tasks[task]
            .entries
            .iter()
            .copied()
            .find(|&e| self.entries[e].name == name)
    }

    /// Append `activity` to the join-side list `list` and make the list its
    /// output.
    pub(crate) fn join_list_add(&mut self, list: ListId, activity: ActivityId) -> Result<(), GraphError> {
        let shape = self.lists[list].shape();
        if shape.is_fork_side() {
            return Err(GraphError::WrongListKind {
                expected: ListShape::Join,
                found: shape,
            });
        }
        if self.activities[activity].next_join.is_some() {
            self.report(GraphError::DuplicateJoin {
                activity: self.activities[activity].name.clone(),
            });
            return Ok(());
        }
        match &mut self.lists[list].kind {
            ListKind::Join(slot @ None) => *slot = Some(activity),
            ListKind::Join(Some(_)) => {
                return Err(GraphError::WrongListKind {
                    expected: ListShape::AndJoin,
                    found: ListShape::Join,
                })
            }
            ListKind::AndJoin(join) => join.push_branch(activity),
            ListKind::OrJoin(join) => join.branches.push(activity),
            _ => {
                return Err(GraphError::WrongListKind {
                    expected: ListShape::Join,
                    found: shape,
                })
            }
        }
        self.activities[activity].next_join = Some(list);
        Ok(())
    }

    /// Append `activity` to the fork-side list `list`.
    ///
    /// # Parameters
    /// - `list`: A fork, AND-fork, OR-fork, or repeat list.
    /// - `activity`: The member to add.
    /// - `parameter`: OR-fork probability or repeat count; `None` marks the
    ///   exit of a repeat list.
    ///
    /// # Returns
    /// `Err` only when `list` is a join-side list. Input errors are reported
    /// and the activity is left out.
    pub(crate) fn fork_list_add(
        &mut self,
        list: ListId,
        activity: ActivityId,
        parameter: Option<f64>,
    ) -> Result<(), GraphError> {
        let shape = self.lists[list].shape();
        if !shape.is_fork_side() {
            return Err(GraphError::WrongListKind {
                expected: ListShape::Fork,
                found: shape,
            });
        }
        let name = self.activities[activity].name.clone();
        if self.activities[activity].prev_fork.is_some() {
            self.report(GraphError::DuplicateFork { activity: name });
            return Ok(());
        }
        if self.is_start_activity(activity) {
            self.report(GraphError::IsStartActivity { activity: name });
            return Ok(());
        }

        let task = self.lists[list].task;
        let branch_entry = match shape {
            ListShape::AndFork => Some(EntryKind::Thread),
            ListShape::OrFork => Some(EntryKind::Virtual),
            ListShape::Repeat if parameter.is_some() => Some(EntryKind::Virtual),
            _ => None,
        }
        .map(|kind| {
            let mut entry = Entry::new(name.clone(), task, kind);
            entry.start_activity = Some(activity);
            self.push_entry(entry)
        });

        match &mut self.lists[list].kind {
            ListKind::Fork(slot @ None) => *slot = Some(activity),
            ListKind::Fork(Some(_)) => {
                return Err(GraphError::WrongListKind {
                    expected: ListShape::AndFork,
                    found: ListShape::Fork,
                })
            }
            ListKind::AndFork(fork) => {
                fork.branches.push(activity);
                fork.threads.extend(branch_entry);
            }
            ListKind::OrFork(fork) => {
                fork.branches.push(activity);
                fork.probabilities.push(parameter.unwrap_or(0.0));
                fork.entries.extend(branch_entry);
            }
            ListKind::Repeat(repeat) => match parameter {
                Some(count) => {
                    repeat.branches.push(activity);
                    repeat.counts.push(count);
                    repeat.entries.extend(branch_entry);
                }
                None if repeat.exit.is_none() => repeat.exit = Some(activity),
                None => {
                    self.report(GraphError::DuplicateFork { activity: name });
                    return Ok(());
                }
            },
            _ => {
                return Err(GraphError::WrongListKind {
                    expected: ListShape::Fork,
                    found: shape,
                })
            }
        }
        self.activities[activity].prev_fork = Some(list);
        Ok(())
    }

    /// Link a join-side list to the fork-side list that follows it.
    pub(crate) fn act_connect(&mut self, join: ListId, fork: ListId) {
        self.lists[join].next = Some(fork);
        self.lists[fork].prev = Some(join);
    }
}

/// Per-task translation state, discarded once the connections are complete.
pub struct GraphBuilder<'a> {
    model: &'a mut Model,
    task: TaskId,
    description: &'a TaskDescription,
    /// Lists already translated, by declared id.
    processed: IndexMap<String, ListId>,
    /// Pending `join id -> fork id` connections.
    connections: IndexMap<String, String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(model: &'a mut Model, task: TaskId, description: &'a TaskDescription) -> Self {
        Self {
            model,
            task,
            description,
            processed: IndexMap::new(),
            connections: IndexMap::new(),
        }
    }

    /// First pass: create every list an activity belongs to, join side
    /// before fork side.
    pub fn add_activity_lists(&mut self) -> Result<(), GraphError> {
        let description = self.description;
        for activity in &description.activities {
            let member_of = |fork_side: bool| {
                description.lists.iter().filter(move |l| {
                    l.kind.is_fork_side() == fork_side
                        && l.members.iter().any(|m| m.activity == activity.name)
                })
            };
            for list in member_of(false).chain(member_of(true)) {
                self.translate(list)?;
            }
        }
        Ok(())
    }

    /// Second pass: wire every pending connection. A successor that no
    /// activity pass reached is translated here.
    pub fn complete_connections(&mut self) -> Result<(), GraphError> {
        while !self.connections.is_empty() {
            let pending = std::mem::take(&mut self.connections);
            for (join_id, fork_id) in &pending {
                self.connect(join_id, fork_id)?;
            }
        }
        Ok(())
    }

    fn connect(&mut self, join_id: &str, fork_id: &str) -> Result<(), GraphError> {
        let description = self.description;
        let Some(&join) = self.processed.get(join_id) else {
            return Ok(());
        };
        let fork = match self.processed.get(fork_id) {
            Some(&fork) => Some(fork),
            None => match description.lists.iter().find(|l| l.id == fork_id) {
                Some(list) => self.translate(list)?,
                None => {
                    self.model.report(GraphError::NotDefined {
                        kind: "list",
                        name: fork_id.to_string(),
                    });
                    None
                }
            },
        };
        let Some(fork) = fork else {
            return Ok(());
        };
        let found = self.model.lists[fork].shape();
        if !found.is_fork_side() {
            return Err(GraphError::WrongListKind {
                expected: ListShape::Fork,
                found,
            });
        }
        self.model.act_connect(join, fork);
        Ok(())
    }

    fn translate(&mut self, list: &ListDescription) -> Result<Option<ListId>, GraphError> {
        if let Some(&id) = self.processed.get(&list.id) {
            return Ok(Some(id));
        }
        let id = self.model.add_list(self.task, list.kind);
        self.processed.insert(list.id.clone(), id);
        tracing::trace!(task = self.task, list = %list.id, kind = %list.kind, "translate list");

        for member in &list.members {
            let Some(activity) = self.model.find_activity(self.task, &member.activity) else {
                self.model.report(GraphError::NotDefined {
                    kind: "activity",
                    name: member.activity.clone(),
                });
                continue;
            };
            if list.kind.is_fork_side() {
                self.model.fork_list_add(id, activity, member.parameter)?;
            } else {
                self.model.join_list_add(id, activity)?;
            }
        }

        if let Some(join) = self.model.lists[id].as_and_join_mut() {
            join.quorum_count = list.quorum;
        }
        if let Some(next) = &list.next {
            self.connections.insert(list.id.clone(), next.clone());
        }
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(name: &str) -> ActivityDescription {
        ActivityDescription {
            name: name.into(),
            service_time: Some(1.0),
            ..ActivityDescription::default()
        }
    }

    fn member(name: &str, parameter: Option<f64>) -> ListMember {
        ListMember {
            activity: name.into(),
            parameter,
        }
    }

    fn sequence_task() -> TaskDescription {
        TaskDescription {
            name: "t".into(),
            submodel: 1,
            entries: vec![EntryDescription {
                name: "e".into(),
                called_by: CalledBy::Rendezvous,
                start_activity: Some("a".into()),
                phases: vec![],
            }],
            activities: vec![activity("a"), activity("b")],
            lists: vec![
                ListDescription {
                    id: "j".into(),
                    kind: ListShape::Join,
                    members: vec![member("a", None)],
                    next: Some("f".into()),
                    quorum: 0,
                },
                ListDescription {
                    id: "f".into(),
                    kind: ListShape::Fork,
                    members: vec![member("b", None)],
                    next: None,
                    quorum: 0,
                },
            ],
        }
    }

    #[test]
    fn sequence_is_connected() {
        let model = Model::from_description(
            &ModelDescription {
                tasks: vec![sequence_task()],
            },
            Pragmas::default(),
        )
        .unwrap();
        let a = model.find_activity(0, "a").unwrap();
        let b = model.find_activity(0, "b").unwrap();
        let join = model.activity(a).next_join().unwrap();
        let fork = model.activity(b).prev_fork().unwrap();
        assert_eq!(model.list(join).next(), Some(fork));
        assert_eq!(model.list(fork).prev(), Some(join));
        assert!(model.diagnostics().is_empty());
        assert_eq!(model.entry(0).start_activity, Some(a));
    }

    #[test]
    fn start_activity_cannot_be_forked_to() {
        let mut task = sequence_task();
        task.lists[1].members.push(member("a", None));
        task.lists[1].kind = ListShape::OrFork;
        task.lists[1].members[0].parameter = Some(1.0);
        let model = Model::from_description(
            &ModelDescription { tasks: vec![task] },
            Pragmas::default(),
        )
        .unwrap();
        assert_eq!(
            model.diagnostics(),
            &[GraphError::IsStartActivity {
                activity: "a".into()
            }]
        );
    }

    #[test]
    fn activity_in_two_join_lists_is_reported() {
        let mut task = sequence_task();
        task.lists.push(ListDescription {
            id: "j2".into(),
            kind: ListShape::OrJoin,
            members: vec![member("a", None), member("b", None)],
            next: None,
            quorum: 0,
        });
        let model = Model::from_description(
            &ModelDescription { tasks: vec![task] },
            Pragmas::default(),
        )
        .unwrap();
        assert!(model.diagnostics().contains(&GraphError::DuplicateJoin {
            activity: "a".into()
        }));
    }

    #[test]
    fn undefined_member_is_reported() {
        let mut task = sequence_task();
        task.lists[1].members.push(member("ghost", None));
        let model = Model::from_description(
            &ModelDescription { tasks: vec![task] },
            Pragmas::default(),
        )
        .unwrap();
        assert_eq!(
            model.diagnostics(),
            &[GraphError::NotDefined {
                kind: "activity",
                name: "ghost".into()
            }]
        );
    }

    #[test]
    fn repeat_member_without_count_is_the_exit() {
        let mut task = sequence_task();
        task.activities.push(activity("c"));
        task.lists[1] = ListDescription {
            id: "f".into(),
            kind: ListShape::Repeat,
            members: vec![member("b", Some(2.5)), member("c", None)],
            next: None,
            quorum: 0,
        };
        let model = Model::from_description(
            &ModelDescription { tasks: vec![task] },
            Pragmas::default(),
        )
        .unwrap();
        let b = model.find_activity(0, "b").unwrap();
        let c = model.find_activity(0, "c").unwrap();
        let fork = model.activity(b).prev_fork().unwrap();
        let ListKind::Repeat(repeat) = model.list(fork).kind() else {
            panic!("expected a repeat list");
        };
        assert_eq!(repeat.exit(), Some(c));
        assert_eq!(repeat.counts(), &[2.5]);
        assert_eq!(model.activity(c).prev_fork(), Some(fork));
    }

    #[test]
    fn join_side_successor_is_a_contract_violation() {
        let mut task = sequence_task();
        task.lists.push(ListDescription {
            id: "x".into(),
            kind: ListShape::OrJoin,
            members: vec![],
            next: None,
            quorum: 0,
        });
        task.lists[0].next = Some("x".into());
        let err = Model::from_description(
            &ModelDescription { tasks: vec![task] },
            Pragmas::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::WrongListKind { .. }));
    }

    #[test]
    fn adding_to_the_wrong_side_is_an_error() {
        let mut model = Model::new(Pragmas::default());
        let task = model.add_task(Task::new("t", 1));
        let a = model.add_activity(Activity::new("a", task));
        let fork = model.add_list(task, ListShape::AndFork);
        let join = model.add_list(task, ListShape::OrJoin);

        assert_eq!(
            model.join_list_add(fork, a),
            Err(GraphError::WrongListKind {
                expected: ListShape::Join,
                found: ListShape::AndFork,
            })
        );
        assert_eq!(
            model.fork_list_add(join, a, Some(0.5)),
            Err(GraphError::WrongListKind {
                expected: ListShape::Fork,
                found: ListShape::OrJoin,
            })
        );
        assert_eq!(model.activity(a).next_join(), None);
        assert_eq!(model.activity(a).prev_fork(), None);
        assert!(model.list(fork).as_and_fork().unwrap().branches().is_empty());
    }
}
