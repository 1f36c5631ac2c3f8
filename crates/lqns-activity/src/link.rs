//! Fork/join matching and graph validation.
//!
//! A depth-first walk from every start activity follows `next_join` links.
//! It carries the chain of activities on the current path, which catches
//! cycles, and the stack of AND-forks currently open. When the walk reaches
//! an AND-join it backtracks along every other branch looking for one of
//! the open forks; a match makes the join internal to that fork, no match
//! makes it a synchronization point.

use std::collections::HashSet;

use crate::actlist::{JoinType, ListKind, EPSILON};
use crate::error::{ActivityPath, GraphError};
use crate::model::{ActivityId, EntryId, ListId, Model, TaskId};

#[derive(Debug, Default)]
struct LinkWalk {
    activity_stack: Vec<ActivityId>,
    fork_stack: Vec<ListId>,
}

impl Model {
    /// Run the graph preparation passes: quorum expansion (when delayed
    /// calls are kept), fork/join linking, and validation.
    ///
    /// # Returns
    /// The deepest activity chain found, or the expansion error.
    pub fn prepare(&mut self) -> Result<usize, GraphError> {
        if self.pragmas.keeps_delayed_calls() {
            self.expand_quorum_graph()?;
        }
        let depth = self.link_fork_to_join();
        self.check();
        Ok(depth)
    }

    /// Match forks to joins in every task.
    pub fn link_fork_to_join(&mut self) -> usize {
        (0..self.tasks.len())
            .map(|task| self.link_task(task))
            .max()
            .unwrap_or(0)
    }

    pub fn link_task(&mut self, task: TaskId) -> usize {
        let entries = self.tasks[task].entries.clone();
        entries
            .into_iter()
            .map(|entry| self.find_children(entry))
            .max()
            .unwrap_or(0)
    }

    /// Walk the graph of one entry. Errors are reported and the depth
    /// reached before the failure is returned.
    pub fn find_children(&mut self, entry: EntryId) -> usize {
        let Some(start) = self.entries[entry].start_activity else {
            return 0;
        };
        let mut walk = LinkWalk::default();
        match self.activity_find_children(start, &mut walk) {
            Ok(depth) => depth,
            Err(error) => {
                let depth = error.depth().unwrap_or(0);
                self.report(error);
                depth
            }
        }
    }

    fn activity_find_children(
        &mut self,
        activity: ActivityId,
        walk: &mut LinkWalk,
    ) -> Result<usize, GraphError> {
        self.activities[activity].reachable = true;

        if let Some(pos) = walk.activity_stack.iter().position(|&a| a == activity) {
            return Err(GraphError::ActivityCycle {
                path: ActivityPath(self.activity_names(&walk.activity_stack[pos..])),
                depth: walk.activity_stack.len(),
            });
        }

        walk.activity_stack.push(activity);
        let depth = walk.activity_stack.len();
        let result = match self.activities[activity].next_join {
            Some(list) => self.list_find_children(list, walk).map(|d| d.max(depth)),
            None => Ok(depth),
        };
        walk.activity_stack.pop();
        result
    }

    fn list_find_children(&mut self, list: ListId, walk: &mut LinkWalk) -> Result<usize, GraphError> {
        let depth = walk.activity_stack.len();
        let next = self.lists[list].next;
        match &self.lists[list].kind {
            ListKind::Fork(activity) => match *activity {
                Some(activity) => self.activity_find_children(activity, walk),
                None => Ok(depth),
            },
            ListKind::Join(_) | ListKind::OrJoin(_) => match next {
                Some(next) => self.list_find_children(next, walk),
                None => Ok(depth),
            },
            ListKind::OrFork(fork) => {
                let branches = fork.branches.clone();
                let mut max_depth = depth;
                for branch in branches {
                    max_depth = max_depth.max(self.activity_find_children(branch, walk)?);
                }
                Ok(max_depth)
            }
            ListKind::AndFork(_) => self.and_fork_find_children(list, walk),
            ListKind::AndJoin(_) => {
                self.and_join_find_children(list, walk)?;
                match next {
                    Some(next) => self.list_find_children(next, walk),
                    None => Ok(depth),
                }
            }
            ListKind::Repeat(repeat) => {
                let exit = repeat.exit;
                let branches = repeat.branches.clone();
                let mut max_depth = depth;
                if let Some(exit) = exit {
                    max_depth = max_depth.max(self.activity_find_children(exit, walk)?);
                }
                for branch in branches {
                    // Loop bodies match their own forks and joins.
                    let outer = std::mem::take(&mut walk.fork_stack);
                    let result = self.activity_find_children(branch, walk);
                    walk.fork_stack = outer;
                    max_depth = max_depth.max(result?);
                }
                Ok(max_depth)
            }
        }
    }

    fn and_fork_find_children(&mut self, list: ListId, walk: &mut LinkWalk) -> Result<usize, GraphError> {
        let parent = walk.fork_stack.last().copied();
        let branches = match self.lists[list].as_and_fork_mut() {
            Some(fork) => {
                fork.parent = parent;
                fork.branches.clone()
            }
            None => Vec::new(),
        };

        walk.fork_stack.push(list);
        let mut max_depth = walk.activity_stack.len();
        for branch in branches {
            tracing::trace!(
                fork = %self.list_name(list),
                branch = %self.activities[branch].name,
                depth = walk.activity_stack.len(),
                "and-fork"
            );
            match self.activity_find_children(branch, walk) {
                Ok(depth) => max_depth = max_depth.max(depth),
                Err(error @ GraphError::BadInternalJoin { .. }) => {
                    max_depth = max_depth.max(error.depth().unwrap_or(0));
                    self.report(error);
                    break;
                }
                Err(error) => {
                    walk.fork_stack.pop();
                    return Err(error);
                }
            }
        }
        walk.fork_stack.pop();
        Ok(max_depth)
    }

    /// Type the join from the branches the walk did not arrive on.
    fn and_join_find_children(&mut self, list: ListId, walk: &mut LinkWalk) -> Result<(), GraphError> {
        let branches = match self.lists[list].as_and_join() {
            Some(join) => join.branches.clone(),
            None => return Ok(()),
        };
        let top = walk.activity_stack.last().copied();

        for (i, &branch) in branches.iter().enumerate() {
            if Some(branch) == top {
                continue;
            }
            let matched = self.activity_backtrack(branch, &walk.fork_stack, &mut HashSet::new());
            let Some(join) = self.lists[list].as_and_join_mut() else {
                return Ok(());
            };
            match matched {
                Some(j) => {
                    if !join.set_join_type(JoinType::InternalForkJoin) {
                        return Err(self.path_error(walk, false));
                    }
                    let fork = walk.fork_stack[j];
                    let rematch = join.fork_lists[i].map_or(true, |f| walk.fork_stack.contains(&f));
                    if rematch {
                        join.fork_lists[i] = Some(fork);
                        if let Some(fork) = self.lists[fork].as_and_fork_mut() {
                            fork.join = Some(list);
                        }
                    }
                    tracing::trace!(
                        join = %self.list_name(list),
                        branch = %self.activities[branch].name,
                        fork = j,
                        "and-join matched"
                    );
                }
                None => {
                    if !join.set_join_type(JoinType::SynchronizationPoint) {
                        return Err(self.path_error(walk, false));
                    }
                    let unique = top.is_some_and(|top| join.add_to_src_list(i, top));
                    // Synchronization between independent threads is not solved.
                    return Err(self.path_error(walk, unique));
                }
            }
        }
        Ok(())
    }

    fn path_error(&self, walk: &LinkWalk, external: bool) -> GraphError {
        let path = ActivityPath(self.activity_names(&walk.activity_stack));
        let depth = walk.activity_stack.len();
        if external {
            GraphError::BadExternalJoin { path, depth }
        } else {
            GraphError::BadInternalJoin { path, depth }
        }
    }

    /// Search backwards from `activity` for one of the open forks.
    ///
    /// # Returns
    /// The position on `fork_stack` of the deepest fork found.
    fn activity_backtrack(
        &self,
        activity: ActivityId,
        fork_stack: &[ListId],
        visited: &mut HashSet<ListId>,
    ) -> Option<usize> {
        self.activities[activity]
            .prev_fork
            .and_then(|list| self.list_backtrack(list, fork_stack, visited))
    }

    fn list_backtrack(&self, list: ListId, fork_stack: &[ListId], visited: &mut HashSet<ListId>) -> Option<usize> {
        if !visited.insert(list) {
            return None;
        }
        let node = &self.lists[list];
        let prev = node.prev;
        match &node.kind {
            ListKind::Fork(_) | ListKind::OrFork(_) | ListKind::Repeat(_) => {
                prev.and_then(|prev| self.list_backtrack(prev, fork_stack, visited))
            }
            ListKind::Join(activity) => {
                activity.and_then(|a| self.activity_backtrack(a, fork_stack, visited))
            }
            ListKind::AndJoin(_) | ListKind::OrJoin(_) => node
                .kind
                .activities()
                .into_iter()
                .filter_map(|a| self.activity_backtrack(a, fork_stack, visited))
                .max(),
            ListKind::AndFork(_) => match fork_stack.iter().rposition(|&f| f == list) {
                Some(i) => Some(i),
                None => prev.and_then(|prev| self.list_backtrack(prev, fork_stack, visited)),
            },
        }
    }

    /// Validate every task after linking. Returns false when anything new
    /// was reported.
    pub fn check(&mut self) -> bool {
        let before = self.diagnostics.len();
        for task in 0..self.tasks.len() {
            self.check_task(task);
        }
        self.diagnostics.len() == before
    }

    fn check_task(&mut self, task: TaskId) {
        for list in self.tasks[task].lists.clone() {
            match &self.lists[list].kind {
                ListKind::OrFork(fork) => {
                    let sum = fork.probability_sum();
                    if (1.0 - sum).abs() > EPSILON {
                        let list = self.list_name(list);
                        self.report(GraphError::MissingOrBranch { list, sum });
                    }
                }
                ListKind::AndFork(fork) => {
                    let Some(join) = fork.join else {
                        continue;
                    };
                    let consistent = self.lists[join]
                        .as_and_join()
                        .map_or(true, |j| j.fork_lists.windows(2).all(|w| w[0] == w[1]));
                    if !consistent {
                        let join = self.list_name(join);
                        self.report(GraphError::JoinPathMismatch { join });
                    }
                }
                _ => {}
            }
        }

        for activity in self.tasks[task].activities.clone() {
            let a = &self.activities[activity];
            let name = a.name.clone();
            if !a.specified {
                self.report(GraphError::ActivityNotSpecified { activity: name });
            } else if !a.reachable {
                self.report(GraphError::ActivityNotReachable { activity: name });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actlist::ListShape;
    use crate::builder::{
        ActivityDescription, EntryDescription, ListDescription, ListMember, ModelDescription,
        TaskDescription,
    };
    use crate::model::CalledBy;
    use crate::pragma::Pragmas;

    fn activities(names: &[&str]) -> Vec<ActivityDescription> {
        names
            .iter()
            .map(|n| ActivityDescription {
                name: (*n).into(),
                service_time: Some(1.0),
                ..ActivityDescription::default()
            })
            .collect()
    }

    fn list(id: &str, kind: ListShape, members: &[&str], next: Option<&str>) -> ListDescription {
        ListDescription {
            id: id.into(),
            kind,
            members: members
                .iter()
                .map(|m| ListMember {
                    activity: (*m).into(),
                    parameter: None,
                })
                .collect(),
            next: next.map(Into::into),
            quorum: 0,
        }
    }

    fn model(acts: &[&str], lists: Vec<ListDescription>) -> Model {
        let task = TaskDescription {
            name: "t".into(),
            submodel: 1,
            entries: vec![EntryDescription {
                name: "e".into(),
                called_by: CalledBy::Rendezvous,
                start_activity: Some(acts[0].into()),
                phases: vec![],
            }],
            activities: activities(acts),
            lists,
        };
        Model::from_description(&ModelDescription { tasks: vec![task] }, Pragmas::default()).unwrap()
    }

    #[test]
    fn and_fork_is_matched_with_its_join() {
        let mut m = model(
            &["a", "b", "c", "d"],
            vec![
                list("j1", ListShape::Join, &["a"], Some("f1")),
                list("f1", ListShape::AndFork, &["b", "c"], None),
                list("j2", ListShape::AndJoin, &["b", "c"], Some("f2")),
                list("f2", ListShape::Fork, &["d"], None),
            ],
        );
        let depth = m.link_fork_to_join();
        assert!(m.check(), "{:?}", m.diagnostics());
        assert_eq!(depth, 3);
        let b = m.find_activity(0, "b").unwrap();
        let fork = m.activity(b).prev_fork().unwrap();
        let join = m.activity(b).next_join().unwrap();
        assert_eq!(m.list(fork).as_and_fork().unwrap().join(), Some(join));
        let and_join = m.list(join).as_and_join().unwrap();
        assert_eq!(and_join.join_type(), JoinType::InternalForkJoin);
        assert_eq!(and_join.fork_lists(), &[Some(fork), Some(fork)]);
        assert!(m.list(fork).prev().is_some());
    }

    #[test]
    fn nested_fork_records_parent() {
        let mut m = model(
            &["a", "b", "c", "d", "e", "f"],
            vec![
                list("j1", ListShape::Join, &["a"], Some("f1")),
                list("f1", ListShape::AndFork, &["b", "c"], None),
                list("jb", ListShape::Join, &["b"], Some("fb")),
                list("fb", ListShape::AndFork, &["d", "e"], None),
                list("jde", ListShape::AndJoin, &["d", "e"], Some("fx")),
                list("fx", ListShape::Fork, &["f"], None),
                list("jfc", ListShape::AndJoin, &["f", "c"], None),
            ],
        );
        m.link_fork_to_join();
        assert!(m.check(), "{:?}", m.diagnostics());
        let d = m.find_activity(0, "d").unwrap();
        let inner = m.activity(d).prev_fork().unwrap();
        let b = m.find_activity(0, "b").unwrap();
        let outer = m.activity(b).prev_fork().unwrap();
        assert_eq!(m.list(inner).as_and_fork().unwrap().parent(), Some(outer));
    }

    #[test]
    fn unreachable_activity_is_reported() {
        let mut m = model(&["a", "lonely"], vec![]);
        m.link_fork_to_join();
        assert!(!m.check());
        assert_eq!(
            m.diagnostics(),
            &[GraphError::ActivityNotReachable {
                activity: "lonely".into()
            }]
        );
    }

    #[test]
    fn join_without_fork_is_external_synchronization() {
        let mut m = model(
            &["a", "b", "c"],
            vec![
                list("j", ListShape::AndJoin, &["a", "b"], Some("f")),
                list("f", ListShape::Fork, &["c"], None),
            ],
        );
        m.link_fork_to_join();
        assert!(matches!(
            m.diagnostics().first(),
            Some(GraphError::BadExternalJoin { depth: 1, .. })
        ));
    }
}
