#![allow(dead_code)]

use lqns_activity::{
    ActivityDescription, CalledBy, EntryDescription, ListDescription, ListMember, ListShape, Model,
    ModelDescription, Pragmas, TaskDescription,
};

pub fn activity(name: &str, service_time: f64) -> ActivityDescription {
    ActivityDescription {
        name: name.into(),
        service_time: Some(service_time),
        ..ActivityDescription::default()
    }
}

pub fn replying(name: &str, service_time: f64, entry: &str) -> ActivityDescription {
    ActivityDescription {
        replies: vec![entry.into()],
        ..activity(name, service_time)
    }
}

pub fn list(id: &str, kind: ListShape, members: &[&str], next: Option<&str>) -> ListDescription {
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

pub fn or_fork(id: &str, branches: &[(&str, f64)]) -> ListDescription {
    ListDescription {
        id: id.into(),
        kind: ListShape::OrFork,
        members: branches
            .iter()
            .map(|(m, p)| ListMember {
                activity: (*m).into(),
                parameter: Some(*p),
            })
            .collect(),
        next: None,
        quorum: 0,
    }
}

/// One task `t` with entry `e` started by the first activity.
pub fn description(activities: Vec<ActivityDescription>, lists: Vec<ListDescription>) -> ModelDescription {
    let start = activities.first().map(|a| a.name.clone());
    ModelDescription {
        tasks: vec![TaskDescription {
            name: "t".into(),
            submodel: 1,
            entries: vec![EntryDescription {
                name: "e".into(),
                called_by: CalledBy::Rendezvous,
                start_activity: start,
                phases: vec![],
            }],
            activities,
            lists,
        }],
    }
}

pub fn build_with(
    activities: Vec<ActivityDescription>,
    lists: Vec<ListDescription>,
    pragmas: Pragmas,
) -> Model {
    Model::from_description(&description(activities, lists), pragmas).expect("model builds")
}

pub fn build(activities: Vec<ActivityDescription>, lists: Vec<ListDescription>) -> Model {
    build_with(activities, lists, Pragmas::default())
}

pub fn set_wait(model: &mut Model, name: &str, submodel: usize, wait: f64) {
    let a = model.find_activity(0, name).expect("activity exists");
    model.activity_mut(a).set_wait(submodel, wait);
}
