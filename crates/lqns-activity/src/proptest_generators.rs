//! Proptest strategies for well-formed model descriptions.

use proptest::prelude::*;

use crate::actlist::ListShape;
use crate::builder::{
    ActivityDescription, EntryDescription, ListDescription, ListMember, ModelDescription,
    TaskDescription,
};
use crate::model::CalledBy;

/// Branch probabilities of an OR-fork: 2-5 positive weights normalized to
/// sum to one.
pub fn arb_or_probabilities() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(1u32..=100, 2..=5).prop_map(|weights| {
        let total: u32 = weights.iter().sum();
        weights
            .into_iter()
            .map(|w| f64::from(w) / f64::from(total))
            .collect()
    })
}

/// Mean and variance of one branch. Variances stay below the squared mean
/// so every pair is a valid phase-type moment pair.
pub fn arb_branch_moments() -> impl Strategy<Value = (f64, f64)> {
    (0.1f64..50.0, 0.0f64..1.0).prop_map(|(mean, cv)| (mean, cv * mean * mean))
}

fn activity(name: String, service_time: f64) -> ActivityDescription {
    ActivityDescription {
        name,
        service_time: Some(service_time),
        processor: Some(2),
        ..ActivityDescription::default()
    }
}

fn members(names: &[String], parameters: &[Option<f64>]) -> Vec<ListMember> {
    names
        .iter()
        .zip(parameters)
        .map(|(n, &parameter)| ListMember {
            activity: n.clone(),
            parameter,
        })
        .collect()
}

fn single_task(activities: Vec<ActivityDescription>, lists: Vec<ListDescription>) -> ModelDescription {
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

/// One task running `start -> (b0 + b1 + ...) -> end`. The start activity
/// replies, so every branch runs in phase 2.
pub fn arb_or_fork_model() -> impl Strategy<Value = ModelDescription> {
    arb_or_probabilities()
        .prop_flat_map(|probabilities| {
            let n = probabilities.len();
            (
                Just(probabilities),
                proptest::collection::vec(0.0f64..10.0, n..=n),
                0.0f64..5.0,
            )
        })
        .prop_map(|(probabilities, service_times, end)| {
            let branches: Vec<String> = (0..probabilities.len()).map(|i| format!("b{i}")).collect();
            let mut activities = vec![activity("start".into(), 1.0)];
            activities[0].replies = vec!["e".into()];
            activities.extend(
                branches
                    .iter()
                    .zip(&service_times)
                    .map(|(n, &s)| activity(n.clone(), s)),
            );
            activities.push(activity("end".into(), end));

            let choice: Vec<Option<f64>> = probabilities.iter().copied().map(Some).collect();
            let plain = vec![None; branches.len()];
            let lists = vec![
                ListDescription {
                    id: "j0".into(),
                    kind: ListShape::Join,
                    members: members(&["start".to_string()], &[None]),
                    next: Some("f0".into()),
                    quorum: 0,
                },
                ListDescription {
                    id: "f0".into(),
                    kind: ListShape::OrFork,
                    members: members(&branches, &choice),
                    next: None,
                    quorum: 0,
                },
                ListDescription {
                    id: "j1".into(),
                    kind: ListShape::OrJoin,
                    members: members(&branches, &plain),
                    next: Some("f1".into()),
                    quorum: 0,
                },
                ListDescription {
                    id: "f1".into(),
                    kind: ListShape::Fork,
                    members: members(&["end".to_string()], &[None]),
                    next: None,
                    quorum: 0,
                },
            ];
            single_task(activities, lists)
        })
}

/// One task running `start -> (b0 & b1 & ...) -> [k] -> end` with 2-5
/// branches and a quorum count `k` between one and the branch count.
pub fn arb_and_fork_model() -> impl Strategy<Value = ModelDescription> {
    (2usize..=5)
        .prop_flat_map(|n| {
            (
                proptest::collection::vec(0.1f64..10.0, n..=n),
                1..=n,
            )
        })
        .prop_map(|(service_times, quorum)| {
            let branches: Vec<String> = (0..service_times.len()).map(|i| format!("b{i}")).collect();
            let mut activities = vec![activity("start".into(), 1.0)];
            activities.extend(
                branches
                    .iter()
                    .zip(&service_times)
                    .map(|(n, &s)| activity(n.clone(), s)),
            );
            activities.push(activity("end".into(), 0.5));

            let plain = vec![None; branches.len()];
            let lists = vec![
                ListDescription {
                    id: "j0".into(),
                    kind: ListShape::Join,
                    members: members(&["start".to_string()], &[None]),
                    next: Some("f0".into()),
                    quorum: 0,
                },
                ListDescription {
                    id: "f0".into(),
                    kind: ListShape::AndFork,
                    members: members(&branches, &plain),
                    next: None,
                    quorum: 0,
                },
                ListDescription {
                    id: "j1".into(),
                    kind: ListShape::AndJoin,
                    members: members(&branches, &plain),
                    next: Some("f1".into()),
                    quorum,
                },
                ListDescription {
                    id: "f1".into(),
                    kind: ListShape::Fork,
                    members: members(&["end".to_string()], &[None]),
                    next: None,
                    quorum: 0,
                },
            ];
            single_task(activities, lists)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn or_probabilities_sum_to_one(probabilities in arb_or_probabilities()) {
            let sum: f64 = probabilities.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-9);
            prop_assert!(probabilities.iter().all(|&p| p > 0.0));
        }

        #[test]
        fn branch_moments_are_valid((mean, variance) in arb_branch_moments()) {
            prop_assert!(mean > 0.0);
            prop_assert!(variance >= 0.0 && variance < mean * mean);
        }
    }
}
