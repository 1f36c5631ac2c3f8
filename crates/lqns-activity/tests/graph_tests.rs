//! Graph construction and validation through the public API.

mod common;

use common::{activity, build, description, list, or_fork};
use lqns_activity::{ActivityPath, GraphError, JoinType, ListShape, ModelDescription};

fn or_model(p_b: f64, p_c: f64) -> lqns_activity::Model {
    build(
        vec![activity("a", 1.0), activity("b", 1.0), activity("c", 1.0)],
        vec![
            list("j", ListShape::Join, &["a"], Some("f")),
            or_fork("f", &[("b", p_b), ("c", p_c)]),
        ],
    )
}

#[test]
fn or_probabilities_within_tolerance_pass() {
    for (p_b, p_c) in [(0.5, 0.5), (0.25, 0.75 + 1e-9), (0.3, 0.7 - 1e-9)] {
        let mut m = or_model(p_b, p_c);
        m.prepare().unwrap();
        assert!(m.diagnostics().is_empty(), "{p_b} + {p_c}: {:?}", m.diagnostics());
    }
}

#[test]
fn or_probabilities_off_by_a_tenth_are_reported() {
    for (p_b, p_c, expected) in [(0.4, 0.5, 0.9), (0.6, 0.5, 1.1)] {
        let mut m = or_model(p_b, p_c);
        m.prepare().unwrap();
        match m.diagnostics() {
            [GraphError::MissingOrBranch { list, sum }] => {
                assert_eq!(list, "b + c");
                assert!((sum - expected).abs() < 1e-12);
            }
            other => panic!("unexpected diagnostics {other:?}"),
        }
    }
}

#[test]
fn cycle_names_each_activity_once() {
    let mut m = build(
        vec![activity("a", 1.0), activity("b", 1.0), activity("c", 1.0)],
        vec![
            list("jo", ListShape::OrJoin, &["a", "c"], Some("f1")),
            list("f1", ListShape::Fork, &["b"], None),
            list("j2", ListShape::Join, &["b"], Some("f2")),
            list("f2", ListShape::Fork, &["c"], None),
        ],
    );
    let depth = m.prepare().unwrap();
    assert_eq!(depth, 3);
    assert_eq!(
        m.diagnostics().first(),
        Some(&GraphError::ActivityCycle {
            path: ActivityPath(vec!["b".into(), "c".into()]),
            depth: 3,
        })
    );

    // Aggregation stops at the repeated activity.
    m.configure(0).unwrap();
    assert_eq!(m.entry(0).total().service_time, 3.0);
}

#[test]
fn join_of_branches_from_one_or_fork_is_rejected() {
    let mut m = build(
        vec![activity("a", 1.0), activity("x", 1.0), activity("y", 1.0)],
        vec![
            list("j", ListShape::Join, &["a"], Some("f")),
            or_fork("f", &[("x", 0.5), ("y", 0.5)]),
            list("sync", ListShape::AndJoin, &["x", "y"], None),
        ],
    );
    m.prepare().unwrap();
    assert!(
        m.diagnostics()
            .iter()
            .any(|d| matches!(d, GraphError::BadExternalJoin { .. } | GraphError::BadInternalJoin { .. })),
        "{:?}",
        m.diagnostics()
    );
    let x = m.find_activity(0, "x").unwrap();
    let sync = m.activity(x).next_join().unwrap();
    assert_eq!(
        m.list(sync).as_and_join().unwrap().join_type(),
        JoinType::SynchronizationPoint
    );
}

#[test]
fn diagnostics_are_reported_once_across_passes() {
    let mut m = or_model(0.4, 0.5);
    m.prepare().unwrap();
    m.prepare().unwrap();
    assert_eq!(m.diagnostics().len(), 1);
}

#[test]
fn description_round_trips_through_json() {
    let original = description(
        vec![common::replying("a", 1.0, "e"), activity("b", 2.0)],
        vec![
            list("j", ListShape::Join, &["a"], Some("f")),
            list("f", ListShape::Fork, &["b"], None),
        ],
    );
    let json = original.to_json().unwrap();
    assert_eq!(ModelDescription::from_json(&json).unwrap(), original);
}

#[test]
fn malformed_json_is_an_error() {
    assert!(ModelDescription::from_json("{\"tasks\": [{\"lists\": 3}]}").is_err());
}
