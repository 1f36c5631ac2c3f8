use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

use lqns_prob::{repeat_variance_term, variance_term, Exponential};

use crate::model::Model;
use crate::pragma::Pragmas;
use crate::proptest_generators::{
    arb_and_fork_model, arb_branch_moments, arb_or_fork_model, arb_or_probabilities,
};

fn prepared(description: &crate::builder::ModelDescription) -> Model {
    let mut model = Model::from_description(description, Pragmas::default()).unwrap();
    model.set_sync_submodel(Some(1));
    model.prepare().unwrap();
    model
}

/// Give every activity a submodel-1 wait equal to its service time.
fn seed_waits(model: &mut Model) {
    for a in 0..model.activities().len() {
        let service_time = model.activity(a).service_time;
        model.activity_mut(a).set_wait(1, service_time);
        model.activity_mut(a).variance = service_time * service_time;
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn generated_or_forks_pass_validation(description in arb_or_fork_model()) {
        let model = prepared(&description);
        prop_assert!(model.diagnostics().is_empty(), "{:?}", model.diagnostics());
    }

    #[test]
    fn or_fork_aggregation_is_idempotent(description in arb_or_fork_model()) {
        let mut model = prepared(&description);
        seed_waits(&mut model);
        model.configure(0).unwrap();
        let wait = model.update_wait(0, 1).unwrap();
        let variance = model.compute_variance(0).unwrap();
        model.configure(0).unwrap();
        prop_assert_eq!(model.update_wait(0, 1).unwrap(), wait);
        prop_assert_eq!(model.compute_variance(0).unwrap(), variance);
        prop_assert!(variance >= 0.0);
    }

    #[test]
    fn or_fork_wait_is_the_weighted_branch_mean(description in arb_or_fork_model()) {
        let mut model = prepared(&description);
        seed_waits(&mut model);
        model.configure(0).unwrap();
        let branches = &description.tasks[0].lists[1].members;
        let expected = 1.0
            + branches
                .iter()
                .map(|m| {
                    let a = model.find_activity(0, &m.activity).unwrap();
                    m.parameter.unwrap_or(0.0) * model.activity(a).service_time
                })
                .sum::<f64>()
            + model.activity(model.find_activity(0, "end").unwrap()).service_time;
        let wait = model.update_wait(0, 1).unwrap();
        prop_assert!((wait - expected).abs() < 1e-9 * expected.max(1.0), "{} vs {}", wait, expected);
    }

    #[test]
    fn quorum_aggregation_keeps_variance_non_negative(description in arb_and_fork_model()) {
        let mut model = prepared(&description);
        seed_waits(&mut model);
        model.update_wait(0, 1).unwrap();
        let variance = model.compute_variance(0).unwrap();
        prop_assert!(variance >= 0.0);
        for entry in model.entries() {
            for phase in entry.phases() {
                prop_assert!(phase.variance >= 0.0);
            }
        }
    }

    #[test]
    fn mixture_and_loop_terms_are_non_negative(
        probabilities in arb_or_probabilities(),
        a in arb_branch_moments(),
        b in arb_branch_moments(),
    ) {
        let a = Exponential::new(a.0, a.1);
        let b = Exponential::new(b.0, b.1);
        let mixture = variance_term(probabilities[0], &a, probabilities[1], &b);
        prop_assert!(mixture.variance() >= 0.0);
        prop_assert!(repeat_variance_term(&a).variance() >= 0.0);
    }
}
