//! Failure path tests.
//!
//! A failing or panicking step stops the run, later steps never start, and
//! everything acquired so far is released in reverse.

use crate::{ExecutionResult, RunError, RunPhase, StepStatus};

use super::common::{
    acquire, five, FiveSteps, RigContext, RigError, WithPanic, WithPanicInputs,
};

/// Test that a failure in step 3 of 5 skips steps 4 and 5 and releases the
/// first two resources newest first.
#[tokio::test]
async fn failing_step_stops_the_run() {
    let exec = FiveSteps::new(five(Some(2))).build(RigContext::default());

    match exec.start().await {
        ExecutionResult::Failed(e, error) => {
            assert_eq!(
                e.context().events(),
                ["run:a", "run:b", "run:c", "release:b", "release:a"]
            );
            assert!(matches!(
                error,
                RunError::Step { index: 2, name: "three", error: RigError::Refused(ref r) } if r == "c"
            ));
            assert_eq!(error.step_index(), Some(2));
            assert_eq!(e.phase(), RunPhase::Completed);

            let state = e.state();
            assert_eq!(state.completed_steps(), 2);
            assert_eq!(
                state.timing_for_step(2).and_then(|t| t.outcome),
                Some(StepStatus::Failed)
            );
            assert!(state.timing_for_step(3).is_none());
        }
        other => panic!("Expected Failed, got {:?}", std::mem::discriminant(&other)),
    }
}

/// Test that step 2 of 5 failing after registering its release skips steps
/// 3 to 5, releases 2 then 1, and reports step 2's error.
#[tokio::test]
async fn second_of_five_fails_after_registering() {
    let mut inputs = five(None);
    inputs.two = acquire("b").failing_late();

    let exec = FiveSteps::new(inputs).build(RigContext::default());

    let ExecutionResult::Failed(e, error) = exec.start().await else {
        panic!("Expected Failed");
    };
    assert_eq!(e.context().events(), ["run:a", "run:b", "release:b", "release:a"]);
    assert!(matches!(error, RunError::Step { index: 1, name: "two", .. }));
    assert_eq!(error.error(), Some(&RigError::Refused("b".to_owned())));
    assert_eq!(e.teardown_report().executed, 2);
}

/// Test that a failure in the first step leaves nothing to release.
#[tokio::test]
async fn failing_first_step_releases_nothing() {
    let exec = FiveSteps::new(five(Some(0))).build(RigContext::default());

    let ExecutionResult::Failed(e, error) = exec.start().await else {
        panic!("Expected Failed");
    };
    assert_eq!(e.context().events(), ["run:a"]);
    assert_eq!(error.error(), Some(&RigError::Refused("a".to_owned())));
    assert_eq!(e.teardown_report().executed, 0);
}

/// Test that a broken release is reported but the step error stays primary.
#[tokio::test]
async fn teardown_error_does_not_replace_step_error() {
    let mut inputs = five(Some(2));
    inputs.one = acquire("a").failing_release();

    let exec = FiveSteps::new(inputs).build(RigContext::default());
    let result = exec.start().await;

    assert_eq!(result.phase(), RunPhase::CompletedWithTeardownErrors);
    let report = result.teardown_report();
    assert_eq!(report.executed, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].label, "release a");

    match result.into_result() {
        Err(RunError::Step { name, error, .. }) => {
            assert_eq!(name, "three");
            assert_eq!(error, RigError::Refused("c".to_owned()));
        }
        other => panic!("Expected step error, got {other:?}"),
    }
}

/// Test that a panicking step is contained and still triggers teardown.
#[tokio::test]
async fn panicking_step_is_torn_down() {
    let exec = WithPanic::new(WithPanicInputs {
        first: acquire("a"),
        boom: (),
        after: acquire("z"),
    })
    .build(RigContext::default());

    match exec.start().await {
        ExecutionResult::Failed(e, RunError::Panicked { index, name, message }) => {
            assert_eq!(index, 1);
            assert_eq!(name, "boom");
            assert!(message.contains("boom"));
            assert_eq!(e.context().events(), ["run:a", "release:a"]);
            assert_eq!(
                e.state().timing_for_step(1).and_then(|t| t.outcome),
                Some(StepStatus::Interrupted)
            );
        }
        ExecutionResult::Failed(_, other) => panic!("Expected Panicked, got {other:?}"),
        ExecutionResult::Completed(_) => panic!("Expected Failed, got Completed"),
    }
}
