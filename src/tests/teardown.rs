//! Sub-test and teardown outcome tests.

use futures_util::FutureExt;

use crate::{ExecutionResult, RunError, RunPhase, TeardownFault};

use super::common::{acquire, five, Check, FiveSteps, Pair, PairInputs, RigContext, RigError};

fn pair() -> PairInputs {
    PairInputs {
        first: acquire("a"),
        second: acquire("b"),
    }
}

/// Test that sub-tests run in order after the last step and before any
/// release.
#[tokio::test]
async fn subtests_run_before_teardown() {
    let exec = Pair::new(pair())
        .build(RigContext::default())
        .with_subtest(Check::passing("first"))
        .with_subtest(Check::passing("second"));

    let ExecutionResult::Completed(e) = exec.start().await else {
        panic!("Expected Completed");
    };
    assert_eq!(
        e.context().events(),
        [
            "run:a",
            "run:b",
            "subtest:first",
            "subtest:second",
            "release:b",
            "release:a",
        ]
    );
}

/// Test that the first failing sub-test is the run's error and later
/// sub-tests are skipped.
#[tokio::test]
async fn failing_subtest_fails_the_run() {
    let exec = Pair::new(pair())
        .build(RigContext::default())
        .with_subtest(Check::failing("first"))
        .with_subtest(Check::passing("second"));

    match exec.start().await {
        ExecutionResult::Failed(e, RunError::SubTest { title, error }) => {
            assert_eq!(title, "first");
            assert_eq!(error, RigError::Check("first".to_owned()));
            assert_eq!(
                e.context().events(),
                ["run:a", "run:b", "subtest:first", "release:b", "release:a"]
            );
            assert_eq!(e.phase(), RunPhase::Completed);
        }
        ExecutionResult::Failed(_, other) => panic!("Expected SubTest, got {other:?}"),
        ExecutionResult::Completed(_) => panic!("Expected Failed, got Completed"),
    }
}

/// Test that a failing release leaves a successful run successful, runs the
/// remaining releases and flags the phase.
#[tokio::test]
async fn failing_release_keeps_run_outcome() {
    let exec = Pair::new(PairInputs {
        first: acquire("a"),
        second: acquire("b").failing_release(),
    })
    .build(RigContext::default());

    let result = exec.start().await;
    assert!(result.is_completed());
    assert_eq!(result.phase(), RunPhase::CompletedWithTeardownErrors);

    let ExecutionResult::Completed(e) = result else {
        unreachable!()
    };
    assert_eq!(e.context().events(), ["run:a", "run:b", "release:b", "release:a"]);

    let report = e.teardown_report();
    assert_eq!(report.executed, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].label, "release b");
    assert!(matches!(
        report.failures[0].fault,
        TeardownFault::Error(RigError::Release(ref r)) if r == "b"
    ));
}

/// Test that five successful steps run their sub-test, then drain in
/// reverse, and the run succeeds although one release fails.
#[tokio::test]
async fn five_steps_succeed_despite_one_failing_release() {
    let mut inputs = five(None);
    inputs.three = acquire("c").failing_release();

    let exec = FiveSteps::new(inputs)
        .build(RigContext::default())
        .with_subtest(Check::passing("smoke"));

    let result = exec.start().await;
    assert_eq!(result.phase(), RunPhase::CompletedWithTeardownErrors);

    let ExecutionResult::Completed(e) = result else {
        panic!("Expected Completed");
    };
    assert_eq!(
        e.context().events(),
        [
            "run:a",
            "run:b",
            "run:c",
            "run:d",
            "run:e",
            "subtest:smoke",
            "release:e",
            "release:d",
            "release:c",
            "release:b",
            "release:a",
        ]
    );
    assert_eq!(e.teardown_report().executed, 5);
    assert_eq!(e.teardown_report().failures.len(), 1);
}

/// Test that actions registered before `start()` run after every step's
/// releases.
#[tokio::test]
async fn pre_registered_action_runs_last() {
    let mut exec = Pair::new(pair()).build(RigContext::default());
    exec.teardown_mut().register_fn("release rig", |ctx: &mut RigContext| {
        async move {
            ctx.events.push("release:rig".to_owned());
            Ok(())
        }
        .boxed()
    });

    let ExecutionResult::Completed(e) = exec.start().await else {
        panic!("Expected Completed");
    };
    assert_eq!(
        e.context().events(),
        ["run:a", "run:b", "release:b", "release:a", "release:rig"]
    );
}
