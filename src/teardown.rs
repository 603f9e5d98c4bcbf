//! Teardown registry: ordered, owned cleanup tasks drained in reverse.
//!
//! Steps register a cleanup action right after they acquire a resource
//! (application created, key uploaded, worker claimed). When the run ends,
//! successfully or not, the executor calls [`Teardown::drain`], which runs
//! every action exactly once, most recent first. A failing, panicking or
//! hanging action is recorded and logged; the remaining actions still run.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::error::panic_message;

/// An owned cleanup task.
///
/// The action receives the run context at drain time, so it can read values
/// that were written after it was registered.
#[async_trait::async_trait]
pub trait TeardownAction<Ctx, Err>: Send {
    /// Release the resource.
    async fn run(self: Box<Self>, ctx: &mut Ctx) -> Result<(), Err>;
}

/// Adapter turning a closure into a [`TeardownAction`].
pub struct FnAction<F>(F);

#[async_trait::async_trait]
impl<Ctx, Err, F> TeardownAction<Ctx, Err> for FnAction<F>
where
    Ctx: Send,
    Err: Send,
    F: for<'a> FnOnce(&'a mut Ctx) -> BoxFuture<'a, Result<(), Err>> + Send + 'static,
{
    async fn run(self: Box<Self>, ctx: &mut Ctx) -> Result<(), Err> {
        (self.0)(ctx).await
    }
}

struct TeardownEntry<Ctx, Err> {
    sequence: usize,
    label: String,
    action: Box<dyn TeardownAction<Ctx, Err>>,
}

/// Why a teardown action did not complete.
#[derive(Debug)]
pub enum TeardownFault<Err> {
    /// The action returned an error.
    Error(Err),
    /// The action panicked.
    Panicked(String),
    /// The action exceeded the per-action timeout and was abandoned.
    TimedOut(Duration),
}

impl<Err: fmt::Display> fmt::Display for TeardownFault<Err> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{e}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
            Self::TimedOut(limit) => write!(f, "timed out after {limit:?}"),
        }
    }
}

/// A teardown action that did not complete.
#[derive(Debug)]
pub struct TeardownFailure<Err> {
    /// Registration order of the action (0 = first registered).
    pub sequence: usize,
    /// Label given at registration.
    pub label: String,
    /// What went wrong.
    pub fault: TeardownFault<Err>,
}

/// Summary of one drain.
#[derive(Debug)]
pub struct TeardownReport<Err> {
    /// Number of actions that were run (successfully or not).
    pub executed: usize,
    /// Actions that did not complete, in execution order.
    pub failures: Vec<TeardownFailure<Err>>,
}

impl<Err> Default for TeardownReport<Err> {
    fn default() -> Self {
        Self {
            executed: 0,
            failures: Vec::new(),
        }
    }
}

impl<Err> TeardownReport<Err> {
    /// Returns `true` if every action completed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered registry of cleanup actions.
pub struct Teardown<Ctx, Err> {
    entries: Vec<TeardownEntry<Ctx, Err>>,
    next_sequence: usize,
    action_timeout: Option<Duration>,
}

impl<Ctx, Err> Default for Teardown<Ctx, Err> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 0,
            action_timeout: None,
        }
    }
}

impl<Ctx, Err> Teardown<Ctx, Err> {
    /// Number of actions waiting to run.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no action is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels of pending actions, in registration order.
    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }
}

impl<Ctx, Err> fmt::Debug for Teardown<Ctx, Err> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("pending", &self.labels())
            .field("action_timeout", &self.action_timeout)
            .finish()
    }
}

impl<Ctx, Err> Teardown<Ctx, Err>
where
    Ctx: Send,
    Err: Send + fmt::Display,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon any action that runs longer than `limit`.
    pub fn with_action_timeout(mut self, limit: Duration) -> Self {
        self.action_timeout = Some(limit);
        self
    }

    /// Append a cleanup action.
    pub fn register<A>(&mut self, label: impl Into<String>, action: A)
    where
        A: TeardownAction<Ctx, Err> + 'static,
    {
        let label = label.into();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        tracing::debug!(sequence, label = label.as_str(), "teardown.register");

        self.entries.push(TeardownEntry {
            sequence,
            label,
            action: Box::new(action),
        });
    }

    /// Append a cleanup closure.
    ///
    /// ```ignore
    /// teardown.register_fn("remove application", move |ctx| {
    ///     Box::pin(async move { ctx.cloud.remove_application(&name).await })
    /// });
    /// ```
    pub fn register_fn<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: for<'a> FnOnce(&'a mut Ctx) -> BoxFuture<'a, Result<(), Err>> + Send + 'static,
        Ctx: 'static,
        Err: 'static,
    {
        self.register(label, FnAction(action));
    }

    /// Run every registered action, most recently registered first.
    ///
    /// Never stops early. The registry is empty afterwards, so a second call
    /// runs nothing.
    pub async fn drain(&mut self, ctx: &mut Ctx) -> TeardownReport<Err> {
        let mut report = TeardownReport::default();

        while let Some(entry) = self.entries.pop() {
            let TeardownEntry {
                sequence,
                label,
                action,
            } = entry;

            tracing::info!(sequence, label = label.as_str(), "teardown.start");
            report.executed += 1;

            match self.run_action(action, ctx).await {
                Ok(()) => {
                    tracing::info!(sequence, label = label.as_str(), "teardown.end");
                }
                Err(fault) => {
                    tracing::error!(
                        sequence,
                        label = label.as_str(),
                        error = %fault,
                        "teardown.failed"
                    );
                    report.failures.push(TeardownFailure {
                        sequence,
                        label,
                        fault,
                    });
                }
            }
        }

        report
    }

    async fn run_action(
        &self,
        action: Box<dyn TeardownAction<Ctx, Err>>,
        ctx: &mut Ctx,
    ) -> Result<(), TeardownFault<Err>> {
        let guarded = AssertUnwindSafe(action.run(ctx)).catch_unwind();
        let outcome = match self.action_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| TeardownFault::TimedOut(limit))?,
            None => guarded.await,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TeardownFault::Error(e)),
            Err(payload) => Err(TeardownFault::Panicked(panic_message(payload))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<usize>>>;

    #[derive(Debug, PartialEq)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    async fn release_twice() -> Result<(), Boom> {
        panic!("worker already released")
    }

    fn recording(teardown: &mut Teardown<(), Boom>, log: &Log, id: usize) {
        let log = log.clone();
        teardown.register_fn(format!("action-{id}"), move |_ctx| {
            Box::pin(async move {
                log.lock().push(id);
                Ok(())
            })
        });
    }

    #[tokio::test]
    async fn drains_in_reverse_registration_order() {
        let log: Log = Arc::default();
        let mut teardown = Teardown::new();
        for id in 0..5 {
            recording(&mut teardown, &log, id);
        }
        assert_eq!(teardown.len(), 5);

        let report = teardown.drain(&mut ()).await;

        assert_eq!(*log.lock(), vec![4, 3, 2, 1, 0]);
        assert_eq!(report.executed, 5);
        assert!(report.is_clean());
        assert!(teardown.is_empty());
    }

    #[tokio::test]
    async fn second_drain_runs_nothing() {
        let log: Log = Arc::default();
        let mut teardown = Teardown::new();
        recording(&mut teardown, &log, 0);
        recording(&mut teardown, &log, 1);

        teardown.drain(&mut ()).await;
        let second = teardown.drain(&mut ()).await;

        assert_eq!(*log.lock(), vec![1, 0]);
        assert_eq!(second.executed, 0);
        assert!(second.is_clean());
    }

    #[tokio::test]
    async fn failing_action_does_not_stop_the_rest() {
        let log: Log = Arc::default();
        let mut teardown = Teardown::new();
        recording(&mut teardown, &log, 0);
        teardown.register_fn("broken", |_ctx| Box::pin(async { Err(Boom) }));
        recording(&mut teardown, &log, 2);

        let report = teardown.drain(&mut ()).await;

        assert_eq!(*log.lock(), vec![2, 0]);
        assert_eq!(report.executed, 3);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.sequence, 1);
        assert_eq!(failure.label, "broken");
        assert!(matches!(failure.fault, TeardownFault::Error(Boom)));
    }

    #[tokio::test]
    async fn panicking_action_is_contained() {
        let log: Log = Arc::default();
        let mut teardown = Teardown::new();
        recording(&mut teardown, &log, 0);
        teardown.register_fn("panics", |_ctx| Box::pin(release_twice()));

        let report = teardown.drain(&mut ()).await;

        assert_eq!(*log.lock(), vec![0]);
        assert_eq!(report.executed, 2);
        match &report.failures[0].fault {
            TeardownFault::Panicked(message) => {
                assert!(message.contains("worker already released"))
            }
            other => panic!("expected panic fault, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_action_times_out() {
        let log: Log = Arc::default();
        let mut teardown = Teardown::new().with_action_timeout(Duration::from_secs(5));
        recording(&mut teardown, &log, 0);
        teardown.register_fn("hangs", |_ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
        });

        let report = teardown.drain(&mut ()).await;

        assert_eq!(*log.lock(), vec![0]);
        assert!(matches!(
            report.failures[0].fault,
            TeardownFault::TimedOut(limit) if limit == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn actions_see_context_at_drain_time() {
        let mut teardown: Teardown<Vec<String>, Boom> = Teardown::new();
        teardown.register_fn("read", |ctx| {
            Box::pin(async move {
                let seen = ctx.join(",");
                ctx.push(format!("seen:{seen}"));
                Ok(())
            })
        });

        let mut ctx = Vec::new();
        ctx.push("written-later".to_owned());
        teardown.drain(&mut ctx).await;

        assert_eq!(ctx, vec!["written-later", "seen:written-later"]);
    }

    #[test]
    fn labels_follow_registration_order() {
        let log: Log = Arc::default();
        let mut teardown = Teardown::new();
        recording(&mut teardown, &log, 0);
        recording(&mut teardown, &log, 1);

        assert_eq!(teardown.labels(), vec!["action-0", "action-1"]);
    }
}
