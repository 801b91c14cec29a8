//! The guarded executor: try / catch / finally around a work unit.
//!
//! Every execution follows the same protocol:
//!
//! 1. enter a supervised region and invoke the work unit
//! 2. if it raised, hand the descriptor to the error handler, or to the
//!    diagnostic sink when no handler is configured
//! 3. invoke the finalizer, if any
//! 4. return an [`Outcome`]
//!
//! Nothing raised by the work unit propagates out of [`GuardedExecutor::run`].
//! The error handler and finalizer are not supervised.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::exception::ExceptionDescriptor;
use crate::schedule::{spawn_deferred, Schedule, ScheduleError};
use crate::sink::{DiagnosticSink, TracingSink};
use crate::supervisor::supervise;

type WorkFn = dyn Fn() -> anyhow::Result<()> + Send + Sync;
type ErrorFn = dyn Fn(&ExceptionDescriptor) + Send + Sync;
type FinallyFn = dyn Fn() + Send + Sync;

/// Return types a work unit may have.
///
/// Infallible work units return `()`. Fallible ones return a `Result`
/// whose `Err` is treated exactly like a raised exception.
pub trait WorkResult {
    fn into_result(self) -> anyhow::Result<()>;
}

impl WorkResult for () {
    fn into_result(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<E> WorkResult for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_result(self) -> anyhow::Result<()> {
        self.map_err(Into::into)
    }
}

/// What happens to an exception when no error handler is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    /// Report to the sink and return the descriptor in [`Outcome::Unhandled`].
    #[default]
    Report,
    /// Report to the sink, then carry on as if the work unit completed.
    ///
    /// Debugging convenience only: the exception is swallowed.
    LogOnly,
}

/// Result of one execution.
#[must_use]
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The work unit did not raise.
    Completed,
    /// The work unit raised and the error handler was invoked.
    Handled,
    /// The work unit raised, no handler was configured, and the sink
    /// was told. The caller decides what to do with it.
    Unhandled(ExceptionDescriptor),
    /// The work unit raised and [`Fallback::LogOnly`] swallowed it.
    Swallowed,
}

impl Outcome {
    /// True when the work unit completed without raising.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }

    /// True when the work unit raised, however the exception was dealt with.
    pub fn raised(&self) -> bool {
        !self.is_completed()
    }

    /// The descriptor handed back for an unhandled exception.
    pub fn unhandled(&self) -> Option<&ExceptionDescriptor> {
        match self {
            Outcome::Unhandled(d) => Some(d),
            _ => None,
        }
    }
}

/// Lifecycle of a reusable executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Built but never run to completion.
    Configured,
    /// At least one run completed. Further runs are allowed.
    Executed,
}

/// A reusable, re-runnable guarded execution.
///
/// Clones share the same callbacks, run counter and last outcome. The
/// only lock guards the last outcome slot and is never held while a
/// callback runs: if the callbacks are not safe to run concurrently,
/// callers must serialize `run` calls across threads.
#[derive(Clone)]
pub struct GuardedExecutor {
    work: Arc<WorkFn>,
    on_error: Option<Arc<ErrorFn>>,
    on_finally: Option<Arc<FinallyFn>>,
    schedule: Schedule,
    fallback: Fallback,
    sink: Arc<dyn DiagnosticSink>,
    runs: Arc<AtomicU64>,
    last: Arc<Mutex<Option<Outcome>>>,
}

impl GuardedExecutor {
    /// Starts configuring an executor around `work`.
    pub fn builder<F, R>(work: F) -> GuardedExecutorBuilder
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: WorkResult,
    {
        GuardedExecutorBuilder {
            work: Arc::new(move || work().into_result()),
            on_error: None,
            on_finally: None,
            schedule: Schedule::default(),
            fallback: Fallback::default(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Runs the work unit once under supervision.
    pub fn run(&self) -> Outcome {
        debug!("Guarded execution #{} starting", self.run_count() + 1);

        let outcome = {
            let _finally = FinallyGuard(self.on_finally.as_deref());
            let work = &self.work;
            match supervise(|| work()) {
                Ok(()) => Outcome::Completed,
                Err(descriptor) => self.dispatch(descriptor),
            }
        };

        if let Ok(mut last) = self.last.lock() {
            *last = Some(outcome.clone());
        }
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Guarded execution #{n} finished: {}", outcome_label(&outcome));
        outcome
    }

    /// Outcome of the most recent completed run, across all clones.
    ///
    /// This is how the result of an `Immediate` or `Deferred` run
    /// reaches the caller.
    pub fn last_outcome(&self) -> Option<Outcome> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    fn dispatch(&self, descriptor: ExceptionDescriptor) -> Outcome {
        if let Some(ref on_error) = self.on_error {
            debug!("Routing {} to error handler", descriptor.name);
            on_error(&descriptor);
            return Outcome::Handled;
        }

        self.sink.report(&descriptor);
        match self.fallback {
            Fallback::Report => Outcome::Unhandled(descriptor),
            Fallback::LogOnly => {
                warn!("Exception {} swallowed (log-only mode)", descriptor.name);
                Outcome::Swallowed
            }
        }
    }

    /// Number of runs that have completed, across all clones.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> Lifecycle {
        if self.run_count() == 0 {
            Lifecycle::Configured
        } else {
            Lifecycle::Executed
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn fallback(&self) -> Fallback {
        self.fallback
    }
}

impl fmt::Debug for GuardedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedExecutor")
            .field("on_error", &self.on_error.is_some())
            .field("on_finally", &self.on_finally.is_some())
            .field("schedule", &self.schedule)
            .field("fallback", &self.fallback)
            .field("runs", &self.run_count())
            .finish()
    }
}

/// Runs the finalizer when dropped, including while unwinding from a
/// panicking error handler.
struct FinallyGuard<'a>(Option<&'a FinallyFn>);

impl Drop for FinallyGuard<'_> {
    fn drop(&mut self) {
        if let Some(on_finally) = self.0 {
            on_finally();
        }
    }
}

fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Completed => "completed",
        Outcome::Handled => "handled",
        Outcome::Unhandled(_) => "unhandled",
        Outcome::Swallowed => "swallowed",
    }
}

/// Configuration for a [`GuardedExecutor`].
pub struct GuardedExecutorBuilder {
    work: Arc<WorkFn>,
    on_error: Option<Arc<ErrorFn>>,
    on_finally: Option<Arc<FinallyFn>>,
    schedule: Schedule,
    fallback: Fallback,
    sink: Arc<dyn DiagnosticSink>,
}

impl GuardedExecutorBuilder {
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&ExceptionDescriptor) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn on_finally<F>(mut self, on_finally: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_finally = Some(Arc::new(on_finally));
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Sets the schedule from signed seconds (see [`Schedule::from_delay_secs`]).
    pub fn delay_secs(self, secs: i64) -> Self {
        self.schedule(Schedule::from_delay_secs(secs))
    }

    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Builds the executor and applies its schedule.
    ///
    /// `Immediate` runs once before returning, `Deferred` spawns one run
    /// on the current Tokio runtime and fails if there is none, `Manual`
    /// leaves running to the caller.
    pub fn build(self) -> Result<GuardedExecutor, ScheduleError> {
        let executor = self.into_executor();

        match executor.schedule {
            Schedule::Immediate => {
                if let Outcome::Unhandled(d) = executor.run() {
                    warn!("Immediate execution left exception unhandled: {d}");
                }
            }
            Schedule::Deferred(delay) => spawn_deferred(executor.clone(), delay)?,
            Schedule::Manual => {}
        }

        Ok(executor)
    }

    fn into_executor(self) -> GuardedExecutor {
        GuardedExecutor {
            work: self.work,
            on_error: self.on_error,
            on_finally: self.on_finally,
            schedule: self.schedule,
            fallback: self.fallback,
            sink: self.sink,
            runs: Arc::new(AtomicU64::new(0)),
            last: Arc::new(Mutex::new(None)),
        }
    }
}

// ── One-shot entry points ───────────────────────────────

/// Builds a reusable executor around `work`. Alias of [`GuardedExecutor::builder`].
pub fn create<F, R>(work: F) -> GuardedExecutorBuilder
where
    F: Fn() -> R + Send + Sync + 'static,
    R: WorkResult,
{
    GuardedExecutor::builder(work)
}

/// Runs `work` once. An exception goes to the default sink and comes
/// back as [`Outcome::Unhandled`].
pub fn try_run<F, R>(work: F) -> Outcome
where
    F: Fn() -> R + Send + Sync + 'static,
    R: WorkResult,
{
    GuardedExecutor::builder(work).into_executor().run()
}

/// Runs `work` once, routing an exception to `on_error`.
pub fn try_catch<F, R, E>(work: F, on_error: E) -> Outcome
where
    F: Fn() -> R + Send + Sync + 'static,
    R: WorkResult,
    E: Fn(&ExceptionDescriptor) + Send + Sync + 'static,
{
    GuardedExecutor::builder(work)
        .on_error(on_error)
        .into_executor()
        .run()
}

/// Runs `work` once, routing an exception to `on_error`, then runs
/// `on_finally` whatever happened.
pub fn try_catch_finally<F, R, E, G>(work: F, on_error: E, on_finally: G) -> Outcome
where
    F: Fn() -> R + Send + Sync + 'static,
    R: WorkResult,
    E: Fn(&ExceptionDescriptor) + Send + Sync + 'static,
    G: Fn() + Send + Sync + 'static,
{
    GuardedExecutor::builder(work)
        .on_error(on_error)
        .on_finally(on_finally)
        .into_executor()
        .run()
}
