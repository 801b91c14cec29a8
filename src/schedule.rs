//! When an executor runs after it is built.

use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::executor::{GuardedExecutor, Outcome};

/// Scheduling mode applied by [`GuardedExecutorBuilder::build`].
///
/// [`GuardedExecutorBuilder::build`]: crate::executor::GuardedExecutorBuilder::build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// Run once, synchronously, before `build` returns.
    #[default]
    Immediate,
    /// Run once on the Tokio runtime after the delay. Fire-and-forget.
    Deferred(Duration),
    /// Never run automatically; the caller calls `run`.
    Manual,
}

impl Schedule {
    /// Maps the signed seconds convention: negative is manual,
    /// zero is immediate, positive is deferred by that many seconds.
    pub fn from_delay_secs(secs: i64) -> Self {
        match secs {
            s if s < 0 => Schedule::Manual,
            0 => Schedule::Immediate,
            s => Schedule::Deferred(Duration::from_secs(s.unsigned_abs())),
        }
    }

    /// False only for `Manual`.
    pub fn runs_automatically(&self) -> bool {
        !matches!(self, Schedule::Manual)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("deferred execution ({delay:?}) requires a running Tokio runtime")]
    NoRuntime { delay: Duration },
}

/// Spawns one deferred run of `executor` on the current Tokio runtime.
///
/// The work unit runs on the blocking pool. There is no handle to
/// cancel it.
pub(crate) fn spawn_deferred(executor: GuardedExecutor, delay: Duration) -> Result<(), ScheduleError> {
    let handle = Handle::try_current().map_err(|_| ScheduleError::NoRuntime { delay })?;

    debug!("Scheduling guarded execution in {}ms", delay.as_millis());
    handle.spawn(async move {
        tokio::time::sleep(delay).await;
        match tokio::task::spawn_blocking(move || executor.run()).await {
            Ok(Outcome::Unhandled(d)) => warn!("Deferred execution left exception unhandled: {d}"),
            Ok(outcome) => debug!("Deferred execution finished: {outcome:?}"),
            // A handler or finalizer panicked; they run unsupervised.
            Err(e) => error!("Deferred execution aborted: {e}"),
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_delay_secs_negative_is_manual() {
        assert_eq!(Schedule::from_delay_secs(-1), Schedule::Manual);
        assert_eq!(Schedule::from_delay_secs(i64::MIN), Schedule::Manual);
    }

    #[test]
    fn test_from_delay_secs_zero_is_immediate() {
        assert_eq!(Schedule::from_delay_secs(0), Schedule::Immediate);
    }

    #[test]
    fn test_from_delay_secs_positive_is_deferred() {
        assert_eq!(
            Schedule::from_delay_secs(3),
            Schedule::Deferred(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_default_is_immediate() {
        assert_eq!(Schedule::default(), Schedule::Immediate);
    }

    #[test]
    fn test_runs_automatically() {
        assert!(Schedule::Immediate.runs_automatically());
        assert!(Schedule::Deferred(Duration::from_millis(5)).runs_automatically());
        assert!(!Schedule::Manual.runs_automatically());
    }

    #[test]
    fn test_spawn_without_runtime_fails() {
        let executor = GuardedExecutor::builder(|| ())
            .schedule(Schedule::Manual)
            .build()
            .unwrap();
        let err = spawn_deferred(executor, Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("Tokio runtime"));
    }
}
