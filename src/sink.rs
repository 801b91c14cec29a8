//! Where unhandled exceptions are reported.

use tracing::error;

use crate::exception::ExceptionDescriptor;

/// Receives descriptors for exceptions that no error handler took.
///
/// Called at most once per execution, before the finalizer runs.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, descriptor: &ExceptionDescriptor);
}

/// Default sink: one `error!` event per unhandled exception.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, d: &ExceptionDescriptor) {
        let user_info = d
            .user_info
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");

        error!(
            exception = %d.name,
            reason = %d.reason,
            origin = %d.origin,
            location = d.location.as_deref().unwrap_or("-"),
            user_info = %user_info,
            captured_at = %d.captured_at.to_rfc3339(),
            "Unhandled exception in guarded work unit: {}\n{}",
            d,
            d.stack_trace
        );
    }
}
