//! Exceptions and the descriptors captured when one is raised.
//!
//! A work unit can fail in two ways that the guarded executor treats
//! the same: it can unwind (a panic, possibly carrying a typed
//! [`Exception`] raised with [`raise`]), or it can return an `Err`.
//! Either way the failure is turned into an [`ExceptionDescriptor`]
//! that handlers and diagnostic sinks can inspect.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Name given to panics that do not carry an [`Exception`] payload.
pub const PANIC_NAME: &str = "Panic";

/// Name given to `Err` values that are not an [`Exception`].
pub const ERROR_NAME: &str = "Error";

/// A named exception that a work unit can raise or return.
///
/// Raising (see [`Exception::raise`]) unwinds the stack like any other
/// panic; the guarded executor recovers the exception intact on the
/// other side of the supervision boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {reason}")]
pub struct Exception {
    name: String,
    reason: String,
    user_info: BTreeMap<String, String>,
}

impl Exception {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
            user_info: BTreeMap::new(),
        }
    }

    /// Attaches a key/value pair to the exception's user info.
    pub fn with_info(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.user_info.insert(key.into(), value.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn user_info(&self) -> &BTreeMap<String, String> {
        &self.user_info
    }

    /// Raises this exception by unwinding the current thread.
    pub fn raise(self) -> ! {
        std::panic::panic_any(self)
    }
}

/// Raises `exception`. Shorthand for [`Exception::raise`].
pub fn raise(exception: Exception) -> ! {
    exception.raise()
}

/// Which failure channel produced a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The work unit unwound.
    Panic,
    /// The work unit returned `Err`.
    Error,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Panic => write!(f, "panic"),
            Origin::Error => write!(f, "error"),
        }
    }
}

/// Everything captured about one raised exception.
#[derive(Debug, Clone)]
pub struct ExceptionDescriptor {
    pub name: String,
    pub reason: String,
    pub user_info: BTreeMap<String, String>,
    /// `file:line:column` of the panic, when the failure was a panic.
    pub location: Option<String>,
    /// Rendered call stack at the point of capture. Never empty.
    pub stack_trace: String,
    pub origin: Origin,
    pub captured_at: DateTime<Utc>,
}

impl ExceptionDescriptor {
    fn new(exception: Exception, origin: Origin, location: Option<String>, stack_trace: String) -> Self {
        Self {
            name: exception.name,
            reason: exception.reason,
            user_info: exception.user_info,
            location,
            stack_trace: non_empty_trace(stack_trace),
            origin,
            captured_at: Utc::now(),
        }
    }

    /// Builds a descriptor from a panic payload recovered by `catch_unwind`.
    pub(crate) fn from_panic(
        payload: Box<dyn Any + Send>,
        location: Option<String>,
        stack_trace: String,
    ) -> Self {
        let exception = match payload.downcast::<Exception>() {
            Ok(exception) => *exception,
            Err(payload) => Exception::new(PANIC_NAME, panic_message(payload.as_ref())),
        };
        Self::new(exception, Origin::Panic, location, stack_trace)
    }

    /// Builds a descriptor from an `Err` returned by a fallible work unit.
    pub(crate) fn from_error(err: anyhow::Error, stack_trace: String) -> Self {
        let exception = match err.downcast_ref::<Exception>() {
            Some(exception) => exception.clone(),
            None => Exception::new(ERROR_NAME, format!("{err:#}")),
        };
        Self::new(exception, Origin::Error, None, stack_trace)
    }

    /// True when this descriptor matches the given exception name.
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

impl fmt::Display for ExceptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)?;
        if let Some(ref location) = self.location {
            write!(f, " (at {location})")?;
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn non_empty_trace(trace: String) -> String {
    if trace.trim().is_empty() {
        "<stack trace unavailable>".to_string()
    } else {
        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_display() {
        let e = Exception::new("ArithmeticError", "division by zero");
        assert_eq!(e.to_string(), "ArithmeticError: division by zero");
    }

    #[test]
    fn test_with_info_accumulates() {
        let e = Exception::new("InvalidArchiveError", "bad header")
            .with_info("line", 3)
            .with_info("column", 14);
        assert_eq!(e.user_info().get("line").map(String::as_str), Some("3"));
        assert_eq!(e.user_info().get("column").map(String::as_str), Some("14"));
    }

    // ── from_panic ──────────────────────────────────────

    #[test]
    fn test_from_panic_typed_exception() {
        let payload: Box<dyn Any + Send> =
            Box::new(Exception::new("ArithmeticError", "division by zero").with_info("lhs", 7));
        let d = ExceptionDescriptor::from_panic(payload, Some("src/lib.rs:1:1".into()), "frame".into());
        assert_eq!(d.name, "ArithmeticError");
        assert_eq!(d.reason, "division by zero");
        assert_eq!(d.user_info.get("lhs").map(String::as_str), Some("7"));
        assert_eq!(d.origin, Origin::Panic);
        assert_eq!(d.location.as_deref(), Some("src/lib.rs:1:1"));
    }

    #[test]
    fn test_from_panic_str_payload() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        let d = ExceptionDescriptor::from_panic(payload, None, "frame".into());
        assert_eq!(d.name, PANIC_NAME);
        assert_eq!(d.reason, "boom");
    }

    #[test]
    fn test_from_panic_string_payload() {
        let payload: Box<dyn Any + Send> = Box::new(format!("index {} out of range", 4));
        let d = ExceptionDescriptor::from_panic(payload, None, "frame".into());
        assert_eq!(d.reason, "index 4 out of range");
    }

    #[test]
    fn test_from_panic_opaque_payload() {
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        let d = ExceptionDescriptor::from_panic(payload, None, "frame".into());
        assert_eq!(d.reason, "non-string panic payload");
    }

    // ── from_error ──────────────────────────────────────

    #[test]
    fn test_from_error_keeps_exception_identity() {
        let err = anyhow::Error::new(Exception::new("ArithmeticError", "division by zero"));
        let d = ExceptionDescriptor::from_error(err, "frame".into());
        assert!(d.is("ArithmeticError"));
        assert_eq!(d.reason, "division by zero");
        assert_eq!(d.origin, Origin::Error);
        assert!(d.location.is_none());
    }

    #[test]
    fn test_from_error_plain_error_includes_context() {
        let err = anyhow::anyhow!("file not found").context("reading archive");
        let d = ExceptionDescriptor::from_error(err, "frame".into());
        assert_eq!(d.name, ERROR_NAME);
        assert_eq!(d.reason, "reading archive: file not found");
    }

    #[test]
    fn test_empty_trace_is_replaced() {
        let d = ExceptionDescriptor::from_error(anyhow::anyhow!("x"), "  \n".into());
        assert!(!d.stack_trace.trim().is_empty());
    }

    #[test]
    fn test_descriptor_display_with_location() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        let d = ExceptionDescriptor::from_panic(payload, Some("a.rs:2:3".into()), "frame".into());
        assert_eq!(d.to_string(), "Panic: boom (at a.rs:2:3)");
    }
}
