//! The supervised region.
//!
//! A process-wide panic hook is installed the first time a region is
//! entered. While the current thread is inside a region the hook
//! records the panic location and a forced backtrace instead of
//! printing; outside any region it hands the panic to whichever hook
//! was installed before. Panics a work unit catches on its own are
//! recorded the same way and are not printed either.
//!
//! Unwinding is required: with `panic = "abort"` nothing can be caught.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use crate::exception::ExceptionDescriptor;

static HOOK: Once = Once::new();

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_PANIC: RefCell<Option<PanicCapture>> = const { RefCell::new(None) };
}

/// What the hook saw when a supervised panic was raised.
struct PanicCapture {
    location: Option<String>,
    stack_trace: String,
}

fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let supervised = DEPTH.try_with(Cell::get).unwrap_or(0) > 0;
            if !supervised {
                previous(info);
                return;
            }
            let capture = PanicCapture {
                location: info.location().map(|l| l.to_string()),
                stack_trace: Backtrace::force_capture().to_string(),
            };
            let _ = LAST_PANIC.try_with(|slot| *slot.borrow_mut() = Some(capture));
        }));
    });
}

/// Marks the current thread as supervised for its lifetime.
struct Region;

impl Region {
    /// Also drops any capture left by a panic the previous work unit
    /// caught itself.
    fn enter() -> Self {
        LAST_PANIC.with(|slot| slot.borrow_mut().take());
        DEPTH.with(|d| d.set(d.get() + 1));
        Region
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cfg(test)]
fn is_supervised() -> bool {
    DEPTH.with(Cell::get) > 0
}

/// Runs `work` inside a supervised region.
///
/// Panics and `Err` results both come back as an [`ExceptionDescriptor`];
/// nothing raised by `work` escapes this call.
pub(crate) fn supervise<F>(work: F) -> Result<(), ExceptionDescriptor>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    install_hook();

    let result = {
        let _region = Region::enter();
        panic::catch_unwind(AssertUnwindSafe(work))
    };

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ExceptionDescriptor::from_error(
            err,
            Backtrace::force_capture().to_string(),
        )),
        Err(payload) => {
            // The hook may have been replaced by someone else since install.
            let capture = LAST_PANIC.with(|slot| slot.borrow_mut().take());
            let (location, stack_trace) = match capture {
                Some(c) => (c.location, c.stack_trace),
                None => (None, Backtrace::force_capture().to_string()),
            };
            Err(ExceptionDescriptor::from_panic(payload, location, stack_trace))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::{raise, Exception, Origin, PANIC_NAME};

    #[test]
    fn test_success_passes_through() {
        assert!(supervise(|| Ok(())).is_ok());
    }

    #[test]
    fn test_catches_plain_panic() {
        let d = supervise(|| panic!("kaboom")).unwrap_err();
        assert_eq!(d.name, PANIC_NAME);
        assert_eq!(d.reason, "kaboom");
        assert_eq!(d.origin, Origin::Panic);
        assert!(d.location.as_deref().unwrap().contains("supervisor.rs"));
        assert!(!d.stack_trace.is_empty());
    }

    #[test]
    fn test_catches_raised_exception() {
        let d = supervise(|| raise(Exception::new("ArithmeticError", "division by zero")))
            .unwrap_err();
        assert_eq!(d.name, "ArithmeticError");
        assert_eq!(d.reason, "division by zero");
    }

    #[test]
    fn test_catches_integer_division_by_zero() {
        let divisor = std::hint::black_box(0u32);
        let d = supervise(|| {
            let _ = 10u32 / divisor;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(d.name, PANIC_NAME);
        assert!(d.reason.contains("divide by zero"));
    }

    #[test]
    fn test_err_becomes_descriptor() {
        let d = supervise(|| Err(anyhow::anyhow!("corrupt header"))).unwrap_err();
        assert_eq!(d.reason, "corrupt header");
        assert_eq!(d.origin, Origin::Error);
        assert!(!d.stack_trace.is_empty());
    }

    #[test]
    fn test_region_depth_restored_after_panic() {
        assert!(!is_supervised());
        let _ = supervise(|| {
            assert!(is_supervised());
            panic!("inside")
        });
        assert!(!is_supervised());
    }

    #[test]
    fn test_self_caught_panic_leaves_no_stale_capture() {
        let outer = supervise(|| {
            let caught = panic::catch_unwind(|| {
                if std::hint::black_box(true) {
                    panic!("caught by the work unit");
                }
            });
            assert!(caught.is_err());
            Ok(())
        });
        assert!(outer.is_ok());

        let next = supervise(|| {
            assert!(LAST_PANIC.with(|slot| slot.borrow().is_none()));
            Ok(())
        });
        assert!(next.is_ok());
    }

    #[test]
    fn test_nested_regions_capture_inner_panic() {
        let outer = supervise(|| {
            let inner = supervise(|| panic!("inner"));
            assert_eq!(inner.unwrap_err().reason, "inner");
            assert!(is_supervised());
            Ok(())
        });
        assert!(outer.is_ok());
    }
}
