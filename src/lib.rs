//! Run work units that may unwind, without letting them take the
//! process down.
//!
//! ```no_run
//! use guarded_exec::{try_catch_finally, raise, Exception};
//!
//! fn divide(a: i32, b: i32) -> i32 {
//!     a.checked_div(b)
//!         .unwrap_or_else(|| raise(Exception::new("ArithmeticError", "division by zero")))
//! }
//!
//! let outcome = try_catch_finally(
//!     || {
//!         let _ = divide(1, 0);
//!     },
//!     |e| eprintln!("caught {}: {}", e.name, e.reason),
//!     || eprintln!("done"),
//! );
//! assert!(outcome.raised());
//! ```

pub mod archive;
pub mod config;
pub mod exception;
pub mod executor;
pub mod schedule;
pub mod sink;
pub mod supervisor;

pub use exception::{raise, Exception, ExceptionDescriptor, Origin};
pub use executor::{
    create, try_catch, try_catch_finally, try_run, Fallback, GuardedExecutor,
    GuardedExecutorBuilder, Lifecycle, Outcome, WorkResult,
};
pub use schedule::{Schedule, ScheduleError};
pub use sink::{DiagnosticSink, TracingSink};
