//! Archive envelope decoding.
//!
//! Decoding does not return an error for a malformed archive: it raises
//! `InvalidArchiveError`. Callers are expected to decode under a
//! [`GuardedExecutor`](crate::executor::GuardedExecutor).

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::exception::{raise, Exception};

/// Name of the exception raised for undecodable archives.
pub const INVALID_ARCHIVE: &str = "InvalidArchiveError";

/// Value of the `archiver` field written and accepted by this crate.
pub const ARCHIVER: &str = "guarded-exec";

pub const ARCHIVE_VERSION: u64 = 1;

/// Encodes `root` into an archive envelope.
pub fn archive(root: &Value) -> Vec<u8> {
    let envelope = json!({
        "archiver": ARCHIVER,
        "version": ARCHIVE_VERSION,
        "root": root,
    });
    // Serializing a `Value` cannot fail.
    serde_json::to_vec_pretty(&envelope).unwrap_or_default()
}

/// Decodes an archive envelope and returns its root value.
///
/// Raises `InvalidArchiveError` if `bytes` is not a valid archive.
pub fn unarchive(bytes: &[u8]) -> Value {
    let envelope: Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => raise(
            Exception::new(INVALID_ARCHIVE, format!("malformed archive: {e}"))
                .with_info("line", e.line())
                .with_info("column", e.column()),
        ),
    };

    let Value::Object(mut fields) = envelope else {
        raise(Exception::new(INVALID_ARCHIVE, "archive is not an object"));
    };

    match fields.get("archiver").and_then(Value::as_str) {
        Some(ARCHIVER) => {}
        Some(other) => raise(
            Exception::new(INVALID_ARCHIVE, format!("unknown archiver '{other}'"))
                .with_info("archiver", other),
        ),
        None => raise(Exception::new(INVALID_ARCHIVE, "missing archiver field")),
    }

    match fields.get("version").and_then(Value::as_u64) {
        Some(ARCHIVE_VERSION) => {}
        Some(v) => raise(
            Exception::new(INVALID_ARCHIVE, format!("unsupported archive version {v}"))
                .with_info("version", v),
        ),
        None => raise(Exception::new(INVALID_ARCHIVE, "missing version field")),
    }

    match fields.remove("root") {
        Some(root) => root,
        None => raise(Exception::new(INVALID_ARCHIVE, "missing root object")),
    }
}

/// Reads and decodes the archive at `path`.
///
/// I/O failures and oversized files are returned as `Err`; a file that
/// is readable but not an archive raises like [`unarchive`].
pub fn unarchive_file(path: impl AsRef<Path>, max_bytes: u64) -> Result<Value> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path)
        .with_context(|| format!("cannot stat archive {}", path.display()))?;
    if meta.len() > max_bytes {
        bail!(
            "archive {} is {} bytes, limit is {max_bytes}",
            path.display(),
            meta.len()
        );
    }

    let bytes = std::fs::read(path)
        .with_context(|| format!("cannot read archive {}", path.display()))?;
    Ok(unarchive(&bytes))
}
