//! # Buffer Error Kinds
//!
//! Typed errors raised by the buffer manager. All fallible operations return
//! `eyre::Result`; the kinds below are attached with `eyre::bail!` so callers
//! can downcast to the specific failure class:
//!
//! ```ignore
//! match mb.get_batch(true, &types) {
//!     Err(e) if matches!(e.downcast_ref(), Some(BufferError::NotFound { .. })) => ...,
//!     other => ...,
//! }
//! ```
//!
//! ## Kinds
//!
//! - `Io`: storage failure during read/write/compaction. Fatal for the batch
//!   that triggered it, never for the buffer manager itself.
//! - `Format`: deserialization failure (bad tag, truncated stream).
//! - `NotFound`: a physical-map or LOB lookup for an entry that was
//!   concurrently removed. Under correct use this signals a caller holding a
//!   dangling reference.
//! - `Interrupted`: a waiter in `reserve_buffers` was woken by shutdown.
//! - `Closed`: operation on a removed tuple buffer.

use std::fmt;

#[derive(Debug)]
pub enum BufferError {
    Io {
        context: String,
        source: std::io::Error,
    },
    Format {
        detail: String,
    },
    NotFound {
        what: String,
    },
    Interrupted,
    Closed,
}

impl BufferError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BufferError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn format(detail: impl Into<String>) -> Self {
        BufferError::Format {
            detail: detail.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        BufferError::NotFound { what: what.into() }
    }
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Io { context, source } => {
                write!(f, "storage error while {context}: {source}")
            }
            BufferError::Format { detail } => write!(f, "malformed batch data: {detail}"),
            BufferError::NotFound { what } => write!(f, "{what} not found"),
            BufferError::Interrupted => write!(f, "buffer reservation interrupted"),
            BufferError::Closed => write!(f, "tuple buffer has been removed"),
        }
    }
}

impl std::error::Error for BufferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BufferError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = BufferError::io(
            "reading batch 3",
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"),
        );
        let text = err.to_string();
        assert!(text.contains("reading batch 3"));
    }

    #[test]
    fn test_downcast_through_eyre() {
        let report: eyre::Report = BufferError::not_found("batch 42").into();
        assert!(matches!(
            report.downcast_ref::<BufferError>(),
            Some(BufferError::NotFound { .. })
        ));
    }
}
