//! Error types for the transformation and reader layers.
//!
//! This module provides structured error types so that callers can branch on
//! specific failure modes instead of matching on integer status codes.
//!
//! # Error Classification
//!
//! - [`TransformError`]: registry and transformation-stack failures. These are
//!   returned to the protocol module that attempted the transform, which
//!   decides whether to abort the connection or report a protocol-level
//!   failure to its peer. They are never retried internally.
//! - [`SessionError`]: session registry failures, including the
//!   administrative attach path.
//! - [`ReadError`]: incremental reader failures. `TimedOut` and `Closed` are
//!   ordinary, expected outcomes that a caller may handle in a poll loop;
//!   `BufferFull`, `TooLarge`, and `Io` are fatal to the current record.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::transform::{DirectionMask, TransformKind};

/// Boxed error produced by a transformer's own hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from the transformer registry and transformation stack.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A transformer with this name (compared case-insensitively) is already
    /// registered.
    #[error("transformer '{name}' is already registered")]
    DuplicateName {
        /// The colliding name as submitted.
        name: String,
    },

    /// No transformer with this name is registered.
    #[error("no transformer named '{name}' is registered")]
    NotFound {
        /// The name that was looked up.
        name: String,
    },

    /// No registered transformer matches the requested kind and direction.
    ///
    /// Callers normally pre-check with
    /// [`available_kind`](crate::transform::registry::TransformerRegistry::available_kind);
    /// hitting this during setup means a transformer was unregistered in
    /// between, which is an accepted low-probability race.
    #[error("no transformer for {kind} covering direction {direction} is registered")]
    Unavailable {
        /// Requested transformation kind.
        kind: TransformKind,
        /// Requested direction mask.
        direction: DirectionMask,
    },

    /// A transformation of this kind is already active on the stack.
    #[error("a {kind} transformation is already active on this stack")]
    AlreadyActive {
        /// The duplicated kind.
        kind: TransformKind,
    },

    /// Encryption was requested after compression was already active.
    ///
    /// Transformations are layered onto the raw stream in the order they are
    /// added and cannot be inserted beneath an already-active layer, so
    /// encryption must be set up before compression.
    #[error("encryption cannot be enabled after compression is already active")]
    OrderingConflict,

    /// The transformation stack has no free slot.
    #[error("transformation stack is full ({capacity} slots)")]
    Exhausted {
        /// Slot capacity of the stack.
        capacity: usize,
    },

    /// The transformer's own setup hook declined.
    #[error("transformer setup failed: {source}")]
    SetupFailed {
        /// The hook's error.
        #[source]
        source: HookError,
    },

    /// Setup succeeded but no slot remained when storing the private state.
    ///
    /// The hook's `cleanup` has already run and the owning module's use count
    /// was never incremented. Distinct from both [`Exhausted`] (detected
    /// before the hook ran) and [`SetupFailed`].
    ///
    /// [`Exhausted`]: TransformError::Exhausted
    #[error("no free slot remained while storing transformation state")]
    StorageRaced,
}

impl TransformError {
    /// Returns `true` if the failure was detected before the transformer's
    /// setup hook ran, i.e. the stack and the connection's endpoints were not
    /// touched.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName { .. }
                | Self::NotFound { .. }
                | Self::Unavailable { .. }
                | Self::AlreadyActive { .. }
                | Self::OrderingConflict
                | Self::Exhausted { .. }
        )
    }
}

/// Errors from the session registry.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A session already references this transformation stack.
    #[error("session {id} is already registered for this transformation stack")]
    AlreadyRegistered {
        /// Identifier of the existing session.
        id: u64,
    },

    /// No session references this transformation stack.
    #[error("transformation stack has no registered session ({total} sessions active)")]
    NotRegistered {
        /// Number of sessions currently registered, for diagnostics.
        total: usize,
    },

    /// No session with this identifier exists.
    #[error("no such session: {id}")]
    NoSuchSession {
        /// The identifier that was looked up.
        id: u64,
    },

    /// A transformation operation performed on behalf of a session failed.
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Errors from the delimited reader.
#[derive(Debug, Error)]
pub enum ReadError {
    /// No data became readable within the timeout.
    ///
    /// Distinct from [`Closed`] and [`Io`]; a caller may simply poll again.
    ///
    /// [`Closed`]: ReadError::Closed
    /// [`Io`]: ReadError::Io
    #[error("no data within {timeout:?}")]
    TimedOut {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The peer closed the stream (a read returned zero bytes).
    #[error("stream closed by peer")]
    Closed,

    /// The record exceeds the reader's fixed buffer.
    ///
    /// The record is unrecoverable; the caller must abort the connection or
    /// resynchronize. Data is never silently truncated.
    #[error("record exceeds buffer capacity ({capacity} bytes)")]
    BufferFull {
        /// Capacity of the fixed buffer.
        capacity: usize,
    },

    /// Accumulated boundary-mode data exceeds the caller's maximum.
    #[error("accumulated data exceeds maximum of {limit} bytes")]
    TooLarge {
        /// The configured maximum.
        limit: usize,
    },

    /// Boundary mode was used before a boundary was configured.
    #[error("no boundary configured; call set_boundary first")]
    MissingBoundary,

    /// Unexpected transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ReadError {
    /// Returns `true` for outcomes a caller is expected to handle and
    /// possibly retry (timeouts and clean closure), as opposed to hard
    /// failures that terminate the current record.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::TimedOut { .. } | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_closed_are_recoverable() {
        assert!(ReadError::TimedOut {
            timeout: Duration::from_millis(100)
        }
        .is_recoverable());
        assert!(ReadError::Closed.is_recoverable());
    }

    #[test]
    fn hard_read_failures_are_not_recoverable() {
        assert!(!ReadError::BufferFull { capacity: 256 }.is_recoverable());
        assert!(!ReadError::TooLarge { limit: 4096 }.is_recoverable());
        assert!(!ReadError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).is_recoverable());
    }

    #[test]
    fn precondition_failures_do_not_touch_the_stack() {
        assert!(TransformError::OrderingConflict.is_precondition());
        assert!(TransformError::Exhausted { capacity: 8 }.is_precondition());
        assert!(!TransformError::StorageRaced.is_precondition());
        assert!(!TransformError::SetupFailed {
            source: "declined".into()
        }
        .is_precondition());
    }

    #[test]
    fn session_error_wraps_transform_error() {
        let err = SessionError::from(TransformError::OrderingConflict);
        assert!(matches!(err, SessionError::Transform(_)));
        assert_eq!(
            err.to_string(),
            "encryption cannot be enabled after compression is already active"
        );
    }
}
