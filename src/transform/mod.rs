//! I/O transformation kinds, the transformer capability contract, and the
//! per-connection transformation stack.
//!
//! A connection's I/O is a pair of raw file-descriptor endpoints. A
//! transformation (TLS encryption, deflate compression, session logging)
//! wraps those endpoints by swapping in its own intermediary, typically an
//! internal pipe serviced by the transform module. The core never touches the
//! transformed byte stream itself; it only tracks which transformations are
//! active, in what order they may be added, and the opaque per-slot state
//! their hooks produced.
//!
//! # Ordering
//!
//! Transformations form a push-down stack of stream wrappers: the most
//! recently added wrapper is the outermost. Encryption must wrap a
//! still-plaintext path, so once compression is active it is too late to add
//! encryption. Compression over encryption is always allowed, matching the
//! usual protocol upgrade sequence (negotiate TLS, then optionally negotiate
//! compression). This is the single cross-kind rule and is enforced centrally
//! in [`TransformStack::possible`] rather than per transformer.
//!
//! # Invariants
//!
//! - At most one active slot per [`TransformKind`] on a stack.
//! - A slot's private state is created by its transformer's `setup`, consumed
//!   only by that transformer's `query`/`cleanup`, and never inspected by the
//!   core.
//! - Each active slot holds the owning module's use count until teardown.

pub mod registry;

use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::error::{HookError, TransformError};
use crate::module::ModuleHandle;

/// Maximum number of simultaneously active transformations per connection.
///
/// A deliberate bound against runaway transform stacking; with one slot per
/// kind the practical ceiling is far lower.
pub const MAX_TRANSFORMS: usize = 8;

/// The closed set of transformation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransformKind {
    /// TLS encryption of the whole stream.
    Encryption,
    /// Deflate compression of the whole stream.
    Compression,
    /// Passive logging of session traffic.
    SessionLogging,
}

impl TransformKind {
    /// Human-readable label used in listings and log lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Encryption => "encryption",
            Self::Compression => "compression",
            Self::SessionLogging => "session logging",
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which directions of a connection a transformer supports.
///
/// `RX` is the server-reads/client-writes path, `TX` the reverse. A
/// registered transformer advertises a mask; a setup request carries a mask
/// that must be covered by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DirectionMask(u8);

impl DirectionMask {
    /// Server reads, client writes.
    pub const RX: Self = Self(0b01);
    /// Server writes, client reads.
    pub const TX: Self = Self(0b10);
    /// Both directions.
    pub const BOTH: Self = Self(0b11);

    /// Returns `true` if every direction in `other` is included in `self`.
    #[must_use]
    pub const fn covers(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Display for DirectionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RX => f.write_str("rx"),
            Self::TX => f.write_str("tx"),
            Self::BOTH => f.write_str("rx+tx"),
            other => write!(f, "mask({:#04b})", other.0),
        }
    }
}

/// A connection's mutable endpoint-handle locations.
///
/// Transformer setup hooks receive this mutably and may redirect either side
/// through an intermediary of their own (for example an internal pipe drained
/// by a service thread that performs the actual TLS or deflate I/O). After a
/// successful setup, readers and writers simply use the new descriptors; the
/// redirection is entirely endpoint-level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    /// Descriptor the server reads from.
    pub read: RawFd,
    /// Descriptor the server writes to.
    pub write: RawFd,
}

/// Outcome of a transformation query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The transformer's query hook handled the request.
    Handled,
    /// The transformation is active but its transformer exposes no query
    /// hook. Not a failure.
    Unsupported,
}

/// Capability contract implemented by each transformer.
///
/// The three operations mirror the extension-module contract: `setup` splices
/// the transform into the connection's endpoints and returns opaque private
/// state, `query` answers introspection requests against that state (bytes
/// encrypted so far, negotiated cipher, ...), and `cleanup` consumes the
/// state when the transformation is torn down.
///
/// Hooks run synchronously on the calling connection thread. `setup` may
/// block (a TLS handshake, for instance); that is a rare, bounded event and
/// is accepted.
pub trait Transformer: Send + Sync {
    /// Splices the transform into the connection, returning its private
    /// state.
    ///
    /// `arg` is an opaque per-call argument forwarded from the protocol
    /// module (for example a server name for SNI).
    ///
    /// # Errors
    ///
    /// Any error the transform's own negotiation produces. On error the
    /// endpoints must be left usable as they were.
    fn setup(
        &self,
        endpoints: &mut EndpointPair,
        direction: DirectionMask,
        arg: Option<&dyn Any>,
    ) -> Result<Box<dyn Any + Send>, HookError>;

    /// Answers an introspection query against a live transformation.
    ///
    /// The default implementation reports [`QueryOutcome::Unsupported`].
    fn query(&self, state: &mut (dyn Any + Send), code: u32, data: &mut dyn Any) -> QueryOutcome {
        let _ = (state, code, data);
        QueryOutcome::Unsupported
    }

    /// Tears the transformation down, consuming its private state.
    ///
    /// Expected never to fail; runs unconditionally on connection close.
    fn cleanup(&self, state: Box<dyn Any + Send>);
}

/// An immutable registry entry: a named transformer plus its owning module.
pub struct RegisteredTransformer {
    name: String,
    kind: TransformKind,
    directions: DirectionMask,
    hooks: Box<dyn Transformer>,
    module: ModuleHandle,
}

impl RegisteredTransformer {
    pub(crate) fn new(
        name: String,
        kind: TransformKind,
        directions: DirectionMask,
        hooks: Box<dyn Transformer>,
        module: ModuleHandle,
    ) -> Self {
        Self {
            name,
            kind,
            directions,
            hooks,
            module,
        }
    }

    /// The transformer's display name (unique case-insensitively).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transformation kind this transformer provides.
    #[must_use]
    pub const fn kind(&self) -> TransformKind {
        self.kind
    }

    /// The directions this transformer supports.
    #[must_use]
    pub const fn directions(&self) -> DirectionMask {
        self.directions
    }

    /// The owning extension module.
    #[must_use]
    pub const fn module(&self) -> &ModuleHandle {
        &self.module
    }

    pub(crate) fn run_setup(
        &self,
        endpoints: &mut EndpointPair,
        direction: DirectionMask,
        arg: Option<&dyn Any>,
    ) -> Result<Box<dyn Any + Send>, HookError> {
        self.hooks.setup(endpoints, direction, arg)
    }

    pub(crate) fn run_query(
        &self,
        state: &mut (dyn Any + Send),
        code: u32,
        data: &mut dyn Any,
    ) -> QueryOutcome {
        self.hooks.query(state, code, data)
    }

    pub(crate) fn run_cleanup(&self, state: Box<dyn Any + Send>) {
        self.hooks.cleanup(state);
    }
}

impl fmt::Debug for RegisteredTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTransformer")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("directions", &self.directions)
            .field("module", &self.module.name())
            .finish_non_exhaustive()
    }
}

/// One occupied stack slot: a transformer plus the private state its setup
/// produced.
struct ActiveTransform {
    transformer: Arc<RegisteredTransformer>,
    state: Box<dyn Any + Send>,
}

/// The ordered set of transformations active on one connection.
///
/// Fixed capacity, associated 1:1 with a connection, and single-writer: the
/// connection's own thread performs all steady-state mutation. The session
/// registry's administrative path is the only other accessor and serializes
/// itself externally (see [`crate::session`]).
#[derive(Default)]
pub struct TransformStack {
    slots: [Option<ActiveTransform>; MAX_TRANSFORMS],
}

impl TransformStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether a transformation of `kind` could currently be added.
    ///
    /// Fails with [`TransformError::AlreadyActive`] if a transformation of
    /// the same kind is active, or [`TransformError::OrderingConflict`] if
    /// encryption is requested while compression is active. Callers may use
    /// this as a silent pre-check; the setup path applies the same rules.
    ///
    /// # Errors
    ///
    /// See above; no other failures.
    pub fn possible(&self, kind: TransformKind) -> Result<(), TransformError> {
        if self.active(kind) {
            return Err(TransformError::AlreadyActive { kind });
        }
        if kind == TransformKind::Encryption && self.active(TransformKind::Compression) {
            return Err(TransformError::OrderingConflict);
        }
        Ok(())
    }

    /// Returns `true` if a transformation of `kind` is active.
    #[must_use]
    pub fn active(&self, kind: TransformKind) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|slot| slot.transformer.kind() == kind)
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Returns `true` if at least one slot is free.
    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Names of the active transformations, in slot order.
    #[must_use]
    pub fn active_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.transformer.name().to_owned())
            .collect()
    }

    /// Delegates an introspection query to the active transformation of
    /// `kind`.
    ///
    /// # Errors
    ///
    /// [`TransformError::NotFound`] if no transformation of `kind` is active.
    /// An active transformation whose transformer exposes no query hook
    /// reports [`QueryOutcome::Unsupported`] instead of failing.
    pub fn query(
        &mut self,
        kind: TransformKind,
        code: u32,
        data: &mut dyn Any,
    ) -> Result<QueryOutcome, TransformError> {
        let slot = self
            .slots
            .iter_mut()
            .flatten()
            .find(|slot| slot.transformer.kind() == kind)
            .ok_or_else(|| TransformError::NotFound {
                name: kind.label().to_owned(),
            })?;
        Ok(slot.transformer.run_query(&mut *slot.state, code, data))
    }

    /// Stores a freshly set-up transformation in the first free slot.
    ///
    /// On failure the transformer and state are handed back so the caller can
    /// run cleanup.
    pub(crate) fn store(
        &mut self,
        transformer: Arc<RegisteredTransformer>,
        state: Box<dyn Any + Send>,
    ) -> Result<usize, (Arc<RegisteredTransformer>, Box<dyn Any + Send>)> {
        match self.slots.iter_mut().position(|slot| slot.is_none()) {
            Some(index) => {
                self.slots[index] = Some(ActiveTransform { transformer, state });
                debug!(index, "stored I/O transformation");
                Ok(index)
            }
            None => {
                error!("failed to store transformation: no free slot");
                Err((transformer, state))
            }
        }
    }

    /// Tears down every active transformation.
    ///
    /// Each occupied slot's cleanup hook runs exactly once and the owning
    /// module's use count is released. Calling this on an empty stack is a
    /// no-op, so running it again after connection close is safe.
    pub fn teardown_all(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(active) = slot.take() {
                debug!(index, name = active.transformer.name(), "removing I/O transformation");
                active.transformer.run_cleanup(active.state);
                active.transformer.module().release();
            }
        }
    }
}

impl fmt::Debug for TransformStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStack")
            .field("active", &self.active_names())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::test_support::ScriptedTransformer;
    use super::*;

    fn entry(name: &str, kind: TransformKind) -> Arc<RegisteredTransformer> {
        Arc::new(RegisteredTransformer::new(
            name.to_owned(),
            kind,
            DirectionMask::BOTH,
            Box::new(ScriptedTransformer::new()),
            ModuleHandle::new(format!("mod_{name}")),
        ))
    }

    fn activate(stack: &mut TransformStack, entry: &Arc<RegisteredTransformer>) {
        let mut endpoints = EndpointPair { read: 3, write: 4 };
        let state = entry
            .run_setup(&mut endpoints, DirectionMask::BOTH, None)
            .unwrap();
        stack.store(Arc::clone(entry), state).unwrap();
        entry.module().acquire();
    }

    #[test]
    fn empty_stack_allows_any_kind() {
        let stack = TransformStack::new();
        assert!(stack.possible(TransformKind::Encryption).is_ok());
        assert!(stack.possible(TransformKind::Compression).is_ok());
        assert!(stack.possible(TransformKind::SessionLogging).is_ok());
        assert_eq!(stack.active_count(), 0);
    }

    #[test]
    fn duplicate_kind_is_rejected() {
        let mut stack = TransformStack::new();
        let tls = entry("tls", TransformKind::Encryption);
        activate(&mut stack, &tls);

        assert!(matches!(
            stack.possible(TransformKind::Encryption),
            Err(TransformError::AlreadyActive {
                kind: TransformKind::Encryption
            })
        ));
        // The existing slot is untouched.
        assert!(stack.active(TransformKind::Encryption));
        assert_eq!(stack.active_count(), 1);
    }

    #[test]
    fn encryption_after_compression_conflicts() {
        let mut stack = TransformStack::new();
        let deflate = entry("deflate", TransformKind::Compression);
        activate(&mut stack, &deflate);

        assert!(matches!(
            stack.possible(TransformKind::Encryption),
            Err(TransformError::OrderingConflict)
        ));
    }

    #[test]
    fn compression_after_encryption_is_allowed() {
        let mut stack = TransformStack::new();
        let tls = entry("tls", TransformKind::Encryption);
        activate(&mut stack, &tls);

        assert!(stack.possible(TransformKind::Compression).is_ok());
        let deflate = entry("deflate", TransformKind::Compression);
        activate(&mut stack, &deflate);
        assert_eq!(stack.active_count(), 2);
        assert_eq!(stack.active_names(), vec!["tls", "deflate"]);
    }

    #[test]
    fn store_reports_exhaustion_and_hands_state_back() {
        let mut stack = TransformStack::new();
        let log = entry("log", TransformKind::SessionLogging);
        for _ in 0..MAX_TRANSFORMS {
            stack.store(Arc::clone(&log), Box::new(())).unwrap();
        }
        assert!(!stack.has_free_slot());
        let err = stack.store(Arc::clone(&log), Box::new(()));
        assert!(err.is_err());
    }

    #[test]
    fn teardown_runs_cleanup_exactly_once_per_slot() {
        let mut stack = TransformStack::new();
        let tls = entry("tls", TransformKind::Encryption);
        let log = entry("log", TransformKind::SessionLogging);
        activate(&mut stack, &tls);
        activate(&mut stack, &log);
        assert!(tls.module().in_use());

        stack.teardown_all();
        assert_eq!(stack.active_count(), 0);
        assert!(!tls.module().in_use());
        assert!(!log.module().in_use());

        // Idempotent: a second teardown is a no-op.
        stack.teardown_all();
        assert_eq!(stack.active_count(), 0);
    }

    #[test]
    fn query_distinguishes_missing_from_unqueryable() {
        let mut stack = TransformStack::new();
        let mut none: Option<EndpointPair> = None;

        // Nothing active: NotFound.
        assert!(matches!(
            stack.query(TransformKind::Encryption, 0, &mut none),
            Err(TransformError::NotFound { .. })
        ));

        // Active but no query hook: Unsupported, not an error.
        let log = entry("log", TransformKind::SessionLogging);
        activate(&mut stack, &log);
        assert_eq!(
            stack
                .query(TransformKind::SessionLogging, 0, &mut none)
                .unwrap(),
            QueryOutcome::Unsupported
        );
    }

    #[test]
    fn queryable_transformer_sees_its_own_state() {
        let mut stack = TransformStack::new();
        let mut hooks = ScriptedTransformer::new();
        hooks.queryable = true;
        let tls = Arc::new(RegisteredTransformer::new(
            "tls".to_owned(),
            TransformKind::Encryption,
            DirectionMask::BOTH,
            Box::new(hooks),
            ModuleHandle::new("mod_tls"),
        ));
        let mut endpoints = EndpointPair { read: 7, write: 8 };
        let state = tls
            .run_setup(&mut endpoints, DirectionMask::BOTH, None)
            .unwrap();
        stack.store(Arc::clone(&tls), state).unwrap();

        let mut answer: Option<EndpointPair> = None;
        assert_eq!(
            stack
                .query(TransformKind::Encryption, 1, &mut answer)
                .unwrap(),
            QueryOutcome::Handled
        );
        assert_eq!(answer, Some(EndpointPair { read: 7, write: 8 }));
    }

    #[test]
    fn setup_failure_leaves_endpoints_untouched() {
        let failing = ScriptedTransformer::failing();
        let mut endpoints = EndpointPair { read: 5, write: 6 };
        let res = failing.setup(&mut endpoints, DirectionMask::BOTH, None);
        assert!(res.is_err());
        assert_eq!(endpoints, EndpointPair { read: 5, write: 6 });
        assert_eq!(failing.setups.load(Ordering::SeqCst), 1);
        assert_eq!(failing.cleanups.load(Ordering::SeqCst), 0);
    }
}
