//! Process-wide registry of active I/O sessions.
//!
//! A session ties an opaque identifier to one connection's transformation
//! stack and its owning connection object, so administrative tooling can
//! enumerate live connections, inspect which transformations are active on
//! one of them, and attach a transformation to it at runtime.
//!
//! The registry has limited visibility into a session: the data does not
//! flow through it, so it cannot speak to bytes sent or received (a transform
//! module can, via its query hook). What it can do is list, describe, and
//! mutate the transformation state.
//!
//! # Locking
//!
//! Reader/writer lock discipline: `list`/`lookup`/`describe` take the shared
//! form, `register`/`unregister` the exclusive form. The administrative
//! [`add_transformation`](SessionRegistry::add_transformation) path takes the
//! exclusive form for its whole duration, which serializes it against the
//! owning connection's teardown path.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use crate::error::SessionError;
use crate::transform::registry::TransformerRegistry;
use crate::transform::{DirectionMask, EndpointPair, TransformStack};

/// A connection's transformation stack as shared with the session registry.
///
/// Per-connection state is single-writer by construction; the mutex exists
/// so the administrative path can serialize against that single writer.
/// Steady-state locking is uncontended.
pub type SharedStack = Arc<Mutex<TransformStack>>;

/// What kind of connection a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionType {
    /// An inbound user connection.
    Node,
    /// An outbound client connection made by the server itself.
    OutboundClient,
}

impl SessionType {
    /// Display name used in listings.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Node => "Node",
            Self::OutboundClient => "TCP client",
        }
    }
}

/// Contract a connection object fulfills to own a session.
///
/// Each session type keeps its endpoint pair somewhere different on its
/// owner; this trait is how the registry reaches them without knowing the
/// owner's shape. The pair must be the same locations the connection's own
/// protocol logic uses, so a transformation attached here redirects the live
/// session.
pub trait SessionOwner: Send + Sync {
    /// The owner's mutable endpoint-handle locations.
    fn endpoints(&self) -> &Mutex<EndpointPair>;
}

struct Session {
    id: u64,
    session_type: SessionType,
    owner: Arc<dyn SessionOwner>,
    stack: SharedStack,
    started: Instant,
}

/// Read-only snapshot of one session, for administrative listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Process-lifetime unique identifier.
    pub id: u64,
    /// Session type.
    pub session_type: SessionType,
    /// Whole seconds elapsed since the session started.
    pub elapsed_secs: u64,
    /// Number of active transformations.
    pub active_transforms: usize,
    /// Opaque identity of the owning connection object, stable for the
    /// session's lifetime. Correlates a listing row with a connection; not a
    /// dereferenceable value.
    pub owner_addr: usize,
    /// Opaque identity of the session's transformation stack.
    pub stack_addr: usize,
}

#[derive(Default)]
struct Sessions {
    list: Vec<Session>,
    last_id: u64,
}

impl Sessions {
    fn find(&self, id: u64) -> Option<&Session> {
        self.list.iter().find(|s| s.id == id)
    }
}

/// Process-wide list of active I/O sessions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Sessions>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session for a connection's transformation stack.
    ///
    /// Identifiers are allocated from a monotonically increasing counter and
    /// never reused within a process run. A connection registers exactly one
    /// session for the lifetime of its stack and must unregister it before
    /// the stack is dropped.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyRegistered`] if a session already references
    /// this exact stack.
    pub fn register(
        &self,
        stack: &SharedStack,
        session_type: SessionType,
        owner: Arc<dyn SessionOwner>,
    ) -> Result<u64, SessionError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        if let Some(existing) = inner.list.iter().find(|s| Arc::ptr_eq(&s.stack, stack)) {
            warn!(id = existing.id, "session is already registered");
            return Err(SessionError::AlreadyRegistered { id: existing.id });
        }
        inner.last_id += 1;
        let id = inner.last_id;
        inner.list.push(Session {
            id,
            session_type,
            owner,
            stack: Arc::clone(stack),
            started: Instant::now(),
        });
        Ok(id)
    }

    /// Unregisters the session referencing this stack.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotRegistered`] if no session references this stack.
    pub fn unregister(&self, stack: &SharedStack) -> Result<(), SessionError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        match inner.list.iter().position(|s| Arc::ptr_eq(&s.stack, stack)) {
            Some(index) => {
                inner.list.remove(index);
                Ok(())
            }
            None => {
                let total = inner.list.len();
                warn!(total, "transformation stack has no active session");
                Err(SessionError::NotRegistered { total })
            }
        }
    }

    /// Looks up one session by identifier.
    #[must_use]
    pub fn lookup(&self, id: u64) -> Option<SessionInfo> {
        let inner = self.inner.read().expect("lock poisoned");
        inner.find(id).map(Self::snapshot)
    }

    /// Snapshots all active sessions, in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read().expect("lock poisoned");
        inner.list.iter().map(Self::snapshot).collect()
    }

    /// Names of the transformations active on one session.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoSuchSession`] if the identifier is unknown.
    pub fn describe(&self, id: u64) -> Result<Vec<String>, SessionError> {
        let inner = self.inner.read().expect("lock poisoned");
        let session = inner.find(id).ok_or(SessionError::NoSuchSession { id })?;
        let stack = session.stack.lock().expect("lock poisoned");
        Ok(stack.active_names())
    }

    /// Attaches a named transformation to an established session.
    ///
    /// Administrative escape hatch intended for passive transforms (session
    /// logging). Attaching encryption or compression outside the protocol's
    /// own upgrade point (such as STARTTLS) will likely corrupt the session;
    /// that is documented rather than prevented, because the ordering and
    /// duplicate rules still apply and anything else is the operator's
    /// responsibility.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoSuchSession`] for an unknown identifier, or a
    /// wrapped [`TransformError`](crate::error::TransformError) from name
    /// resolution or setup.
    pub fn add_transformation(
        &self,
        registry: &TransformerRegistry,
        id: u64,
        name: &str,
    ) -> Result<(), SessionError> {
        let kind = registry.kind_for_name(name)?;

        // Exclusive, so the owning connection cannot tear the stack down
        // while the transformation is spliced in.
        let inner = self.inner.write().expect("lock poisoned");
        let session = inner.find(id).ok_or(SessionError::NoSuchSession { id })?;
        let mut endpoints = session.owner.endpoints().lock().expect("lock poisoned");
        let mut stack = session.stack.lock().expect("lock poisoned");
        registry.setup(&mut stack, kind, DirectionMask::BOTH, &mut endpoints, None)?;
        Ok(())
    }

    fn snapshot(session: &Session) -> SessionInfo {
        SessionInfo {
            id: session.id,
            session_type: session.session_type,
            elapsed_secs: session.started.elapsed().as_secs(),
            active_transforms: session.stack.lock().expect("lock poisoned").active_count(),
            owner_addr: Arc::as_ptr(&session.owner).cast::<()>() as usize,
            stack_addr: Arc::as_ptr(&session.stack) as usize,
        }
    }
}
