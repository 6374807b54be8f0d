//! wirestack - Connection I/O Substrate
//!
//! This library provides the shared I/O plumbing that sits between a server's
//! protocol handlers and its sockets: a process-wide catalog of stream
//! transformers (encryption, compression, session logging) contributed by
//! extension modules, per-connection stacks of active transformations with
//! ordering enforcement, a registry of live sessions for introspection and
//! control, and an incremental delimited reader that survives records split
//! arbitrarily across reads.
//!
//! # Concurrency Model
//!
//! Shared registries are guarded by [`std::sync::RwLock`]: registration and
//! unregistration take the write lock, lookups and listings the read lock.
//! Each connection is driven by a single task; per-connection state (the
//! transformation stack, the reader) is mutated only through that task,
//! taking the stack mutex briefly when shared introspection needs a peek.
//! There is a deliberate check-then-act window between asking whether a
//! transformer is available and setting it up; see
//! [`transform::registry`] for how that resolves.
//!
//! # Modules
//!
//! - [`error`]: Error taxonomy for transformation, session, and read
//!   operations
//! - [`module`]: Extension-module handles with active-use counting
//! - [`readline`]: Incremental delimited reading ([`readline::LineReader`])
//! - [`session`]: Live-session registry with monotonic identifiers
//! - [`transform`]: Transformer catalog and per-connection stacks

pub mod error;
pub mod module;
pub mod readline;
pub mod session;
pub mod transform;

pub use error::{ReadError, SessionError, TransformError};
pub use module::ModuleHandle;
pub use readline::{AppendOutcome, ByteSource, FdSource, LineReader};
pub use session::{
    SessionInfo, SessionOwner, SessionRegistry, SessionType, SharedStack,
};
pub use transform::registry::{TransformerInfo, TransformerRegistry};
pub use transform::{
    DirectionMask, EndpointPair, QueryOutcome, RegisteredTransformer, TransformKind,
    TransformStack, Transformer, MAX_TRANSFORMS,
};
