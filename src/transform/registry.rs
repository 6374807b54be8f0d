//! Process-scoped catalog of available transformers.
//!
//! The registry maps case-insensitively unique names to registered
//! transformers. It is an explicit component constructed at startup and
//! shared by reference (typically `Arc`) with every connection handler;
//! registration and unregistration are module-lifecycle events, lookups and
//! the composite [`setup`](TransformerRegistry::setup) are steady-state.
//!
//! # Locking
//!
//! A single reader/writer lock: mutation takes the exclusive form, lookups
//! and setup take the shared form. A transformer setup hook may block (for
//! example on a TLS handshake) while the shared lock is held; handshakes are
//! rare, bounded events, so this is accepted.
//!
//! # The accepted pre-check race
//!
//! Callers commonly pre-check with [`available_kind`] before negotiating an
//! upgrade with their peer and only then call [`setup`]. If the transformer
//! is unregistered in between, setup reports [`TransformError::Unavailable`]
//! rather than panicking or corrupting anything. This check-then-act race is
//! intentional: closing it would require holding the registry lock across
//! the caller's own protocol exchange, which can block arbitrarily. Keep the
//! pre-check best-effort.
//!
//! [`available_kind`]: TransformerRegistry::available_kind
//! [`setup`]: TransformerRegistry::setup

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, error, warn};

use super::{
    DirectionMask, EndpointPair, RegisteredTransformer, TransformKind, TransformStack, Transformer,
    MAX_TRANSFORMS,
};
use crate::error::TransformError;
use crate::module::ModuleHandle;

/// Read-only snapshot of one registry entry, for administrative listings.
#[derive(Debug, Clone, Serialize)]
pub struct TransformerInfo {
    /// Display name (unique case-insensitively).
    pub name: String,
    /// Transformation kind provided.
    pub kind: TransformKind,
    /// Directions supported.
    pub directions: DirectionMask,
    /// Name of the owning extension module.
    pub module: String,
}

/// Process-wide transformer catalog.
///
/// One instance per process; see the module docs for the locking discipline.
#[derive(Debug, Default)]
pub struct TransformerRegistry {
    /// Entries keyed by lowercased name. The display name keeps its original
    /// case in the entry itself.
    entries: RwLock<HashMap<String, Arc<RegisteredTransformer>>>,
}

impl TransformerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transformer under a unique name.
    ///
    /// # Errors
    ///
    /// [`TransformError::DuplicateName`] if a transformer with the same name
    /// (compared case-insensitively) is already registered.
    pub fn register(
        &self,
        name: &str,
        kind: TransformKind,
        directions: DirectionMask,
        hooks: Box<dyn Transformer>,
        module: ModuleHandle,
    ) -> Result<(), TransformError> {
        let key = name.to_ascii_lowercase();
        let mut entries = self.entries.write().expect("lock poisoned");
        if entries.contains_key(&key) {
            error!(name, "I/O transformer already registered");
            return Err(TransformError::DuplicateName {
                name: name.to_owned(),
            });
        }
        entries.insert(
            key,
            Arc::new(RegisteredTransformer::new(
                name.to_owned(),
                kind,
                directions,
                hooks,
                module,
            )),
        );
        Ok(())
    }

    /// Removes a transformer by name.
    ///
    /// Transformations already active on some connection keep their entry
    /// (and its module handle) alive until their own teardown; only future
    /// setups are affected.
    ///
    /// # Errors
    ///
    /// [`TransformError::NotFound`] if no such transformer is registered.
    pub fn unregister(&self, name: &str) -> Result<(), TransformError> {
        let key = name.to_ascii_lowercase();
        let mut entries = self.entries.write().expect("lock poisoned");
        if entries.remove(&key).is_none() {
            return Err(TransformError::NotFound {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    /// Removes every transformer owned by `module`, returning how many were
    /// removed.
    ///
    /// Module-unload path: a loader calls this once
    /// [`ModuleHandle::active_uses`] has reached zero, instead of tracking
    /// the module's registration names itself.
    pub fn unregister_module(&self, module: &ModuleHandle) -> usize {
        let mut entries = self.entries.write().expect("lock poisoned");
        let before = entries.len();
        entries.retain(|_, t| !t.module().same_module(module));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(module = module.name(), removed, "unregistered module transformers");
        }
        removed
    }

    /// Returns `true` if a transformer with this name is registered.
    #[must_use]
    pub fn available_name(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        let found = self
            .entries
            .read()
            .expect("lock poisoned")
            .contains_key(&key);
        if !found {
            debug!(name, "no such transformer");
        }
        found
    }

    /// Returns `true` if any transformer of this kind is registered.
    #[must_use]
    pub fn available_kind(&self, kind: TransformKind) -> bool {
        let found = self
            .entries
            .read()
            .expect("lock poisoned")
            .values()
            .any(|t| t.kind() == kind);
        if !found {
            debug!(%kind, "no transformer of this kind");
        }
        found
    }

    /// Resolves a transformer name to its kind.
    ///
    /// Used by the administrative attach path, which is addressed by name.
    ///
    /// # Errors
    ///
    /// [`TransformError::NotFound`] if no such transformer is registered.
    pub fn kind_for_name(&self, name: &str) -> Result<TransformKind, TransformError> {
        let key = name.to_ascii_lowercase();
        self.entries
            .read()
            .expect("lock poisoned")
            .get(&key)
            .map(|t| t.kind())
            .ok_or_else(|| TransformError::NotFound {
                name: name.to_owned(),
            })
    }

    /// Display names of all registered transformers, sorted.
    ///
    /// Read-only listing for administrative tooling.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .expect("lock poisoned")
            .values()
            .map(|t| t.name().to_owned())
            .collect();
        names.sort();
        names
    }

    /// Snapshots every registered transformer, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<TransformerInfo> {
        let mut infos: Vec<TransformerInfo> = self
            .entries
            .read()
            .expect("lock poisoned")
            .values()
            .map(|t| TransformerInfo {
                name: t.name().to_owned(),
                kind: t.kind(),
                directions: t.directions(),
                module: t.module().name().to_owned(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Sets up a transformation of `kind` on a connection's stack.
    ///
    /// The composite operation used by connections: confirm the request is
    /// possible (duplicate-kind and ordering rules), confirm a slot is free,
    /// find a registered transformer of `kind` whose direction mask covers
    /// `direction`, run its setup hook against the connection's endpoint
    /// pair, and store the resulting private state. On success the owning
    /// module's use count is held until teardown.
    ///
    /// # Errors
    ///
    /// - [`TransformError::AlreadyActive`] / [`TransformError::OrderingConflict`]
    ///   from the possibility check; the stack is not mutated.
    /// - [`TransformError::Exhausted`] if no slot is free; not mutated.
    /// - [`TransformError::Unavailable`] if no matching transformer is
    ///   registered (possibly lost the accepted pre-check race).
    /// - [`TransformError::SetupFailed`] if the hook itself declined.
    /// - [`TransformError::StorageRaced`] if storage failed after a
    ///   successful hook; the hook's cleanup has already run and the module
    ///   use count was never taken.
    pub fn setup(
        &self,
        stack: &mut TransformStack,
        kind: TransformKind,
        direction: DirectionMask,
        endpoints: &mut EndpointPair,
        arg: Option<&dyn Any>,
    ) -> Result<(), TransformError> {
        self.try_setup(stack, kind, direction, endpoints, arg)
            .inspect_err(|err| {
                // Precondition failures never touched the stack or the
                // endpoints; everything else ran a hook.
                if err.is_precondition() {
                    warn!(%kind, %direction, %err, "declining transformation setup");
                } else {
                    error!(%kind, %direction, %err, "transformation setup failed");
                }
            })
    }

    fn try_setup(
        &self,
        stack: &mut TransformStack,
        kind: TransformKind,
        direction: DirectionMask,
        endpoints: &mut EndpointPair,
        arg: Option<&dyn Any>,
    ) -> Result<(), TransformError> {
        stack.possible(kind)?;

        let entries = self.entries.read().expect("lock poisoned");
        if !stack.has_free_slot() {
            return Err(TransformError::Exhausted {
                capacity: MAX_TRANSFORMS,
            });
        }
        let Some(transformer) = entries
            .values()
            .find(|t| t.kind() == kind && t.directions().covers(direction))
        else {
            // The caller should have pre-checked availability; losing that
            // race is possible but infrequent.
            return Err(TransformError::Unavailable { kind, direction });
        };

        let state = transformer
            .run_setup(endpoints, direction, arg)
            .map_err(|source| TransformError::SetupFailed { source })?;

        match stack.store(Arc::clone(transformer), state) {
            Ok(_) => {
                transformer.module().acquire();
                Ok(())
            }
            Err((transformer, state)) => {
                // Cannot happen while the stack is exclusively borrowed, but
                // the transformation never became active, so the hook state
                // must still be released. The module use count was never
                // taken.
                transformer.run_cleanup(state);
                Err(TransformError::StorageRaced)
            }
        }
    }
}
