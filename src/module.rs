//! Extension-module handles with active-use counting.
//!
//! Every registered transformer belongs to a loadable extension module. While
//! a transformation is active on some connection, the owning module's use
//! count is held at one per active slot so the module loader can refuse to
//! unload it mid-use. The loader itself is an external collaborator; this
//! type only carries the identity and the count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Shared handle to an extension module.
///
/// Cheap to clone; clones refer to the same module and the same use count.
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    inner: Arc<ModuleInner>,
}

#[derive(Debug)]
struct ModuleInner {
    name: String,
    active: AtomicUsize,
}

impl ModuleHandle {
    /// Creates a handle for the named module with a zero use count.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                name: name.into(),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// The module's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of active transformations currently using this module.
    ///
    /// A loader must refuse to unload the module while this is nonzero.
    #[must_use]
    pub fn active_uses(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Returns `true` if any transformation is currently using this module.
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.active_uses() > 0
    }

    /// Returns `true` if both handles refer to the same module.
    #[must_use]
    pub fn same_module(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn acquire(&self) {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        // Never underflow; an unmatched release is a bug upstream, not a
        // reason to corrupt the count.
        let res = self
            .inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if res.is_err() {
            warn!(module = %self.inner.name, "unmatched module release ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_count_tracks_acquire_release() {
        let module = ModuleHandle::new("mod_tls");
        assert_eq!(module.name(), "mod_tls");
        assert!(!module.in_use());

        module.acquire();
        module.acquire();
        assert_eq!(module.active_uses(), 2);
        assert!(module.in_use());

        module.release();
        assert_eq!(module.active_uses(), 1);
        module.release();
        assert!(!module.in_use());
    }

    #[test]
    fn release_at_zero_does_not_underflow() {
        let module = ModuleHandle::new("mod_log");
        module.release();
        assert_eq!(module.active_uses(), 0);
    }

    #[test]
    fn clones_share_the_count() {
        let module = ModuleHandle::new("mod_zlib");
        let clone = module.clone();
        assert!(module.same_module(&clone));
        clone.acquire();
        assert_eq!(module.active_uses(), 1);
    }
}
