//! End-to-end lifecycle across the transformer catalog, a connection's
//! transformation stack, and the session registry: modules register
//! transformers, a connection negotiates upgrades, administrative tooling
//! inspects and mutates the session, and teardown releases every module.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use wirestack::error::HookError;
use wirestack::{
    DirectionMask, EndpointPair, ModuleHandle, SessionError, SessionOwner, SessionRegistry,
    SessionType, SharedStack, TransformError, TransformKind, TransformStack, Transformer,
    TransformerRegistry,
};

/// A transformer that splices fixed substitute descriptors into the
/// connection, the way a real transform swaps in its service pipe.
struct PipeSplice {
    substitute: (i32, i32),
    cleanups: Arc<AtomicUsize>,
}

impl PipeSplice {
    fn new(substitute: (i32, i32)) -> (Self, Arc<AtomicUsize>) {
        let cleanups = Arc::new(AtomicUsize::new(0));
        (
            Self {
                substitute,
                cleanups: Arc::clone(&cleanups),
            },
            cleanups,
        )
    }
}

impl Transformer for PipeSplice {
    fn setup(
        &self,
        endpoints: &mut EndpointPair,
        _direction: DirectionMask,
        _arg: Option<&dyn Any>,
    ) -> Result<Box<dyn Any + Send>, HookError> {
        let original = *endpoints;
        endpoints.read = self.substitute.0;
        endpoints.write = self.substitute.1;
        Ok(Box::new(original))
    }

    fn cleanup(&self, _state: Box<dyn Any + Send>) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// A transformer whose negotiation always fails.
struct RefusedHandshake;

impl Transformer for RefusedHandshake {
    fn setup(
        &self,
        _endpoints: &mut EndpointPair,
        _direction: DirectionMask,
        _arg: Option<&dyn Any>,
    ) -> Result<Box<dyn Any + Send>, HookError> {
        Err("peer refused handshake".into())
    }

    fn cleanup(&self, _state: Box<dyn Any + Send>) {}
}

struct Connection {
    endpoints: Mutex<EndpointPair>,
}

impl Connection {
    fn new(read: i32, write: i32) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(EndpointPair { read, write }),
        })
    }
}

impl SessionOwner for Connection {
    fn endpoints(&self) -> &Mutex<EndpointPair> {
        &self.endpoints
    }
}

fn shared_stack() -> SharedStack {
    Arc::new(Mutex::new(TransformStack::new()))
}

#[test]
fn connection_upgrade_lifecycle() {
    let registry = TransformerRegistry::new();
    let mod_tls = ModuleHandle::new("mod_tls");
    let mod_zlib = ModuleHandle::new("mod_zlib");

    let (tls, tls_cleanups) = PipeSplice::new((20, 21));
    registry
        .register(
            "TLS",
            TransformKind::Encryption,
            DirectionMask::BOTH,
            Box::new(tls),
            mod_tls.clone(),
        )
        .unwrap();
    let (deflate, deflate_cleanups) = PipeSplice::new((22, 23));
    registry
        .register(
            "deflate",
            TransformKind::Compression,
            DirectionMask::BOTH,
            Box::new(deflate),
            mod_zlib.clone(),
        )
        .unwrap();

    // Name matching is case-insensitive.
    assert!(registry.available_name("tls"));
    assert!(registry.available_kind(TransformKind::Encryption));
    assert!(!registry.available_kind(TransformKind::SessionLogging));

    // The connection negotiates TLS, then compression, on its own thread.
    let connection = Connection::new(3, 4);
    let stack = shared_stack();
    {
        let mut endpoints = connection.endpoints.lock().unwrap();
        let mut stack = stack.lock().unwrap();
        registry
            .setup(
                &mut stack,
                TransformKind::Encryption,
                DirectionMask::BOTH,
                &mut endpoints,
                None,
            )
            .unwrap();
        assert_eq!(*endpoints, EndpointPair { read: 20, write: 21 });

        registry
            .setup(
                &mut stack,
                TransformKind::Compression,
                DirectionMask::BOTH,
                &mut endpoints,
                None,
            )
            .unwrap();
        assert_eq!(*endpoints, EndpointPair { read: 22, write: 23 });

        // Too late for encryption once compression is active.
        assert!(matches!(
            registry.setup(
                &mut stack,
                TransformKind::Encryption,
                DirectionMask::BOTH,
                &mut endpoints,
                None,
            ),
            Err(TransformError::OrderingConflict)
        ));
    }

    // Both modules are pinned while their transformations are active.
    assert!(mod_tls.in_use());
    assert!(mod_zlib.in_use());

    // Administrative view through the session registry.
    let sessions = SessionRegistry::new();
    let id = sessions
        .register(&stack, SessionType::Node, connection.clone())
        .unwrap();
    let info = sessions.lookup(id).unwrap();
    assert_eq!(info.active_transforms, 2);
    assert_eq!(sessions.describe(id).unwrap(), vec!["TLS", "deflate"]);

    // Connection close: teardown once, then unregister.
    stack.lock().unwrap().teardown_all();
    assert_eq!(tls_cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(deflate_cleanups.load(Ordering::SeqCst), 1);
    assert!(!mod_tls.in_use());
    assert!(!mod_zlib.in_use());

    sessions.unregister(&stack).unwrap();
    assert!(sessions.lookup(id).is_none());
    assert!(matches!(
        sessions.unregister(&stack),
        Err(SessionError::NotRegistered { .. })
    ));
}

#[test]
fn failed_handshake_leaves_no_trace() {
    let registry = TransformerRegistry::new();
    let mod_tls = ModuleHandle::new("mod_tls");
    registry
        .register(
            "tls",
            TransformKind::Encryption,
            DirectionMask::BOTH,
            Box::new(RefusedHandshake),
            mod_tls.clone(),
        )
        .unwrap();

    let mut stack = TransformStack::new();
    let mut endpoints = EndpointPair { read: 3, write: 4 };
    let err = registry
        .setup(
            &mut stack,
            TransformKind::Encryption,
            DirectionMask::BOTH,
            &mut endpoints,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, TransformError::SetupFailed { .. }));

    assert_eq!(stack.active_count(), 0);
    assert_eq!(endpoints, EndpointPair { read: 3, write: 4 });
    assert!(!mod_tls.in_use());

    // The connection can retry or continue in plaintext afterwards.
    assert!(stack.possible(TransformKind::Encryption).is_ok());
}

#[test]
fn direction_coverage_gates_availability() {
    let registry = TransformerRegistry::new();
    let (rx_only, _) = PipeSplice::new((40, 41));
    registry
        .register(
            "tee-log",
            TransformKind::SessionLogging,
            DirectionMask::RX,
            Box::new(rx_only),
            ModuleHandle::new("mod_log"),
        )
        .unwrap();

    let mut stack = TransformStack::new();
    let mut endpoints = EndpointPair { read: 3, write: 4 };
    assert!(matches!(
        registry.setup(
            &mut stack,
            TransformKind::SessionLogging,
            DirectionMask::BOTH,
            &mut endpoints,
            None,
        ),
        Err(TransformError::Unavailable { .. })
    ));

    registry
        .setup(
            &mut stack,
            TransformKind::SessionLogging,
            DirectionMask::RX,
            &mut endpoints,
            None,
        )
        .unwrap();
    assert!(stack.active(TransformKind::SessionLogging));
}

#[test]
fn unregister_frees_the_name_for_reuse() {
    let registry = TransformerRegistry::new();
    let (first, _) = PipeSplice::new((50, 51));
    registry
        .register(
            "deflate",
            TransformKind::Compression,
            DirectionMask::BOTH,
            Box::new(first),
            ModuleHandle::new("mod_zlib"),
        )
        .unwrap();

    let (dup, _) = PipeSplice::new((52, 53));
    assert!(matches!(
        registry.register(
            "DEFLATE",
            TransformKind::Compression,
            DirectionMask::BOTH,
            Box::new(dup),
            ModuleHandle::new("mod_zlib2"),
        ),
        Err(TransformError::DuplicateName { .. })
    ));

    registry.unregister("Deflate").unwrap();
    assert!(!registry.available_name("deflate"));

    let (again, _) = PipeSplice::new((54, 55));
    registry
        .register(
            "deflate",
            TransformKind::Compression,
            DirectionMask::BOTH,
            Box::new(again),
            ModuleHandle::new("mod_zlib"),
        )
        .unwrap();
    assert_eq!(registry.names(), vec!["deflate"]);
}
