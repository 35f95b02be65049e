//! Unit tests for channel registration

use super::*;
use crate::target::{Member, TargetMap};
use tether_proto::Address;
use tether_transport::MemoryTransport;

fn descriptor(channel: &str) -> Descriptor {
    Descriptor::builder(channel).value("count").build().unwrap()
}

fn target() -> Arc<dyn Target> {
    Arc::new(TargetMap::new().member("count", || Member::value(1)))
}

#[tokio::test]
async fn test_register_and_unregister() {
    let registry = Registry::new();
    let (host, _client) = MemoryTransport::pair();
    let host = Arc::new(host);

    let registration = registry.register(target(), &descriptor("calc"), host.clone()).unwrap();
    assert_eq!(registration.channel(), "calc");
    assert!(registration.is_active());
    assert!(registry.is_registered("calc"));
    assert_eq!(registry.channels(), vec!["calc".to_string()]);
    assert_eq!(registry.subscription_count("calc"), Some(0));

    registration.unregister().unwrap();
    assert!(!registration.is_active());
    assert!(!registry.is_registered("calc"));
    assert!(!host.has_listener(&Address::channel("calc")));
}

#[tokio::test]
async fn test_second_unregister_fails() {
    let registry = Registry::new();
    let (host, _client) = MemoryTransport::pair();

    let registration = registry.register(target(), &descriptor("calc"), Arc::new(host)).unwrap();
    registration.unregister().unwrap();

    let err = registration.unregister().unwrap_err();
    assert!(matches!(err, BridgeError::NotRegistered { ref channel } if channel == "calc"));
    assert_eq!(err.to_string(), "Channel [calc] is not registered");
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let registry = Registry::new();
    let (host, _client) = MemoryTransport::pair();
    let host = Arc::new(host);

    let first = registry.register(target(), &descriptor("calc"), host.clone()).unwrap();
    let err = registry
        .register(target(), &descriptor("calc"), host.clone())
        .unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateRegistration { ref channel } if channel == "calc"));

    // a different channel on the same transport is fine
    let other = registry.register(target(), &descriptor("other"), host.clone()).unwrap();
    assert_eq!(registry.channels(), vec!["calc".to_string(), "other".to_string()]);

    first.unregister().unwrap();
    other.unregister().unwrap();
}

#[tokio::test]
async fn test_stale_handle_cannot_remove_new_registration() {
    let registry = Registry::new();
    let (host, _client) = MemoryTransport::pair();
    let host = Arc::new(host);

    let stale = registry.register(target(), &descriptor("calc"), host.clone()).unwrap();
    stale.unregister().unwrap();

    let fresh = registry.register(target(), &descriptor("calc"), host.clone()).unwrap();
    assert!(matches!(stale.unregister(), Err(BridgeError::NotRegistered { .. })));
    assert!(fresh.is_active());

    fresh.unregister().unwrap();
}

#[tokio::test]
async fn test_unregister_by_channel() {
    let registry = Registry::new();
    let (host, _client) = MemoryTransport::pair();

    registry.register(target(), &descriptor("calc"), Arc::new(host)).unwrap();
    registry.unregister("calc").unwrap();
    assert!(matches!(
        registry.unregister("calc"),
        Err(BridgeError::NotRegistered { .. })
    ));
    assert_eq!(registry.subscription_count("calc"), None);
}

#[tokio::test]
async fn test_registries_are_independent() {
    let first = Registry::new();
    let second = Registry::new();
    let (host_a, _client_a) = MemoryTransport::pair();
    let (host_b, _client_b) = MemoryTransport::pair();

    let a = first.register(target(), &descriptor("calc"), Arc::new(host_a)).unwrap();
    let b = second.register(target(), &descriptor("calc"), Arc::new(host_b)).unwrap();

    assert!(first.is_registered("calc"));
    assert!(second.is_registered("calc"));

    a.unregister().unwrap();
    b.unregister().unwrap();
}
