//! Slot locking and announcement tests
//!
//! Run with: cargo test --test slot_lock

use registrar::{Error, Instance, InstanceId, MemoryStore, Registrar, RegistrarConfig};
use std::sync::Arc;
use std::time::Duration;

fn registrar() -> (Arc<MemoryStore>, Registrar) {
    let store = Arc::new(MemoryStore::new());
    let registrar = Registrar::new(RegistrarConfig::default(), store.clone());
    (store, registrar)
}

#[tokio::test]
async fn test_lock_twice_is_rejected() {
    let (_store, registrar) = registrar();
    let claims = registrar.claims();

    claims.lock_instance("prod", "web", 2).await.unwrap();
    match claims.lock_instance("prod", "web", 2).await {
        Err(Error::SlotOccupied { slot }) => assert_eq!(slot, "2.web.prod"),
        other => panic!("expected SlotOccupied, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_locks_have_one_winner() {
    let (_store, registrar) = registrar();
    let claims = Arc::new(registrar.claims());

    let mut handles = vec![];
    for _ in 0..16 {
        let claims = claims.clone();
        handles.push(tokio::spawn(async move {
            claims.lock_instance("prod", "db", 0).await
        }));
    }

    let mut won = 0;
    let mut occupied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => won += 1,
            Err(Error::SlotOccupied { .. }) => occupied += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(occupied, 15);
}

#[tokio::test]
async fn test_locked_slot_becomes_visible_once_announced() {
    let (_store, registrar) = registrar();
    let claims = registrar.claims();
    let running = registrar.start();
    let mut registry = running.registry();

    claims.lock_instance("prod", "web", 0).await.unwrap();
    claims
        .update_instance(
            &Instance::new(InstanceId::new("prod", "web", 1))
                .with_addrs(["10.0.0.2".parse().unwrap()]),
        )
        .await
        .unwrap();

    // Events arrive in store order, so the placeholder was seen first
    let snapshot = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = registry.changed().await.unwrap();
            if snapshot.contains("1.web.prod") {
                return snapshot;
            }
        }
    })
    .await
    .unwrap();
    assert!(!snapshot.contains("0.web.prod"));

    let announced = Instance::new(InstanceId::new("prod", "web", 0))
        .with_addrs(["10.0.0.1".parse().unwrap()])
        .with_port("80", "8080");
    claims.update_instance(&announced).await.unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = registry.changed().await.unwrap();
            if snapshot.contains("0.web.prod") {
                return snapshot;
            }
        }
    })
    .await
    .unwrap();
    let instance = snapshot.get("0.web.prod").unwrap();
    assert!(instance.same_state(&announced));
    assert_eq!(instance.port_mappings.get("80").map(String::as_str), Some("8080"));

    // The live entry holds the slot
    assert!(claims.lock_instance("prod", "web", 0).await.is_err());

    running.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unrefreshed_instance_frees_its_slot() {
    let (store, registrar) = registrar();
    let claims = registrar.claims();
    let instance = Instance::new(InstanceId::new("prod", "web", 3))
        .with_addrs(["10.0.0.3".parse().unwrap()]);

    claims.lock_instance("prod", "web", 3).await.unwrap();
    claims.update_instance(&instance).await.unwrap();

    // Refreshing keeps it alive past a single update TTL
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(15)).await;
        claims.update_instance(&instance).await.unwrap();
    }
    assert!(store.get("instances/prod/web/3").is_some());

    tokio::time::advance(Duration::from_secs(21)).await;
    assert!(store.get("instances/prod/web/3").is_none());
    claims.lock_instance("prod", "web", 3).await.unwrap();
}
