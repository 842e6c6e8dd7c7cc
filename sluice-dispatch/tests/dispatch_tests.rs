//! End-to-end dispatch behaviour over real queues
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use sluice_dispatch::{
    Broker, ConnectionState, DestroyReason, DispatchAction, DispatchConfig, DispatchError,
    DispatchManager, DispatchPolicy, PriorityRange, RuleSet, StatusRule,
};
use sluice_store::{
    BackendConfig, FileBackingStore, MemoryBackingStore, MemoryConfig, MessageQueue, Priority,
    StoreConfig, TieredStore,
};
use support::{MockTransport, RecordingHandler, destination, entry};

/// `ALIVE`: send. `POLLING`: queue, but destroy priorities 0-3. Anything
/// else: queue.
fn polling_rules() -> RuleSet {
    RuleSet {
        default_status: None,
        default_action: Some(DispatchAction::Queue),
        rules: vec![
            StatusRule::new(ConnectionState::Alive, DispatchAction::Send),
            StatusRule::new(ConnectionState::Polling, DispatchAction::Queue).with_override(
                PriorityRange::new(0, 3).expect("range"),
                DispatchAction::Destroy,
            ),
        ],
    }
}

fn memory_store() -> StoreConfig {
    StoreConfig {
        backend: BackendConfig::Memory(MemoryConfig { capacity: None }),
        ..StoreConfig::default()
    }
}

#[tokio::test]
async fn test_priority_scenario_across_state_changes() {
    let id = destination("scenario");
    let transport = Arc::new(MockTransport::offline());
    let handler = Arc::new(RecordingHandler::default());
    let store = TieredStore::new(id.clone(), Arc::new(MemoryBackingStore::new()), 1 << 20, 1 << 16);
    let manager = DispatchManager::new(
        Arc::new(MessageQueue::new(Arc::new(store))),
        Arc::new(DispatchPolicy::new(polling_rules()).expect("valid rules")),
        transport.clone(),
        handler.clone(),
        &DispatchConfig {
            batch_size: 4,
            idle_wake_ms: None,
        },
    );

    for priority in 0..=9 {
        manager
            .publish(entry(&id, priority, false))
            .await
            .expect("publish");
    }

    // Alive, but nothing gets through
    let pass = manager.dispatch_pass().await.expect("pass");
    assert_eq!(pass.delivered, 0);
    assert_eq!(pass.failed, 1);
    assert_eq!(manager.queue().len().await, 10);
    assert_eq!(handler.errors.lock().len(), 1);

    manager.on_connection_state_change(ConnectionState::Polling);
    let pass = manager.dispatch_pass().await.expect("pass");
    assert_eq!(pass.queued, 6);
    assert_eq!(pass.destroyed, 4);
    assert_eq!(manager.queue().len().await, 6);
    assert_eq!(handler.destroyed_priorities(), vec![0, 1, 2, 3]);
    assert!(
        handler
            .destroyed
            .lock()
            .iter()
            .all(|(_, reason)| *reason == DestroyReason::Policy)
    );

    let (count, _) = manager
        .queue()
        .size_by_priority_range(Priority::new(4).expect("priority"), Priority::MAX)
        .await;
    assert_eq!(count, 6);
    let (count, bytes) = manager
        .queue()
        .size_by_priority_range(Priority::MIN, Priority::new(3).expect("priority"))
        .await;
    assert_eq!((count, bytes), (0, 0));

    transport.set_available(true);
    manager.on_connection_state_change(ConnectionState::Alive);
    let pass = manager.dispatch_pass().await.expect("pass");
    assert_eq!(pass.delivered, 6);
    assert_eq!(transport.delivered_priorities(), vec![9, 8, 7, 6, 5, 4]);
    assert!(manager.queue().is_empty().await);
}

#[tokio::test]
async fn test_same_priority_is_delivered_in_id_order() {
    let id = destination("fifo");
    let transport = Arc::new(MockTransport::offline());
    let store = TieredStore::new(id.clone(), Arc::new(MemoryBackingStore::new()), 1 << 20, 1 << 16);
    let manager = DispatchManager::new(
        Arc::new(MessageQueue::new(Arc::new(store))),
        Arc::new(DispatchPolicy::new(polling_rules()).expect("valid rules")),
        transport.clone(),
        Arc::new(RecordingHandler::default()),
        &DispatchConfig {
            batch_size: 2,
            idle_wake_ms: None,
        },
    );

    let mut published = Vec::new();
    for _ in 0..5 {
        let entry = entry(&id, 5, false);
        published.push(entry.id());
        manager.publish(entry).await.expect("publish");
    }

    // A few failed passes must not reorder anything
    for _ in 0..3 {
        manager.dispatch_pass().await.expect("pass");
    }

    transport.set_available(true);
    manager.dispatch_pass().await.expect("pass");
    assert_eq!(transport.delivered(), published);
}

#[tokio::test]
async fn test_broker_worker_delivers_published_entries() {
    let handler = Arc::new(RecordingHandler::default());
    let broker = Broker::new(
        memory_store(),
        DispatchConfig::default(),
        polling_rules(),
        handler.clone(),
    )
    .expect("broker");

    let id = destination("worker");
    let transport = Arc::new(MockTransport::online());
    broker.open(id.clone(), transport.clone()).await.expect("open");

    for priority in [3, 8, 5] {
        broker
            .publish(entry(&id, priority, false))
            .await
            .expect("publish");
    }

    assert!(
        transport
            .wait_for_deliveries(3, Duration::from_secs(5))
            .await
    );
    let mut delivered = transport.delivered_priorities();
    delivered.sort_unstable();
    assert_eq!(delivered, vec![3, 5, 8]);
    assert!(handler.errors.lock().is_empty());

    broker.shutdown().await;
    assert!(broker.destinations().is_empty());
}

#[tokio::test]
async fn test_broker_routing_errors() {
    let broker = Broker::new(
        memory_store(),
        DispatchConfig::default(),
        polling_rules(),
        Arc::new(RecordingHandler::default()),
    )
    .expect("broker");

    let id = destination("nowhere");
    assert!(matches!(
        broker.publish(entry(&id, 5, false)).await,
        Err(DispatchError::UnknownDestination(_))
    ));
    assert!(matches!(
        broker.on_connection_state_change(&id, ConnectionState::Dead),
        Err(DispatchError::UnknownDestination(_))
    ));
    assert!(matches!(
        broker.shutdown_destination(&id).await,
        Err(DispatchError::UnknownDestination(_))
    ));

    assert!(Broker::new(
        memory_store(),
        DispatchConfig::default(),
        RuleSet::default(),
        Arc::new(RecordingHandler::default()),
    )
    .is_err());
}

#[tokio::test]
async fn test_broker_rejected_reconfigure_keeps_rules() {
    let broker = Broker::new(
        memory_store(),
        DispatchConfig::default(),
        polling_rules(),
        Arc::new(RecordingHandler::default()),
    )
    .expect("broker");

    let invalid = RuleSet {
        rules: vec![StatusRule::new(ConnectionState::Polling, DispatchAction::Queue)],
        ..RuleSet::default()
    };
    assert!(matches!(
        broker.reconfigure(invalid),
        Err(DispatchError::InvalidConfig(_))
    ));
    assert_eq!(*broker.policy().snapshot(), polling_rules());

    broker
        .reconfigure(RuleSet::send_when_alive())
        .expect("valid rules");
    assert_eq!(*broker.policy().snapshot(), RuleSet::send_when_alive());
}

#[tokio::test]
async fn test_persistent_entries_survive_destination_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = StoreConfig {
        backend: BackendConfig::File(
            FileBackingStore::builder()
                .path(dir.path())
                .build()
                .expect("file store"),
        ),
        ..StoreConfig::default()
    };
    let id = destination("restart");

    let persistent_ids = {
        let handler = Arc::new(RecordingHandler::default());
        let broker = Broker::new(
            store.clone(),
            DispatchConfig::default(),
            polling_rules(),
            handler.clone(),
        )
        .expect("broker");

        broker
            .open(id.clone(), Arc::new(MockTransport::offline()))
            .await
            .expect("open");
        broker
            .on_connection_state_change(&id, ConnectionState::Polling)
            .expect("state change");

        let first = entry(&id, 7, true);
        let second = entry(&id, 4, true);
        let ids = vec![first.id(), second.id()];
        broker.publish(first).await.expect("publish");
        broker.publish(second).await.expect("publish");
        let transient = entry(&id, 9, false);
        let transient_id = transient.id();
        broker.publish(transient).await.expect("publish");

        broker.shutdown_destination(&id).await.expect("shutdown");

        // Only the non-persistent entry is gone, and it was reported
        let errors = handler.errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, transient_id);
        assert_eq!(errors[0].1, DispatchError::Lost.to_string());
        ids
    };

    let broker = Broker::new(
        store,
        DispatchConfig::default(),
        polling_rules(),
        Arc::new(RecordingHandler::default()),
    )
    .expect("broker");
    let transport = Arc::new(MockTransport::online());
    broker.open(id.clone(), transport.clone()).await.expect("reopen");

    assert!(
        transport
            .wait_for_deliveries(2, Duration::from_secs(5))
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.delivered(), persistent_ids);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_status_token_selects_rule() {
    let rules = RuleSet {
        default_status: Some("maintenance".to_string()),
        default_action: Some(DispatchAction::Queue),
        rules: vec![
            StatusRule::new(ConnectionState::Alive, DispatchAction::Queue).with_status("maintenance"),
            StatusRule::new(ConnectionState::Alive, DispatchAction::Send),
        ],
    };

    let handler = Arc::new(RecordingHandler::default());
    let broker = Broker::new(memory_store(), DispatchConfig::default(), rules, handler)
        .expect("broker");
    let id = destination("token");
    let transport = Arc::new(MockTransport::online());
    let manager = broker.open(id.clone(), transport.clone()).await.expect("open");

    broker
        .publish(entry(&id, 5, false))
        .await
        .expect("publish");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(transport.delivered().is_empty());
    assert_eq!(manager.queue().len().await, 1);

    broker.set_status_token("*");
    assert!(
        transport
            .wait_for_deliveries(1, Duration::from_secs(5))
            .await
    );

    broker.shutdown().await;
}
