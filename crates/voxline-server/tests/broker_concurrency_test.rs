//! Concurrency tests for the SubscriptionBroker.
//!
//! These tests verify that the broker handles concurrent
//! subscribe/unsubscribe/disconnect/broadcast without deadlocks, lost
//! deliveries or orphaned topic entries.

use std::sync::Arc;
use tokio::sync::mpsc;
use voxline_server::broker::SubscriptionBroker;
use voxline_types::{PrincipalInfo, ServerEvent};

fn principal(uid: &str) -> PrincipalInfo {
    PrincipalInfo {
        uid: uid.to_string(),
        role: "observer".to_string(),
    }
}

/// A sender whose queue is never drained; acks beyond its capacity are
/// dropped, which is fine for these tests.
fn dummy_sender() -> mpsc::Sender<String> {
    mpsc::channel::<String>(1).0
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribe_unsubscribe_leaves_no_topics() {
    let broker = Arc::new(SubscriptionBroker::new());
    let mut clients = Vec::new();
    for i in 0..10 {
        clients.push(
            broker
                .connect(principal(&format!("user_{}", i)), dummy_sender())
                .await,
        );
    }

    let mut handles = Vec::new();
    for i in 0..200 {
        let broker = broker.clone();
        let client = clients[i % 10];
        let topic = format!("call:{}", i % 5);
        handles.push(tokio::spawn(async move {
            broker.subscribe(client, &topic).await;
            broker.unsubscribe(client, &topic).await;
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    assert_eq!(broker.topic_count().await, 0);
    assert_eq!(broker.client_count().await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_racing_subscribe_leaves_no_orphans() {
    for _ in 0..50 {
        let broker = Arc::new(SubscriptionBroker::new());
        let client = broker.connect(principal("a"), dummy_sender()).await;
        broker.subscribe(client, "call:1").await;

        let b1 = broker.clone();
        let b2 = broker.clone();
        let disconnect = tokio::spawn(async move { b1.disconnect(client).await });
        let subscribe = tokio::spawn(async move {
            b2.subscribe(client, "call:2").await;
            b2.subscribe(client, "call:3").await;
        });
        disconnect.await.expect("disconnect should not panic");
        subscribe.await.expect("subscribe should not panic");

        assert_eq!(broker.client_count().await, 0);
        assert_eq!(broker.topic_count().await, 0, "no topic may outlive its last client");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_during_churn_reaches_stable_subscribers() {
    let broker = Arc::new(SubscriptionBroker::new());

    let mut receivers = Vec::new();
    for i in 0..20 {
        let (tx, rx) = mpsc::channel::<String>(1024);
        let client = broker.connect(principal(&format!("stable_{}", i)), tx).await;
        broker.subscribe(client, "voice_agent:live").await;
        receivers.push(rx);
    }
    // Drain greetings and acks.
    for rx in &mut receivers {
        while rx.try_recv().is_ok() {}
    }

    let churn = {
        let broker = broker.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                let client = broker
                    .connect(principal(&format!("churn_{}", i)), dummy_sender())
                    .await;
                broker.subscribe(client, "voice_agent:live").await;
                broker.disconnect(client).await;
            }
        })
    };

    let publishes = {
        let broker = broker.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                broker
                    .broadcast("voice_agent:live", &ServerEvent::error("tick"))
                    .await;
            }
        })
    };

    churn.await.expect("churn should not panic");
    publishes.await.expect("publishes should not panic");

    for rx in &mut receivers {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 50, "every stable subscriber sees every publish");
    }
    assert_eq!(broker.subscriber_count("voice_agent:live").await, 20);
}

#[tokio::test]
async fn closed_connection_does_not_fail_others() {
    let broker = SubscriptionBroker::new();
    let (closed_tx, closed_rx) = mpsc::channel::<String>(8);
    let (open_tx, mut open_rx) = mpsc::channel::<String>(8);
    let closed = broker.connect(principal("gone"), closed_tx).await;
    let open = broker.connect(principal("here"), open_tx).await;
    broker.subscribe(closed, "call:42").await;
    broker.subscribe(open, "call:42").await;
    drop(closed_rx);
    while open_rx.try_recv().is_ok() {}

    let delivered = broker.broadcast("call:42", &ServerEvent::error("x")).await;
    assert_eq!(delivered, 1);
    assert!(open_rx.try_recv().unwrap().contains("\"error\""));
}
