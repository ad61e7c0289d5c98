//! Topic fan-out for observer connections.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use voxline_pipeline::EventSink;
use voxline_types::{ConnectionEstablished, PrincipalInfo, RoomAck, ServerEvent};

type Members = Arc<Mutex<HashSet<Uuid>>>;

struct ClientEntry {
    principal: PrincipalInfo,
    sender: mpsc::Sender<String>,
    /// Topics this client is subscribed to.
    topics: Mutex<HashSet<String>>,
}

/// Routes server events to the observer connections subscribed to a topic.
///
/// Each topic's member set has its own lock; the outer maps are only
/// write-locked to add or remove a client or a topic, so publishes on
/// unrelated topics never wait on each other.
///
/// Lock ordering: clients → topics → member set.
#[derive(Clone, Default)]
pub struct SubscriptionBroker {
    clients: Arc<RwLock<HashMap<Uuid, Arc<ClientEntry>>>>,
    topics: Arc<RwLock<HashMap<String, Members>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("broker lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl SubscriptionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and greets it with `connection_established`.
    ///
    /// Returns the id the connection is known by from now on.
    pub async fn connect(&self, principal: PrincipalInfo, sender: mpsc::Sender<String>) -> Uuid {
        let client_id = Uuid::new_v4();
        let greeting = ServerEvent::ConnectionEstablished(ConnectionEstablished {
            client_id: client_id.to_string(),
            user: principal.clone(),
        });
        self.clients.write().await.insert(
            client_id,
            Arc::new(ClientEntry {
                principal,
                sender,
                topics: Mutex::new(HashSet::new()),
            }),
        );
        self.send(client_id, &greeting).await;
        client_id
    }

    /// Adds the connection to `topic` and acknowledges it, whether or not it
    /// was already a member. Returns false for an unknown connection.
    pub async fn subscribe(&self, client_id: Uuid, topic: &str) -> bool {
        {
            let clients = self.clients.read().await;
            let Some(client) = clients.get(&client_id) else {
                return false;
            };
            self.join_topic(client_id, topic).await;
            lock(&client.topics).insert(topic.to_string());
            tracing::debug!(
                client_id = %client_id,
                uid = %client.principal.uid,
                topic,
                "subscribed"
            );
        }
        self.send(
            client_id,
            &ServerEvent::SubscriptionConfirmed(RoomAck {
                room: topic.to_string(),
            }),
        )
        .await
    }

    /// Removes the connection from `topic` and acknowledges it, whether or
    /// not it was a member. Returns false for an unknown connection.
    pub async fn unsubscribe(&self, client_id: Uuid, topic: &str) -> bool {
        {
            let clients = self.clients.read().await;
            let Some(client) = clients.get(&client_id) else {
                return false;
            };
            lock(&client.topics).remove(topic);
            self.leave_topic(client_id, topic).await;
        }
        self.send(
            client_id,
            &ServerEvent::UnsubscriptionConfirmed(RoomAck {
                room: topic.to_string(),
            }),
        )
        .await
    }

    /// Forgets the connection and drops it from every topic it held.
    /// Calling it again, or for an unknown id, does nothing.
    pub async fn disconnect(&self, client_id: Uuid) {
        let Some(client) = self.clients.write().await.remove(&client_id) else {
            return;
        };
        let topics: Vec<String> = lock(&client.topics).drain().collect();
        for topic in &topics {
            self.leave_topic(client_id, topic).await;
        }
        tracing::debug!(client_id = %client_id, topics = topics.len(), "observer disconnected");
    }

    /// Delivers `event` to every subscriber of `topic`.
    ///
    /// Delivery is best effort: a subscriber whose queue is full or closed
    /// is skipped with a warning. Returns how many subscribers accepted it.
    pub async fn broadcast(&self, topic: &str, event: &ServerEvent) -> usize {
        let members: Vec<Uuid> = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(members) => lock(members).iter().copied().collect(),
                None => return 0,
            }
        };
        if members.is_empty() {
            return 0;
        }

        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(topic, kind = event.kind(), "failed to serialize event: {}", e);
                return 0;
            }
        };

        let clients = self.clients.read().await;
        let mut delivered = 0;
        for client_id in members {
            let Some(client) = clients.get(&client_id) else {
                continue;
            };
            match client.sender.try_send(json.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    client_id = %client_id,
                    topic,
                    kind = event.kind(),
                    "dropping event for observer: {}",
                    e
                ),
            }
        }
        delivered
    }

    /// Sends `event` to one connection only. Returns false if it was not
    /// delivered.
    pub async fn send(&self, client_id: Uuid, event: &ServerEvent) -> bool {
        let sender = match self.clients.read().await.get(&client_id) {
            Some(client) => client.sender.clone(),
            None => return false,
        };
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(kind = event.kind(), "failed to serialize event: {}", e);
                return false;
            }
        };
        if let Err(e) = sender.try_send(json) {
            tracing::warn!(
                client_id = %client_id,
                kind = event.kind(),
                "dropping direct event for observer: {}",
                e
            );
            return false;
        }
        true
    }

    /// Drops every connection and subscription.
    pub async fn clear(&self) {
        let mut clients = self.clients.write().await;
        let count = clients.len();
        clients.clear();
        self.topics.write().await.clear();
        if count > 0 {
            tracing::info!(count, "dropped observer connections");
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |members| lock(members).len())
    }

    /// Topics the connection currently holds, sorted.
    pub async fn topics_of(&self, client_id: Uuid) -> Vec<String> {
        let clients = self.clients.read().await;
        let mut topics: Vec<String> = clients
            .get(&client_id)
            .map(|client| lock(&client.topics).iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    async fn join_topic(&self, client_id: Uuid, topic: &str) {
        {
            // Inserting under the read guard keeps a concurrent prune from
            // removing the set between lookup and insert.
            let topics = self.topics.read().await;
            if let Some(members) = topics.get(topic) {
                lock(members).insert(client_id);
                return;
            }
        }
        let mut topics = self.topics.write().await;
        lock(topics.entry(topic.to_string()).or_default()).insert(client_id);
    }

    async fn leave_topic(&self, client_id: Uuid, topic: &str) {
        let now_empty = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(members) => {
                    let mut members = lock(members);
                    members.remove(&client_id);
                    members.is_empty()
                }
                None => false,
            }
        };
        if now_empty {
            let mut topics = self.topics.write().await;
            if topics
                .get(topic)
                .is_some_and(|members| lock(members).is_empty())
            {
                topics.remove(topic);
            }
        }
    }
}

#[async_trait]
impl EventSink for SubscriptionBroker {
    async fn publish(&self, topic: &str, event: ServerEvent) {
        let delivered = self.broadcast(topic, &event).await;
        tracing::trace!(topic, kind = event.kind(), delivered, "published");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(uid: &str) -> PrincipalInfo {
        PrincipalInfo {
            uid: uid.to_string(),
            role: "observer".to_string(),
        }
    }

    fn kinds(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(json) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            kinds.push(value["type"].as_str().unwrap().to_string());
        }
        kinds
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_always_acknowledged() {
        let broker = SubscriptionBroker::new();
        let (tx, mut rx) = mpsc::channel(16);
        let id = broker.connect(principal("u1"), tx).await;

        assert!(broker.subscribe(id, "call:42").await);
        assert!(broker.subscribe(id, "call:42").await);
        assert_eq!(broker.subscriber_count("call:42").await, 1);

        assert!(broker.unsubscribe(id, "call:42").await);
        assert!(broker.unsubscribe(id, "call:42").await);
        assert_eq!(broker.topic_count().await, 0);

        assert_eq!(
            kinds(&mut rx),
            vec![
                "connection_established",
                "subscription_confirmed",
                "subscription_confirmed",
                "unsubscription_confirmed",
                "unsubscription_confirmed",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_client_is_rejected() {
        let broker = SubscriptionBroker::new();
        assert!(!broker.subscribe(Uuid::new_v4(), "call:1").await);
        assert_eq!(broker.topic_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_removes_all_memberships() {
        let broker = SubscriptionBroker::new();
        let (tx, _rx) = mpsc::channel(16);
        let id = broker.connect(principal("u1"), tx).await;
        broker.subscribe(id, "call:1").await;
        broker.subscribe(id, "interview:2").await;
        assert_eq!(broker.topics_of(id).await, vec!["call:1", "interview:2"]);

        broker.disconnect(id).await;
        broker.disconnect(id).await;
        assert_eq!(broker.client_count().await, 0);
        assert_eq!(broker.topic_count().await, 0);
    }

    #[tokio::test]
    async fn full_queue_does_not_block_other_subscribers() {
        let broker = SubscriptionBroker::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(16);
        // The greeting fills the slow client's queue.
        let slow = broker.connect(principal("slow"), slow_tx).await;
        let fast = broker.connect(principal("fast"), fast_tx).await;
        broker.subscribe(slow, "voice_agent:s1").await;
        broker.subscribe(fast, "voice_agent:s1").await;
        kinds(&mut fast_rx);

        let delivered = broker
            .broadcast("voice_agent:s1", &ServerEvent::error("x"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(kinds(&mut fast_rx), vec!["error"]);
    }
}
