//! [`SyncClient`]: the non-actor core that applies inbound wire messages to
//! the optimistic store and drives the connection manager. Kept separate
//! from [`crate::actor`] so it can be driven directly in a single-threaded
//! test, or embedded in a host's own event loop instead of the bundled
//! actor.

use std::collections::BTreeSet;
use std::sync::Arc;

use client::{Mutation, OptimisticStore, ResolvedObject, SubscriptionId};
use connect::{ConnectionManager, PumpOutcome, ReconnectOutcome};
use query::RawQueryRequest;
use value::Schema;
use wire::{ClientMessage, MessageId, Payload, Procedure, ServerMessage, Timestamp};

/// Wires the wire protocol to the optimistic store (spec.md §4.3 "Client
/// top-level"): applies inbound `SYNC`/`MUTATE`/`REJECT`, tracks the
/// maximum server timestamp ever observed so a post-reconnect `SYNC` can
/// resume from it, and remembers every resource it has subscribed to so a
/// reconnect can re-issue `SUBSCRIBE` for each one.
pub struct SyncClient {
    schema: Arc<Schema>,
    store: OptimisticStore,
    connection: ConnectionManager,
    subscribed: BTreeSet<String>,
    max_observed_timestamp: Option<Timestamp>,
}

impl SyncClient {
    pub fn new(schema: Arc<Schema>, store: OptimisticStore, connection: ConnectionManager) -> Self {
        Self {
            schema,
            store,
            connection,
            subscribed: BTreeSet::new(),
            max_observed_timestamp: None,
        }
    }

    pub fn store(&self) -> &OptimisticStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut OptimisticStore {
        &mut self.store
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn max_observed_timestamp(&self) -> Option<&Timestamp> {
        self.max_observed_timestamp.as_ref()
    }

    pub fn subscribed_resources(&self) -> impl Iterator<Item = &str> {
        self.subscribed.iter().map(String::as_str)
    }

    pub async fn connect(&mut self) -> anyhow::Result<()> {
        self.connection.connect().await
    }

    /// spec.md §4.2 `SUBSCRIBE`: begin receiving this resource's future
    /// mutations. Tracked locally so a reconnect can re-issue it.
    pub async fn subscribe_resource(&mut self, resource: impl Into<String>) -> anyhow::Result<()> {
        let resource = resource.into();
        self.schema.require_resource(&resource)?;
        self.connection
            .send(ClientMessage::Subscribe {
                id: MessageId::new(),
                resource: resource.clone(),
            })
            .await?;
        self.subscribed.insert(resource);
        Ok(())
    }

    /// spec.md §4.2 `SYNC`: request catch-up since the highest timestamp
    /// this client has ever observed, optionally scoped to `resources`.
    pub async fn sync(&mut self, resources: Option<Vec<String>>) -> anyhow::Result<()> {
        self.connection
            .send(ClientMessage::Sync {
                id: MessageId::new(),
                last_synced_at: self.max_observed_timestamp.clone(),
                resources,
            })
            .await
    }

    /// Submit a local mutation: apply it optimistically to the store, then
    /// forward it to the server (spec.md §2 data flow).
    pub async fn mutate(&mut self, resource: &str, resource_id: impl Into<String>, procedure: Procedure, payload: Payload) -> anyhow::Result<MessageId> {
        let id = MessageId::new();
        let resource_id = resource_id.into();
        let mutation = Mutation::new(id.clone(), resource_id.clone(), procedure.clone(), payload.clone());
        self.store.add_mutation(resource, mutation, true).await?;
        self.connection
            .send(ClientMessage::Mutate {
                id: id.clone(),
                resource: resource.to_string(),
                resource_id,
                procedure,
                payload,
            })
            .await?;
        Ok(id)
    }

    pub fn get(&self, query: &RawQueryRequest) -> anyhow::Result<Vec<ResolvedObject>> {
        self.store.get(query)
    }

    pub fn subscribe(&mut self, query: RawQueryRequest, callback: Arc<dyn Fn(&[ResolvedObject]) + Send + Sync>) -> anyhow::Result<SubscriptionId> {
        self.store.subscribe(query, callback)
    }

    pub fn unsubscribe(&mut self, token: SubscriptionId) {
        self.store.unsubscribe(token)
    }

    fn note_timestamp(&mut self, ts: &Timestamp) {
        let is_newer = match &self.max_observed_timestamp {
            Some(max) => ts > max,
            None => true,
        };
        if is_newer {
            self.max_observed_timestamp = Some(ts.clone());
        }
    }

    /// Apply one inbound server message to the store (spec.md §4.2, §7
    /// rollback rules): a `SYNC` reply loads a consolidated snapshot, a
    /// `MUTATE` echo applies a server-origin write, and a `REJECT` rolls
    /// back the matching not-yet-confirmed local mutation.
    pub async fn apply_server_message(&mut self, message: ServerMessage) -> anyhow::Result<()> {
        match message {
            ServerMessage::Sync { resource, data, .. } => {
                for payload in data.values() {
                    if let Some(ts) = payload_max_timestamp(payload) {
                        self.note_timestamp(&ts);
                    }
                }
                self.store.load_consolidated_state(&resource, data).await
            }
            ServerMessage::Mutate { id, resource, resource_id, procedure, payload } => {
                if let Some(ts) = payload_max_timestamp(&payload) {
                    self.note_timestamp(&ts);
                }
                let mutation = Mutation::new(id, resource_id, procedure, payload);
                self.store.add_mutation(&resource, mutation, false).await
            }
            ServerMessage::Reject { id, resource } => self.store.undo_mutation(&resource, &id).await,
        }
    }

    /// Re-issue `SUBSCRIBE` for every resource this client holds a
    /// subscription to, then a single `SYNC` with `lastSyncedAt` set to the
    /// max timestamp ever observed (spec.md §4.3).
    pub async fn resubscribe_after_reconnect(&mut self) -> anyhow::Result<()> {
        let resources: Vec<String> = self.subscribed.iter().cloned().collect();
        for resource in &resources {
            self.connection
                .send(ClientMessage::Subscribe {
                    id: MessageId::new(),
                    resource: resource.clone(),
                })
                .await?;
        }
        if !resources.is_empty() {
            self.connection
                .send(ClientMessage::Sync {
                    id: MessageId::new(),
                    last_synced_at: self.max_observed_timestamp.clone(),
                    resources: Some(resources),
                })
                .await?;
        }
        Ok(())
    }

    pub async fn pump_once(&mut self) -> PumpOutcome {
        self.connection.pump_once().await
    }

    pub async fn reconnect_with_backoff(&mut self) -> ReconnectOutcome {
        self.connection.reconnect_with_backoff().await
    }

    pub fn is_sticky_disconnected(&self) -> bool {
        self.connection.is_sticky_disconnected()
    }

    pub async fn disconnect(&mut self) {
        self.connection.disconnect().await
    }
}

fn payload_max_timestamp(payload: &Payload) -> Option<Timestamp> {
    payload.values().map(|v| v.meta.timestamp.clone()).max()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use client::MemoryKv;
    use connect::{ConnectionManagerConfig, NoCredentials, Transport, TransportHandle};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use url::Url;
    use value::{FieldSchema, ResourceSchema};
    use wire::{FieldMeta, WireFieldValue};

    use super::*;

    fn schema() -> Arc<Schema> {
        let widgets = ResourceSchema::new("widgets").field(FieldSchema::string("name"));
        Arc::new(Schema::builder().resource(widgets).build().unwrap())
    }

    fn entry(value: serde_json::Value) -> WireFieldValue {
        WireFieldValue {
            value,
            meta: FieldMeta { timestamp: Timestamp::now() },
        }
    }

    struct RecordingHandle(Arc<Mutex<Vec<ClientMessage>>>);

    #[async_trait]
    impl TransportHandle for RecordingHandle {
        async fn send(&mut self, message: ClientMessage) -> anyhow::Result<()> {
            self.0.lock().push(message);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// Fails the first `fail_count` dials, drops the inbound sender
    /// immediately (so the channel looks closed right after connecting,
    /// like a socket that dies right away), then succeeds.
    struct FlakyTransport {
        fail_count: AtomicU32,
        sent: Arc<Mutex<Vec<ClientMessage>>>,
    }

    impl FlakyTransport {
        fn new(fail_count: u32) -> Self {
            Self {
                fail_count: AtomicU32::new(fail_count),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn connect(&self, _url: Url, _inbound: mpsc::UnboundedSender<ServerMessage>) -> anyhow::Result<Box<dyn TransportHandle>> {
            if self.fail_count.load(Ordering::SeqCst) > 0 {
                self.fail_count.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("simulated dial failure");
            }
            Ok(Box::new(RecordingHandle(self.sent.clone())))
        }
    }

    fn sync_client(transport: Arc<dyn Transport>) -> SyncClient {
        let connection = ConnectionManager::new(
            Url::parse("wss://example.test/ws").unwrap(),
            Arc::new(NoCredentials),
            transport,
            ConnectionManagerConfig {
                initial_backoff: std::time::Duration::from_millis(1),
                max_backoff: std::time::Duration::from_millis(2),
                reconnect_limit: None,
            },
        );
        SyncClient::new(schema(), OptimisticStore::new(schema(), Arc::new(MemoryKv::new())), connection)
    }

    #[tokio::test]
    async fn apply_sync_loads_rows_and_tracks_the_max_timestamp() {
        let mut client = sync_client(Arc::new(FlakyTransport::new(0)));
        let mut data = BTreeMap::new();
        let mut payload = Payload::new();
        payload.insert("name".to_string(), entry(serde_json::json!("Acme")));
        let ts = payload["name"].meta.timestamp.clone();
        data.insert("w1".to_string(), payload);

        client
            .apply_server_message(ServerMessage::Sync {
                id: MessageId::new(),
                resource: "widgets".to_string(),
                data,
            })
            .await
            .unwrap();

        let mut query = RawQueryRequest::new("widgets");
        query.where_ = Some(query::Where::eq("id", serde_json::json!("w1")));
        let rows = client.get(&query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(client.max_observed_timestamp(), Some(&ts));
    }

    #[tokio::test]
    async fn apply_reject_rolls_back_the_matching_optimistic_mutation() {
        let mut client = sync_client(Arc::new(FlakyTransport::new(0)));
        client.connect().await.unwrap();
        let mut payload = Payload::new();
        payload.insert("name".to_string(), entry(serde_json::json!("Acme")));
        let id = client.mutate("widgets", "w1", Procedure::Insert, payload).await.unwrap();

        client
            .apply_server_message(ServerMessage::Reject {
                id,
                resource: "widgets".to_string(),
            })
            .await
            .unwrap();

        let mut query = RawQueryRequest::new("widgets");
        query.where_ = Some(query::Where::eq("id", serde_json::json!("w1")));
        assert!(client.get(&query).unwrap().is_empty(), "rejected insert should leave no confirmed row behind");
    }

    #[tokio::test]
    async fn resubscribe_after_reconnect_replays_every_held_subscription() {
        let transport = Arc::new(FlakyTransport::new(0));
        let mut client = sync_client(transport.clone());
        client.connect().await.unwrap();
        client.subscribe_resource("widgets").await.unwrap();
        transport.sent.lock().clear();

        client.resubscribe_after_reconnect().await.unwrap();

        let sent = transport.sent.lock();
        assert!(matches!(&sent[0], ClientMessage::Subscribe { resource, .. } if resource == "widgets"));
        assert!(matches!(&sent[1], ClientMessage::Sync { resources: Some(r), .. } if r == &["widgets".to_string()]));
    }

    #[tokio::test]
    async fn resubscribe_with_no_subscriptions_sends_nothing() {
        let transport = Arc::new(FlakyTransport::new(0));
        let mut client = sync_client(transport.clone());
        client.connect().await.unwrap();
        transport.sent.lock().clear();

        client.resubscribe_after_reconnect().await.unwrap();
        assert!(transport.sent.lock().is_empty());
    }
}
