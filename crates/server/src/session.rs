//! Per-connection session (spec.md §4.6): SUBSCRIBE/SYNC/MUTATE handling,
//! pre/post-mutation guards, and broadcast to every connection subscribed
//! to a resource.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use errors::ErrorMetadata;
use parking_lot::RwLock;
use query::Ctx;
use storage::Storage;
use tokio::sync::mpsc;
use value::Schema;
use wire::{ClientMessage, MessageId, Procedure, ServerMessage, Timestamp};

use crate::transaction::Transaction;

/// `preMutation`/`postMutation` authorisation hooks (spec.md §4.6). Route
/// guards for ad-hoc queries live in the `query` crate as [`query::RouteGuard`];
/// this trait is the mutation-path analogue, since a mutation's guard acts
/// on a payload/merged object rather than a query step.
pub trait MutationGuard: Send + Sync {
    fn pre_mutation(&self, resource: &str, procedure: &Procedure, payload: &wire::Payload, ctx: &Ctx) -> anyhow::Result<()> {
        let _ = (resource, procedure, payload, ctx);
        Ok(())
    }

    fn post_mutation(&self, resource: &str, merged: &value::MaterializedObject, ctx: &Ctx) -> anyhow::Result<()> {
        let _ = (resource, merged, ctx);
        Ok(())
    }
}

pub struct AllowAllMutations;
impl MutationGuard for AllowAllMutations {}

/// An application-defined mutation/query handler for a `Procedure::Custom`
/// tag (spec.md §4.6): runs with a [`Transaction`] scoped to a single
/// commit-or-rollback unit; returning `Err` is treated as rollback.
#[async_trait::async_trait]
pub trait CustomProcedure: Send + Sync {
    async fn run(&self, tx: &mut Transaction<'_>, resource_id: &str, payload: &wire::Payload, ctx: &Ctx) -> anyhow::Result<wire::Payload>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct SessionHandle {
    subscriptions: RwLock<BTreeSet<String>>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

/// Server-wide registry of live connections, used to fan a broadcast
/// `MUTATE` out to every session subscribed to the affected resource,
/// including the mutation's own origin (spec.md §4.6: "the origin uses the
/// echo to clear its optimistic entry").
#[derive(Default)]
pub struct Hub {
    sessions: RwLock<BTreeMap<SessionId, Arc<SessionHandle>>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, handle: Arc<SessionHandle>) -> SessionId {
        let id = SessionId::next();
        self.sessions.write().insert(id, handle);
        id
    }

    fn unregister(&self, id: SessionId) {
        self.sessions.write().remove(&id);
    }

    fn broadcast(&self, resource: &str, message: &ServerMessage) {
        for handle in self.sessions.read().values() {
            if handle.subscriptions.read().contains(resource) {
                let _ = handle.outbound.send(message.clone());
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

/// One per connection. Owns the set of resources this connection has
/// subscribed to and mediates SUBSCRIBE/SYNC/MUTATE against storage.
pub struct Session {
    id: SessionId,
    hub: Arc<Hub>,
    handle: Arc<SessionHandle>,
    schema: Arc<Schema>,
    storage: Arc<dyn Storage>,
    guard: Arc<dyn MutationGuard>,
    custom_procedures: BTreeMap<String, Arc<dyn CustomProcedure>>,
    metrics: Arc<metrics::CounterRegistry>,
}

impl Session {
    pub fn new(
        hub: Arc<Hub>,
        schema: Arc<Schema>,
        storage: Arc<dyn Storage>,
        guard: Arc<dyn MutationGuard>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle {
            subscriptions: RwLock::new(BTreeSet::new()),
            outbound,
        });
        let id = hub.register(handle.clone());
        (
            Self {
                id,
                hub,
                handle,
                schema,
                storage,
                guard,
                custom_procedures: BTreeMap::new(),
                metrics: Arc::new(metrics::CounterRegistry::new()),
            },
            inbound,
        )
    }

    pub fn metrics(&self) -> &metrics::CounterRegistry {
        &self.metrics
    }

    pub fn register_custom_procedure(&mut self, tag: impl Into<String>, handler: Arc<dyn CustomProcedure>) {
        self.custom_procedures.insert(tag.into(), handler);
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.handle.outbound.send(message);
    }

    /// Dispatch one client message. `ctx` is whatever the embedding
    /// server's context provider derived from the connection's headers.
    pub async fn handle(&mut self, ctx: &Ctx, message: ClientMessage) -> anyhow::Result<()> {
        match message {
            ClientMessage::Subscribe { id, resource } => self.handle_subscribe(id, resource).await,
            ClientMessage::Sync { id, last_synced_at, resources } => self.handle_sync(id, last_synced_at, resources).await,
            ClientMessage::Mutate {
                id,
                resource,
                resource_id,
                procedure,
                payload,
            } => self.handle_mutate(ctx, id, resource, resource_id, procedure, payload).await,
        }
    }

    async fn handle_subscribe(&mut self, id: MessageId, resource: String) -> anyhow::Result<()> {
        self.handle.subscriptions.write().insert(resource.clone());
        let data = self.snapshot(&resource, None).await?;
        self.send(ServerMessage::Sync { id, resource, data });
        Ok(())
    }

    async fn handle_sync(&mut self, id: MessageId, last_synced_at: Option<Timestamp>, resources: Option<Vec<String>>) -> anyhow::Result<()> {
        let targets = resources.unwrap_or_else(|| self.handle.subscriptions.read().iter().cloned().collect());
        for resource in targets {
            let data = self.snapshot(&resource, last_synced_at.as_ref()).await?;
            self.send(ServerMessage::Sync {
                id: id.clone(),
                resource,
                data,
            });
        }
        Ok(())
    }

    async fn snapshot(&self, resource: &str, last_synced_at: Option<&Timestamp>) -> anyhow::Result<BTreeMap<String, wire::Payload>> {
        let spec = storage::ReadSpec::default();
        let rows = self.storage.get(resource, &spec).await?;
        Ok(rows
            .into_iter()
            .filter(|row| match last_synced_at {
                Some(cutoff) => &row.timestamp > cutoff,
                None => true,
            })
            .map(|row| (row.id.clone(), row.to_wire_payload()))
            .collect())
    }

    async fn handle_mutate(
        &mut self,
        ctx: &Ctx,
        id: MessageId,
        resource: String,
        resource_id: String,
        procedure: Procedure,
        payload: wire::Payload,
    ) -> anyhow::Result<()> {
        let metrics = self.metrics.clone();
        let mut timer = metrics::StatusTimer::new(&metrics, "mutation");

        if let Err(err) = self.guard.pre_mutation(&resource, &procedure, &payload, ctx) {
            tracing::info!(%resource, %err, "preMutation guard rejected mutation");
            timer.mark_failure();
            self.send(ServerMessage::Reject { id, resource });
            return Ok(());
        }

        let result = if procedure.is_lww() {
            self.handle_lww_mutate(ctx, id, resource, resource_id, procedure, payload).await
        } else {
            self.handle_custom_mutate(ctx, id, resource, resource_id, procedure, payload).await
        };
        if result.is_err() {
            timer.mark_failure();
        }
        result
    }

    async fn handle_lww_mutate(
        &mut self,
        ctx: &Ctx,
        id: MessageId,
        resource: String,
        resource_id: String,
        procedure: Procedure,
        payload: wire::Payload,
    ) -> anyhow::Result<()> {
        let resource_schema = match self.schema.require_resource(&resource) {
            Ok(schema) => schema,
            Err(_) => {
                self.send(ServerMessage::Reject { id, resource });
                return Ok(());
            }
        };
        let prev = self.storage.get_one(&resource, &resource_id).await?;
        let merged = match value::merge_mutation(resource_schema, &procedure, &payload, prev.as_ref(), &resource_id) {
            Ok(merged) => merged,
            Err(err) => {
                tracing::info!(%resource, %err, "mutation failed LWW merge");
                self.send(ServerMessage::Reject { id, resource });
                return Ok(());
            }
        };

        if let Err(err) = self.guard.post_mutation(&resource, &merged.object, ctx) {
            tracing::info!(%resource, %err, "postMutation guard rejected mutation; rolling back");
            self.send(ServerMessage::Reject { id, resource });
            return Ok(());
        }

        self.storage.put(&resource, merged.object.clone()).await?;

        let broadcast = ServerMessage::Mutate {
            id,
            resource: resource.clone(),
            resource_id,
            procedure,
            payload: merged.object.to_wire_payload(),
        };
        self.hub.broadcast(&resource, &broadcast);
        Ok(())
    }

    async fn handle_custom_mutate(
        &mut self,
        ctx: &Ctx,
        id: MessageId,
        resource: String,
        resource_id: String,
        procedure: Procedure,
        payload: wire::Payload,
    ) -> anyhow::Result<()> {
        let Procedure::Custom(tag) = &procedure else {
            anyhow::bail!(ErrorMetadata::internal("handle_custom_mutate called with an LWW procedure"));
        };
        let Some(handler) = self.custom_procedures.get(tag).cloned() else {
            self.send(ServerMessage::Reject { id, resource });
            return Ok(());
        };

        let mut tx = Transaction::new(self.storage.as_ref());
        match handler.run(&mut tx, &resource_id, &payload, ctx).await {
            Ok(result_payload) => {
                tx.commit().await?;
                let broadcast = ServerMessage::Mutate {
                    id,
                    resource: resource.clone(),
                    resource_id,
                    procedure,
                    payload: result_payload,
                };
                self.hub.broadcast(&resource, &broadcast);
                Ok(())
            }
            Err(err) => {
                tracing::info!(%resource, %err, "custom procedure rolled back");
                tx.rollback();
                self.send(ServerMessage::Reject { id, resource });
                Ok(())
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use storage::{ReadSpec, Row};
    use value::{FieldSchema, ResourceSchema};
    use wire::{FieldMeta, WireFieldValue};

    use super::*;

    struct InMemory(Mutex<Map<(String, String), Row>>);

    #[async_trait]
    impl Storage for InMemory {
        async fn get(&self, resource: &str, _spec: &ReadSpec) -> anyhow::Result<Vec<Row>> {
            Ok(self.0.lock().unwrap().iter().filter(|((r, _), _)| r == resource).map(|(_, row)| row.clone()).collect())
        }

        async fn get_one(&self, resource: &str, id: &str) -> anyhow::Result<Option<Row>> {
            Ok(self.0.lock().unwrap().get(&(resource.to_string(), id.to_string())).cloned())
        }

        async fn put(&self, resource: &str, row: Row) -> anyhow::Result<()> {
            self.0.lock().unwrap().insert((resource.to_string(), row.id.clone()), row);
            Ok(())
        }

        async fn delete(&self, resource: &str, id: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().remove(&(resource.to_string(), id.to_string()));
            Ok(())
        }
    }

    fn schema() -> Arc<Schema> {
        let users = ResourceSchema::new("users").field(FieldSchema::string("name"));
        Arc::new(Schema::builder().resource(users).build().unwrap())
    }

    fn insert_payload(name: &str) -> wire::Payload {
        let mut payload = wire::Payload::new();
        payload.insert(
            "name".to_string(),
            WireFieldValue {
                value: serde_json::json!(name),
                meta: FieldMeta { timestamp: Timestamp::now() },
            },
        );
        payload
    }

    #[tokio::test]
    async fn subscribe_sends_a_bootstrap_sync() {
        let hub = Hub::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemory(Mutex::new(Map::new())));
        let (mut session, mut inbound) = Session::new(hub, schema(), storage, Arc::new(AllowAllMutations));
        session
            .handle(&Ctx::new(), ClientMessage::Subscribe { id: MessageId::new(), resource: "users".to_string() })
            .await
            .unwrap();
        match inbound.recv().await.unwrap() {
            ServerMessage::Sync { resource, data, .. } => {
                assert_eq!(resource, "users");
                assert!(data.is_empty());
            }
            other => panic!("expected Sync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mutate_insert_broadcasts_to_subscribed_sessions_including_origin() {
        let hub = Hub::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemory(Mutex::new(Map::new())));
        let (mut session, mut inbound) = Session::new(hub, schema(), storage, Arc::new(AllowAllMutations));
        session
            .handle(&Ctx::new(), ClientMessage::Subscribe { id: MessageId::new(), resource: "users".to_string() })
            .await
            .unwrap();
        inbound.recv().await.unwrap(); // bootstrap SYNC

        session
            .handle(
                &Ctx::new(),
                ClientMessage::Mutate {
                    id: MessageId::new(),
                    resource: "users".to_string(),
                    resource_id: "u1".to_string(),
                    procedure: Procedure::Insert,
                    payload: insert_payload("Ana"),
                },
            )
            .await
            .unwrap();

        match inbound.recv().await.unwrap() {
            ServerMessage::Mutate { resource_id, .. } => assert_eq!(resource_id, "u1"),
            other => panic!("expected Mutate echo, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mutate_on_unknown_resource_is_rejected() {
        let hub = Hub::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemory(Mutex::new(Map::new())));
        let (mut session, mut inbound) = Session::new(hub, schema(), storage, Arc::new(AllowAllMutations));
        session
            .handle(
                &Ctx::new(),
                ClientMessage::Mutate {
                    id: MessageId::new(),
                    resource: "bogus".to_string(),
                    resource_id: "x1".to_string(),
                    procedure: Procedure::Insert,
                    payload: wire::Payload::new(),
                },
            )
            .await
            .unwrap();
        match inbound.recv().await.unwrap() {
            ServerMessage::Reject { resource, .. } => assert_eq!(resource, "bogus"),
            other => panic!("expected Reject, got {other:?}"),
        }
    }

    struct RejectAll;
    impl MutationGuard for RejectAll {
        fn pre_mutation(&self, _resource: &str, _procedure: &Procedure, _payload: &wire::Payload, _ctx: &Ctx) -> anyhow::Result<()> {
            anyhow::bail!(ErrorMetadata::unauthorized("Denied", "no mutations allowed"))
        }
    }

    #[tokio::test]
    async fn pre_mutation_guard_rejection_sends_reject_and_skips_write() {
        let hub = Hub::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemory(Mutex::new(Map::new())));
        let (mut session, mut inbound) = Session::new(hub, schema(), storage.clone(), Arc::new(RejectAll));
        session
            .handle(
                &Ctx::new(),
                ClientMessage::Mutate {
                    id: MessageId::new(),
                    resource: "users".to_string(),
                    resource_id: "u1".to_string(),
                    procedure: Procedure::Insert,
                    payload: insert_payload("Ana"),
                },
            )
            .await
            .unwrap();
        assert!(matches!(inbound.recv().await.unwrap(), ServerMessage::Reject { .. }));
        assert!(storage.get_one("users", "u1").await.unwrap().is_none());
    }
}
