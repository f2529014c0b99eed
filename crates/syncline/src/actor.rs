//! The actor loop (spec.md §5 "single-threaded cooperative" scheduling
//! model): a dedicated task owns a [`SyncClient`] exclusively and processes
//! one inbound server event or one [`SyncRequest`] to completion before the
//! next. Grounded on the teacher's `client::worker::worker`
//! (`crates/convex/src/client/worker.rs`), which drives a `BaseConvexClient`
//! the same way: `tokio::select!` between the protocol's response channel
//! and a request channel, with reconnect-then-resend on failure.

use std::sync::Arc;

use query::RawQueryRequest;
use tokio::sync::{mpsc, oneshot};
use wire::{MessageId, Payload, Procedure};

use crate::client::SyncClient;

/// One request the actor loop serves. Every variant that produces a value
/// carries a `oneshot` reply channel, the same shape as the teacher's
/// `ClientRequest`.
pub enum SyncRequest {
    SubscribeResource {
        resource: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Sync {
        resources: Option<Vec<String>>,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Mutate {
        resource: String,
        resource_id: String,
        procedure: Procedure,
        payload: Payload,
        reply: oneshot::Sender<anyhow::Result<MessageId>>,
    },
    Get {
        query: RawQueryRequest,
        reply: oneshot::Sender<anyhow::Result<Vec<client::ResolvedObject>>>,
    },
    Subscribe {
        query: RawQueryRequest,
        callback: Arc<dyn Fn(&[client::ResolvedObject]) + Send + Sync>,
        reply: oneshot::Sender<anyhow::Result<client::SubscriptionId>>,
    },
    Unsubscribe {
        id: client::SubscriptionId,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

fn actor_gone() -> anyhow::Error {
    anyhow::Error::new(errors::ErrorMetadata::internal("sync client actor task is no longer running"))
}

/// A cheap, cloneable front door to a running [`run`] actor task.
#[derive(Clone)]
pub struct SyncClientHandle {
    requests: mpsc::UnboundedSender<SyncRequest>,
}

impl SyncClientHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SyncRequest) -> anyhow::Result<T> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(build(reply)).map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }

    pub async fn subscribe_resource(&self, resource: impl Into<String>) -> anyhow::Result<()> {
        let resource = resource.into();
        self.call(|reply| SyncRequest::SubscribeResource { resource, reply }).await?
    }

    pub async fn sync(&self, resources: Option<Vec<String>>) -> anyhow::Result<()> {
        self.call(|reply| SyncRequest::Sync { resources, reply }).await?
    }

    pub async fn mutate(&self, resource: impl Into<String>, resource_id: impl Into<String>, procedure: Procedure, payload: Payload) -> anyhow::Result<MessageId> {
        let resource = resource.into();
        let resource_id = resource_id.into();
        self.call(|reply| SyncRequest::Mutate { resource, resource_id, procedure, payload, reply }).await?
    }

    pub async fn get(&self, query: RawQueryRequest) -> anyhow::Result<Vec<client::ResolvedObject>> {
        self.call(|reply| SyncRequest::Get { query, reply }).await?
    }

    pub async fn subscribe(&self, query: RawQueryRequest, callback: Arc<dyn Fn(&[client::ResolvedObject]) + Send + Sync>) -> anyhow::Result<client::SubscriptionId> {
        self.call(|reply| SyncRequest::Subscribe { query, callback, reply }).await?
    }

    pub fn unsubscribe(&self, id: client::SubscriptionId) -> anyhow::Result<()> {
        self.requests.send(SyncRequest::Unsubscribe { id }).map_err(|_| actor_gone())
    }

    pub async fn disconnect(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(SyncRequest::Disconnect { reply }).map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }
}

/// Spawn `client` behind a dedicated task and return a handle to it.
/// Requires a running Tokio runtime.
pub fn spawn(client: SyncClient) -> SyncClientHandle {
    let (requests, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(client, rx));
    SyncClientHandle { requests }
}

/// The actor body. Selects between the connection's next inbound event and
/// the next queued request; on an unexpected transport close it reconnects
/// with backoff and, once back up, replays every held subscription (spec.md
/// §4.3). A sticky `disconnect()` or an exhausted reconnect budget falls
/// back to serving only local requests (`get`/`subscribe` still work
/// against the last known pool state) until the handle is dropped.
pub async fn run(mut client: SyncClient, mut requests: mpsc::UnboundedReceiver<SyncRequest>) {
    loop {
        tokio::select! {
            outcome = client.pump_once() => {
                match outcome {
                    connect::PumpOutcome::Message(message) => {
                        if let Err(err) = client.apply_server_message(message).await {
                            tracing::warn!(%err, "failed to apply inbound server message");
                        }
                    }
                    connect::PumpOutcome::Closed => {
                        if client.is_sticky_disconnected() {
                            serve_requests_only(&mut client, &mut requests).await;
                            break;
                        }
                        match client.reconnect_with_backoff().await {
                            connect::ReconnectOutcome::Reconnected => {
                                if let Err(err) = client.resubscribe_after_reconnect().await {
                                    tracing::warn!(%err, "resubscribe after reconnect failed");
                                }
                            }
                            connect::ReconnectOutcome::StickyStop => {}
                            connect::ReconnectOutcome::LimitExceeded => {
                                tracing::error!("reconnect budget exhausted, serving local requests only");
                                serve_requests_only(&mut client, &mut requests).await;
                                break;
                            }
                        }
                    }
                }
            }
            request = requests.recv() => {
                match request {
                    Some(request) => handle_request(&mut client, request).await,
                    None => break,
                }
            }
        }
    }
}

/// The connection is dead and won't be retried; keep draining requests so
/// `get`/`subscribe` callers don't hang, without busy-looping on
/// `pump_once` (which would return `Closed` immediately, forever).
async fn serve_requests_only(client: &mut SyncClient, requests: &mut mpsc::UnboundedReceiver<SyncRequest>) {
    while let Some(request) = requests.recv().await {
        handle_request(client, request).await;
    }
}

async fn handle_request(client: &mut SyncClient, request: SyncRequest) {
    match request {
        SyncRequest::SubscribeResource { resource, reply } => {
            let _ = reply.send(client.subscribe_resource(resource).await);
        }
        SyncRequest::Sync { resources, reply } => {
            let _ = reply.send(client.sync(resources).await);
        }
        SyncRequest::Mutate { resource, resource_id, procedure, payload, reply } => {
            let _ = reply.send(client.mutate(&resource, resource_id, procedure, payload).await);
        }
        SyncRequest::Get { query, reply } => {
            let _ = reply.send(client.get(&query));
        }
        SyncRequest::Subscribe { query, callback, reply } => {
            let _ = reply.send(client.subscribe(query, callback));
        }
        SyncRequest::Unsubscribe { id } => {
            client.store_mut().unsubscribe(id);
        }
        SyncRequest::Disconnect { reply } => {
            client.disconnect().await;
            let _ = reply.send(());
        }
    }
}
