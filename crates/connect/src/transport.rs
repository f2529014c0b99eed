//! The transport-agnostic seam for dialling the duplex channel described in
//! spec.md §4.2/§6. The concrete WebSocket implementation is out of scope
//! (spec.md §1); only this interface, and what [`crate::manager::ConnectionManager`]
//! does with it, is specified here.
//!
//! Grounded on the teacher's `SyncProtocol` trait
//! (`crates/convex/src/sync/mod.rs`): `connect` dials and wires inbound
//! messages onto a channel the caller owns the receiving half of; the
//! returned handle is used to push outbound messages and to tear the
//! channel down.

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;
use wire::ServerMessage;

/// An open duplex channel to the server.
#[async_trait]
pub trait TransportHandle: Send {
    async fn send(&mut self, message: wire::ClientMessage) -> anyhow::Result<()>;

    /// Tear the channel down. Called on an intentional [`disconnect`](crate::manager::ConnectionManager::disconnect);
    /// implementations should make this idempotent.
    async fn close(&mut self);
}

/// Dials `url` (already carrying the credential query string) and returns
/// an open handle. Inbound server messages are pushed onto `inbound` for
/// as long as the channel stays open; the sender side being dropped (or
/// the receiver observing `None`) is how [`ConnectionManager`](crate::manager::ConnectionManager)
/// detects an unexpected disconnect and triggers reconnect.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: Url, inbound: mpsc::UnboundedSender<ServerMessage>) -> anyhow::Result<Box<dyn TransportHandle>>;
}
