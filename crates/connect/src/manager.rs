//! The connection manager (spec.md §4.3): owns the current
//! [`ConnectionState`], dials through an abstract [`Transport`] with
//! lazily-produced credentials folded into the URL's query string, and
//! reconnects with capped, jittered backoff after a transport failure —
//! unless [`disconnect`](ConnectionManager::disconnect) was called, which
//! is sticky: no reconnect is ever scheduled after an intentional close.

use std::sync::Arc;
use std::time::Duration;

use errors::ErrorMetadata;
use tokio::sync::{broadcast, mpsc};
use url::Url;
use wire::{Backoff, ClientMessage, ServerMessage};

use crate::credentials::CredentialProvider;
use crate::transport::{Transport, TransportHandle};

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Typed events fanned out to anyone holding a [`broadcast::Receiver`] from
/// [`ConnectionManager::subscribe_events`] (spec.md §4.3).
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Open,
    Close,
    Error(String),
    Message(ServerMessage),
    ConnectionChange { open: bool },
}

/// Result of one [`ConnectionManager::reconnect_with_backoff`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reconnected,
    /// `disconnect()` was called; no further reconnect attempts will be made.
    StickyStop,
    /// `reconnect_limit` was reached without a successful dial.
    LimitExceeded,
}

/// One [`ConnectionManager::pump_once`] call's outcome.
#[derive(Debug)]
pub enum PumpOutcome {
    Message(ServerMessage),
    /// The transport closed (inbound channel drained); the caller should
    /// call [`ConnectionManager::reconnect_with_backoff`] next, unless a
    /// sticky `disconnect()` is already in effect.
    Closed,
}

#[derive(Clone, Debug)]
pub struct ConnectionManagerConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bounds the number of consecutive failed reconnect attempts before
    /// [`ConnectionManager::reconnect_with_backoff`] gives up and returns
    /// [`ReconnectOutcome::LimitExceeded`]. `None` retries forever.
    pub reconnect_limit: Option<u32>,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            reconnect_limit: None,
        }
    }
}

pub struct ConnectionManager {
    base_url: Url,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
    config: ConnectionManagerConfig,
    backoff: Backoff,
    state: ConnectionState,
    handle: Option<Box<dyn TransportHandle>>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Receiving half handed to the transport fresh on every [`dial`](Self::dial):
    /// no clone of its sender is ever retained here, so the transport's
    /// background read task dropping its own sender (on socket close) is
    /// exactly what makes `recv()` observe `None` in [`pump_once`](Self::pump_once).
    inbound_rx: mpsc::UnboundedReceiver<ServerMessage>,
    /// Sticky: once `disconnect()` runs, no reconnect is ever scheduled
    /// again (spec.md §4.3), even if the caller keeps calling
    /// `reconnect_with_backoff`.
    disconnected: bool,
    metrics: Arc<metrics::CounterRegistry>,
}

impl ConnectionManager {
    pub fn new(base_url: Url, credentials: Arc<dyn CredentialProvider>, transport: Arc<dyn Transport>, config: ConnectionManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        // Closed from the start: nothing should call `pump_once` before a
        // successful `connect()` replaces this with a live channel.
        let (tx, inbound_rx) = mpsc::unbounded_channel();
        drop(tx);
        Self {
            base_url,
            credentials,
            transport,
            backoff: Backoff::new(config.initial_backoff, config.max_backoff),
            config,
            state: ConnectionState::Idle,
            handle: None,
            events,
            inbound_rx,
            disconnected: false,
            metrics: Arc::new(metrics::CounterRegistry::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn metrics(&self) -> &metrics::CounterRegistry {
        &self.metrics
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is not an error: nobody has to be listening.
        let _ = self.events.send(event);
    }

    async fn dial(&mut self) -> anyhow::Result<()> {
        self.state = ConnectionState::Connecting;
        let credentials = self.credentials.credentials().await?;
        let mut url = self.base_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &credentials {
                pairs.append_pair(key, value);
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self
            .transport
            .connect(url, tx)
            .await
            .map_err(|err| err.context(ErrorMetadata::transport("ConnectFailed", "transport failed to open the connection")))?;
        self.inbound_rx = rx;
        self.handle = Some(handle);
        self.state = ConnectionState::Open;
        self.metrics.increment("connection.connect");
        self.emit(ConnectionEvent::Open);
        self.emit(ConnectionEvent::ConnectionChange { open: true });
        Ok(())
    }

    /// The initial connect. Clears any prior sticky `disconnect()`.
    pub async fn connect(&mut self) -> anyhow::Result<()> {
        self.disconnected = false;
        self.dial().await?;
        self.backoff.reset();
        Ok(())
    }

    /// Intentionally tear the connection down. Sticky: after this call,
    /// [`reconnect_with_backoff`](Self::reconnect_with_backoff) always
    /// returns [`ReconnectOutcome::StickyStop`] without dialling, until a
    /// fresh [`connect`](Self::connect) clears the flag.
    pub async fn disconnect(&mut self) {
        self.disconnected = true;
        if let Some(mut handle) = self.handle.take() {
            handle.close().await;
        }
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            self.emit(ConnectionEvent::Close);
            self.emit(ConnectionEvent::ConnectionChange { open: false });
        }
    }

    pub fn is_sticky_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Submit one outbound message on the current connection.
    pub async fn send(&mut self, message: ClientMessage) -> anyhow::Result<()> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| anyhow::Error::msg("no open connection").context(ErrorMetadata::transport("NotConnected", "attempted to send with no open connection")))?;
        handle.send(message).await
    }

    /// Await the next inbound event: either a server message, or the
    /// transport closing (the inbound channel having no more senders).
    /// The caller (`crates/syncline`'s actor loop) selects on this
    /// alongside its own request channel.
    pub async fn pump_once(&mut self) -> PumpOutcome {
        match self.inbound_rx.recv().await {
            Some(message) => {
                self.emit(ConnectionEvent::Message(message.clone()));
                PumpOutcome::Message(message)
            }
            None => {
                self.handle = None;
                if self.state != ConnectionState::Closed {
                    self.state = ConnectionState::Closed;
                    self.emit(ConnectionEvent::Close);
                    self.emit(ConnectionEvent::ConnectionChange { open: false });
                }
                PumpOutcome::Closed
            }
        }
    }

    /// Retry dialling with doubling, jittered, capped backoff
    /// (spec.md §4.3) until a connection opens, `disconnect()` was called
    /// in the meantime, or `reconnect_limit` consecutive attempts have
    /// failed.
    pub async fn reconnect_with_backoff(&mut self) -> ReconnectOutcome {
        loop {
            if self.disconnected {
                return ReconnectOutcome::StickyStop;
            }
            if let Some(limit) = self.config.reconnect_limit {
                if self.backoff.failures() >= limit {
                    tracing::error!(limit, "reconnect limit exceeded, giving up");
                    self.emit(ConnectionEvent::Error("reconnect limit exceeded".to_string()));
                    return ReconnectOutcome::LimitExceeded;
                }
            }
            let delay = self.backoff.fail(&mut rand::rng());
            tracing::info!(?delay, failures = self.backoff.failures(), "reconnecting after backoff");
            self.metrics.increment("connection.reconnect_attempt");
            tokio::time::sleep(delay).await;
            if self.disconnected {
                return ReconnectOutcome::StickyStop;
            }
            match self.dial().await {
                Ok(()) => {
                    self.backoff.reset();
                    self.metrics.increment("connection.reconnect_success");
                    return ReconnectOutcome::Reconnected;
                }
                Err(err) => {
                    tracing::warn!(%err, "reconnect attempt failed");
                    self.emit(ConnectionEvent::Error(err.to_string()));
                    continue;
                }
            }
        }
    }
}
