//! Connection manager (spec.md §4.3): state machine, typed event fan-out,
//! and backoff-bounded auto-reconnect over an abstract duplex [`Transport`].
//!
//! The concrete WebSocket/HTTP framework glue that would actually dial a
//! socket is out of scope (spec.md §1) — only the `Transport`/
//! `CredentialProvider` seams a host implements, and the reconnect state
//! machine built on top of them, live here. `crates/syncline` drives a
//! `ConnectionManager` from its single actor loop and re-issues
//! `SUBSCRIBE`/`SYNC` after every reconnect.

pub mod credentials;
pub mod manager;
pub mod transport;

pub use credentials::{CredentialProvider, NoCredentials};
pub use manager::{ConnectionEvent, ConnectionManager, ConnectionManagerConfig, ConnectionState, PumpOutcome, ReconnectOutcome};
pub use transport::{Transport, TransportHandle};
