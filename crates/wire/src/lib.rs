//! Wire protocol: the typed message envelopes exchanged over the duplex
//! sync channel (spec.md §4.2), plus the reconnect backoff algorithm and
//! identifier validation shared by the client and server crates.

pub mod backoff;
pub mod identifier;
pub mod messages;
pub mod timestamp;

pub use backoff::Backoff;
pub use messages::{
    payload_carries_id, ClientMessage, FieldMeta, MessageId, Payload, Procedure, ServerMessage,
    WireFieldValue,
};
pub use timestamp::Timestamp;
