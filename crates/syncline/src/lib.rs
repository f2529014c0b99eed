//! Client top-level (spec.md §4.3, architecture table row "Client
//! top-level"): wires wire-protocol messages onto the optimistic store and
//! re-issues `SUBSCRIBE`/`SYNC` for every held resource after a reconnect.
//!
//! [`SyncClient`] does the wiring; [`run`]/[`spawn`] put it behind a single
//! actor task so the store and connection are only ever touched from one
//! place at a time, the way the teacher's `client::worker::worker`
//! (`crates/convex/src/client/worker.rs`) owns its `BaseConvexClient`.

pub mod actor;
pub mod client;

pub use actor::{run, spawn, SyncClientHandle, SyncRequest};
pub use client::SyncClient;
