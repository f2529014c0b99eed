//! The client-side optimistic store (spec.md §4.8): in-memory pool, mutation
//! stack, object graph integration, local persistence, and the live query
//! DSL built on top of it.

pub mod dsl;
pub mod kv;
pub mod mutation;
pub mod resolve;
pub mod store;

pub use dsl::{QueryBuilder, QueryResult};
pub use kv::{Kv, MemoryKv};
pub use mutation::Mutation;
pub use resolve::{IncludeResult, PoolRowSource, ResolvedObject};
pub use store::{OptimisticStore, SubscriptionId};
