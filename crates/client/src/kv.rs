//! Local persistence (spec.md §4.8): the optimistic mutation stack under a
//! meta namespace, and per-resource rows, so a reload can rehydrate the
//! pool without waiting on a fresh `SYNC`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// A persistence backend for the optimistic store. Keys are opaque strings
/// the store constructs (`meta:mutationStack`, `<resource>:<id>`); values
/// are pre-serialized JSON so the store doesn't need a schema migration
/// story baked into this trait.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// An in-process [`Kv`], for tests and for embeddings with no durable
/// storage requirement.
#[derive(Default)]
pub struct MemoryKv(Mutex<BTreeMap<String, String>>);

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.0.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.0.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.0.lock().unwrap().remove(key);
        Ok(())
    }
}
