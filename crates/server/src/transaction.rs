//! Custom-procedure transaction handle (spec.md §4.6): application-defined
//! mutations bypass LWW entirely and run against a storage view scoped to
//! a single commit-or-rollback unit.

use std::collections::BTreeMap;

use storage::{ReadSpec, Row, Storage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    RolledBack,
}

/// A transactional view over one resource's storage, handed to a custom
/// procedure handler. Writes buffer in memory until [`Transaction::commit`];
/// if the handler returns an error the framework treats that as
/// [`Transaction::rollback`] and nothing reaches storage.
pub struct Transaction<'s> {
    storage: &'s dyn Storage,
    state: State,
    pending_puts: BTreeMap<(String, String), Row>,
    pending_deletes: BTreeMap<(String, String), ()>,
}

impl<'s> Transaction<'s> {
    pub fn new(storage: &'s dyn Storage) -> Self {
        Self {
            storage,
            state: State::Open,
            pending_puts: BTreeMap::new(),
            pending_deletes: BTreeMap::new(),
        }
    }

    fn require_open(&self) -> anyhow::Result<()> {
        if self.state != State::Open {
            anyhow::bail!(errors::ErrorMetadata::internal("transaction is no longer open"));
        }
        Ok(())
    }

    pub async fn find_one(&self, resource: &str, id: &str) -> anyhow::Result<Option<Row>> {
        self.require_open()?;
        if let Some(pending) = self.pending_puts.get(&(resource.to_string(), id.to_string())) {
            return Ok(Some(pending.clone()));
        }
        if self.pending_deletes.contains_key(&(resource.to_string(), id.to_string())) {
            return Ok(None);
        }
        self.storage.get_one(resource, id).await
    }

    /// Query a resource by filter, overlaying pending writes the same way
    /// [`Transaction::find_one`] does for a single id.
    pub async fn find(&self, resource: &str, spec: &ReadSpec) -> anyhow::Result<Vec<Row>> {
        self.require_open()?;
        let mut rows = self.storage.get(resource, spec).await?;
        rows.retain(|row| !self.pending_deletes.contains_key(&(resource.to_string(), row.id.clone())));
        for ((put_resource, id), row) in &self.pending_puts {
            if put_resource != resource {
                continue;
            }
            match rows.iter_mut().find(|existing| &existing.id == id) {
                Some(existing) => *existing = row.clone(),
                None => rows.push(row.clone()),
            }
        }
        Ok(rows)
    }

    pub fn insert(&mut self, resource: &str, row: Row) -> anyhow::Result<()> {
        self.require_open()?;
        self.pending_deletes.remove(&(resource.to_string(), row.id.clone()));
        self.pending_puts.insert((resource.to_string(), row.id.clone()), row);
        Ok(())
    }

    pub fn update(&mut self, resource: &str, row: Row) -> anyhow::Result<()> {
        self.insert(resource, row)
    }

    pub fn delete(&mut self, resource: &str, id: &str) -> anyhow::Result<()> {
        self.require_open()?;
        self.pending_puts.remove(&(resource.to_string(), id.to_string()));
        self.pending_deletes.insert((resource.to_string(), id.to_string()), ());
        Ok(())
    }

    /// Flush every pending write to storage. Once committed, the handle can
    /// no longer be used.
    pub async fn commit(mut self) -> anyhow::Result<()> {
        self.require_open()?;
        for ((resource, _id), row) in std::mem::take(&mut self.pending_puts) {
            self.storage.put(&resource, row).await?;
        }
        for (resource, id) in std::mem::take(&mut self.pending_deletes).into_keys() {
            self.storage.delete(&resource, &id).await?;
        }
        self.state = State::Committed;
        Ok(())
    }

    /// Discard every pending write. Called automatically if the handler
    /// returns an error instead of calling [`Transaction::commit`].
    pub fn rollback(&mut self) {
        self.pending_puts.clear();
        self.pending_deletes.clear();
        self.state = State::RolledBack;
    }
}

impl<'s> Drop for Transaction<'s> {
    fn drop(&mut self) {
        if self.state == State::Open {
            tracing::warn!("transaction dropped without commit or rollback; treating as rollback");
        }
    }
}
