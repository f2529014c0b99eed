use std::collections::BTreeMap;

use serde_json::Value as Json;
use wire::{FieldMeta, Payload, Timestamp, WireFieldValue};

/// A per-field record: value plus the LWW timestamp it was written with.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldValue {
    pub value: Json,
    pub timestamp: Timestamp,
}

/// The canonical in-memory form of one row (spec.md §3): a per-field record
/// whose outer timestamp is the max of its field timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterializedObject {
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: Timestamp,
}

impl MaterializedObject {
    pub fn get(&self, field: &str) -> Option<&Json> {
        self.fields.get(field).map(|f| &f.value)
    }

    pub fn field_timestamp(&self, field: &str) -> Option<&Timestamp> {
        self.fields.get(field).map(|f| &f.timestamp)
    }

    /// Recompute `timestamp` as the max across all field timestamps.
    /// Called once after every merge so the object timestamp invariant
    /// (spec.md §3) always holds.
    pub fn recompute_object_timestamp(&mut self) {
        if let Some(max) = self.fields.values().map(|f| &f.timestamp).max().cloned() {
            self.timestamp = max;
        }
    }

    pub fn to_wire_payload(&self) -> Payload {
        self.fields
            .iter()
            .map(|(name, field)| {
                (
                    name.clone(),
                    WireFieldValue {
                        value: field.value.clone(),
                        meta: FieldMeta {
                            timestamp: field.timestamp.clone(),
                        },
                    },
                )
            })
            .collect()
    }
}
