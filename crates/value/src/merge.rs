use std::collections::{BTreeMap, BTreeSet};

use errors::ErrorMetadata;
use wire::{Payload, Procedure, Timestamp};

use crate::field::FieldKind;
use crate::object::{FieldValue, MaterializedObject};
use crate::resource::ResourceSchema;

/// A reference field whose target changed as a result of a merge — the
/// caller (the client pool / server session) must relink the object graph
/// accordingly (spec.md §4.1, §4.8 step 4).
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceChange {
    pub field: String,
    pub old_target: Option<String>,
    pub new_target: Option<String>,
}

/// The result of [`merge_mutation`]: the merged object, the subset of
/// fields actually written (`delta`), and any reference fields whose
/// target changed.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeResult {
    pub object: MaterializedObject,
    pub delta: BTreeSet<String>,
    pub reference_changes: Vec<ReferenceChange>,
}

/// Merge one incoming mutation into an optional previous materialised
/// object, per the per-field LWW rule in spec.md §4.1.
pub fn merge_mutation(
    resource: &ResourceSchema,
    procedure: &Procedure,
    payload: &Payload,
    prev: Option<&MaterializedObject>,
    resource_id: &str,
) -> anyhow::Result<MergeResult> {
    if wire::payload_carries_id(payload) {
        anyhow::bail!(ErrorMetadata::validation(
            "PayloadCarriesId",
            "Mutation payload must not carry an `id` field; use `resourceId`."
        ));
    }
    for field_name in payload.keys() {
        if !resource.fields.contains_key(field_name) {
            anyhow::bail!(ErrorMetadata::validation(
                "UnknownField",
                format!(
                    "Resource {:?} has no field named {field_name:?}.",
                    resource.name
                )
            ));
        }
    }
    for (field_name, entry) in payload.iter() {
        let field = &resource.fields[field_name];
        let is_null = entry.value.is_null();
        if is_null && !field.nullable {
            anyhow::bail!(ErrorMetadata::validation(
                "NonNullableFieldIsNull",
                format!("Field {field_name:?} is not nullable but payload value is null.")
            ));
        }
        if !is_null && !field.kind.accepts(&entry.value) {
            anyhow::bail!(ErrorMetadata::validation(
                "FieldTypeMismatch",
                format!("Field {field_name:?} does not accept the given value.")
            ));
        }
    }

    let result = match procedure {
        Procedure::Insert => merge_insert(resource, payload)?,
        Procedure::Update => merge_update(resource, payload, prev),
        Procedure::Custom(tag) => anyhow::bail!(ErrorMetadata::internal(format!(
            "merge_mutation called with custom procedure {tag:?}; custom procedures bypass LWW."
        ))),
    };

    let reference_changes = reference_changes(resource, &result.object, &result.delta, prev);

    Ok(MergeResult {
        object: MaterializedObject {
            id: resource_id.to_string(),
            ..result.object
        },
        delta: result.delta,
        reference_changes,
    })
}

fn merge_insert(resource: &ResourceSchema, payload: &Payload) -> anyhow::Result<MergeResult> {
    let creation_ts = payload
        .values()
        .map(|f| f.meta.timestamp.clone())
        .max()
        .unwrap_or_else(Timestamp::now);

    let mut fields = BTreeMap::new();
    let mut delta = BTreeSet::new();
    for (name, field) in resource.fields.iter() {
        if let Some(entry) = payload.get(name) {
            fields.insert(
                name.clone(),
                FieldValue {
                    value: entry.value.clone(),
                    timestamp: entry.meta.timestamp.clone(),
                },
            );
        } else if let Some(default) = &field.default {
            fields.insert(
                name.clone(),
                FieldValue {
                    value: default.clone(),
                    timestamp: creation_ts.clone(),
                },
            );
        } else if field.nullable {
            fields.insert(
                name.clone(),
                FieldValue {
                    value: serde_json::Value::Null,
                    timestamp: creation_ts.clone(),
                },
            );
        } else {
            anyhow::bail!(ErrorMetadata::validation(
                "MissingRequiredField",
                format!(
                    "Field {name:?} on resource {:?} has no payload entry, no default, and is not nullable.",
                    resource.name
                )
            ));
        }
        delta.insert(name.clone());
    }

    let mut object = MaterializedObject {
        id: String::new(),
        fields,
        timestamp: creation_ts,
    };
    object.recompute_object_timestamp();
    Ok(MergeResult {
        object,
        delta,
        reference_changes: Vec::new(),
    })
}

fn merge_update(resource: &ResourceSchema, payload: &Payload, prev: Option<&MaterializedObject>) -> MergeResult {
    let mut fields = prev.map(|o| o.fields.clone()).unwrap_or_default();
    let mut delta = BTreeSet::new();

    for (name, entry) in payload.iter() {
        let prev_ts = fields.get(name).map(|f| &f.timestamp);
        let adopt = match prev_ts {
            None => true,
            Some(prev_ts) => *prev_ts < entry.meta.timestamp,
        };
        if adopt {
            fields.insert(
                name.clone(),
                FieldValue {
                    value: entry.value.clone(),
                    timestamp: entry.meta.timestamp.clone(),
                },
            );
            delta.insert(name.clone());
        }
    }

    let fallback_ts = prev
        .map(|o| o.timestamp.clone())
        .or_else(|| payload.values().map(|f| f.meta.timestamp.clone()).max())
        .unwrap_or_else(Timestamp::now);

    let mut object = MaterializedObject {
        id: String::new(),
        fields,
        timestamp: fallback_ts,
    };
    object.recompute_object_timestamp();
    let _ = resource;
    MergeResult {
        object,
        delta,
        reference_changes: Vec::new(),
    }
}

fn reference_changes(
    resource: &ResourceSchema,
    merged: &MaterializedObject,
    delta: &BTreeSet<String>,
    prev: Option<&MaterializedObject>,
) -> Vec<ReferenceChange> {
    delta
        .iter()
        .filter(|name| matches!(resource.field_kind(name), Some(FieldKind::Reference { .. })))
        .map(|name| ReferenceChange {
            field: name.clone(),
            old_target: prev
                .and_then(|o| o.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            new_target: merged.get(name).and_then(|v| v.as_str()).map(str::to_string),
        })
        .collect()
}
