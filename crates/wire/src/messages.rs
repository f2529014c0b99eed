use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timestamp::Timestamp;

/// Client-generated identifier correlating requests with rejections/echoes.
///
/// The base spec names `nanoid` as the id generator; this port uses
/// `uuid::Uuid::new_v4` instead, since that is the random-id primitive
/// already present in the teacher's dependency stack (see DESIGN.md).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// `INSERT`, `UPDATE`, or an application-defined custom procedure tag.
///
/// Custom procedures share the `MUTATE` envelope but bypass LWW merge
/// entirely (spec.md §4.6): the payload is opaque to the core.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Procedure {
    Insert,
    Update,
    Custom(String),
}

impl Procedure {
    pub fn as_str(&self) -> &str {
        match self {
            Procedure::Insert => "INSERT",
            Procedure::Update => "UPDATE",
            Procedure::Custom(tag) => tag.as_str(),
        }
    }

    pub fn is_lww(&self) -> bool {
        matches!(self, Procedure::Insert | Procedure::Update)
    }
}

impl Serialize for Procedure {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Procedure {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "INSERT" => Procedure::Insert,
            "UPDATE" => Procedure::Update,
            _ => Procedure::Custom(s),
        })
    }
}

/// Per-field metadata carried alongside a value on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub timestamp: Timestamp,
}

/// A single field's value plus its LWW timestamp, as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireFieldValue {
    pub value: serde_json::Value,
    #[serde(rename = "_meta")]
    pub meta: FieldMeta,
}

/// `payload` in a `MUTATE` message, or one row's value in a `SYNC` snapshot:
/// a map from field name to its value+timestamp. Never carries the `id`
/// field (spec.md §3, §4.2): `resourceId` is the sole authority for identity.
pub type Payload = BTreeMap<String, WireFieldValue>;

pub fn payload_carries_id(payload: &Payload) -> bool {
    payload.contains_key("id")
}

/// Messages sent from the client to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "SUBSCRIBE")]
    Subscribe {
        #[serde(rename = "_id")]
        id: MessageId,
        resource: String,
    },
    #[serde(rename = "SYNC")]
    Sync {
        #[serde(rename = "_id")]
        id: MessageId,
        #[serde(rename = "lastSyncedAt", skip_serializing_if = "Option::is_none", default)]
        last_synced_at: Option<Timestamp>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        resources: Option<Vec<String>>,
    },
    #[serde(rename = "MUTATE")]
    Mutate {
        #[serde(rename = "_id")]
        id: MessageId,
        resource: String,
        #[serde(rename = "resourceId")]
        resource_id: String,
        procedure: Procedure,
        payload: Payload,
    },
}

impl ClientMessage {
    pub fn id(&self) -> &MessageId {
        match self {
            ClientMessage::Subscribe { id, .. } => id,
            ClientMessage::Sync { id, .. } => id,
            ClientMessage::Mutate { id, .. } => id,
        }
    }
}

/// Messages sent from the server to the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "SYNC")]
    Sync {
        #[serde(rename = "_id")]
        id: MessageId,
        resource: String,
        data: BTreeMap<String, Payload>,
    },
    #[serde(rename = "MUTATE")]
    Mutate {
        #[serde(rename = "_id")]
        id: MessageId,
        resource: String,
        #[serde(rename = "resourceId")]
        resource_id: String,
        procedure: Procedure,
        payload: Payload,
    },
    #[serde(rename = "REJECT")]
    Reject {
        #[serde(rename = "_id")]
        id: MessageId,
        resource: String,
    },
}

impl ServerMessage {
    pub fn id(&self) -> &MessageId {
        match self {
            ServerMessage::Sync { id, .. } => id,
            ServerMessage::Mutate { id, .. } => id,
            ServerMessage::Reject { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert(
            "name".to_string(),
            WireFieldValue {
                value: serde_json::json!("Ana"),
                meta: FieldMeta {
                    timestamp: Timestamp::parse("2024-01-01T00:00:00Z").unwrap(),
                },
            },
        );
        payload
    }

    #[test]
    fn mutate_round_trips_through_json() {
        let msg = ClientMessage::Mutate {
            id: MessageId::new(),
            resource: "users".to_string(),
            resource_id: "u1".to_string(),
            procedure: Procedure::Insert,
            payload: sample_payload(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"MUTATE\""));
        assert!(json.contains("\"INSERT\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::Mutate { resource, procedure, .. } => {
                assert_eq!(resource, "users");
                assert_eq!(procedure, Procedure::Insert);
            }
            _ => panic!("expected Mutate"),
        }
    }

    #[test]
    fn custom_procedure_round_trips_as_its_own_tag() {
        let msg = ServerMessage::Mutate {
            id: MessageId::new(),
            resource: "posts".to_string(),
            resource_id: "p1".to_string(),
            procedure: Procedure::Custom("archive".to_string()),
            payload: Payload::new(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["procedure"], "archive");
    }

    #[test]
    fn payload_carrying_id_is_detected() {
        let mut payload = sample_payload();
        payload.insert(
            "id".to_string(),
            WireFieldValue {
                value: serde_json::json!("u1"),
                meta: FieldMeta {
                    timestamp: Timestamp::now(),
                },
            },
        );
        assert!(payload_carries_id(&payload));
    }

    #[test]
    fn reject_round_trips() {
        let msg = ServerMessage::Reject {
            id: MessageId::from("abc".to_string()),
            resource: "posts".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id().as_str(), "abc");
    }
}
