//! A single entry in a resource's optimistic mutation stack (spec.md
//! §4.8): enough to replay the merge that produced it.

use wire::{MessageId, Payload, Procedure};

#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub id: MessageId,
    pub resource_id: String,
    pub procedure: Procedure,
    pub payload: Payload,
}

impl Mutation {
    pub fn new(id: MessageId, resource_id: impl Into<String>, procedure: Procedure, payload: Payload) -> Self {
        Self {
            id,
            resource_id: resource_id.into(),
            procedure,
            payload,
        }
    }
}
