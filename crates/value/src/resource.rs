use std::collections::BTreeMap;

use errors::ErrorMetadata;
use wire::identifier::check_valid_identifier;

use crate::field::{FieldKind, FieldSchema};
use crate::relation::RelationDecl;

/// A named collection of objects with a fixed set of typed fields and
/// declared relations (spec.md §3).
#[derive(Clone, Debug)]
pub struct ResourceSchema {
    pub name: String,
    pub fields: BTreeMap<String, FieldSchema>,
    pub relations: BTreeMap<String, RelationDecl>,
}

impl ResourceSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn one(mut self, relation_name: impl Into<String>, target: impl Into<String>, field: impl Into<String>, optional: bool) -> Self {
        self.relations.insert(
            relation_name.into(),
            RelationDecl::One {
                target: target.into(),
                field: field.into(),
                optional,
            },
        );
        self
    }

    pub fn many(mut self, relation_name: impl Into<String>, source: impl Into<String>, field: impl Into<String>) -> Self {
        self.relations.insert(
            relation_name.into(),
            RelationDecl::Many {
                source: source.into(),
                field: field.into(),
            },
        );
        self
    }

    pub fn field_kind(&self, name: &str) -> Option<&FieldKind> {
        self.fields.get(name).map(|f| &f.kind)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDecl> {
        self.relations.get(name)
    }

    /// Construction-time validation local to this resource: identifier
    /// shape, no duplicate declarations, each field individually valid, and
    /// every `one` relation's `field` actually declared as a `Reference`.
    pub fn validate(&self) -> anyhow::Result<()> {
        check_valid_identifier(&self.name)?;
        for field in self.fields.values() {
            field.validate()?;
        }
        for (relation_name, relation) in &self.relations {
            check_valid_identifier(relation_name)?;
            if let RelationDecl::One { field, target, .. } = relation {
                match self.fields.get(field) {
                    Some(f) => match &f.kind {
                        FieldKind::Reference { target: declared_target } if declared_target == target => {}
                        _ => anyhow::bail!(ErrorMetadata::planning(
                            "InvalidRelation",
                            format!(
                                "Relation {relation_name:?} on {:?} names field {field:?}, which is not a reference to {target:?}.",
                                self.name
                            )
                        )),
                    },
                    None => anyhow::bail!(ErrorMetadata::planning(
                        "InvalidRelation",
                        format!("Relation {relation_name:?} on {:?} names undeclared field {field:?}.", self.name)
                    )),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldSchema;

    #[test]
    fn validate_accepts_well_formed_resource() {
        let posts = ResourceSchema::new("posts")
            .field(FieldSchema::string("title"))
            .field(FieldSchema::reference("orgId", "orgs"))
            .one("org", "orgs", "orgId", false);
        assert!(posts.validate().is_ok());
    }

    #[test]
    fn validate_rejects_one_relation_on_non_reference_field() {
        let posts = ResourceSchema::new("posts")
            .field(FieldSchema::string("title"))
            .one("org", "orgs", "title", false);
        assert!(posts.validate().is_err());
    }

    #[test]
    fn validate_rejects_one_relation_on_missing_field() {
        let posts = ResourceSchema::new("posts").one("org", "orgs", "orgId", false);
        assert!(posts.validate().is_err());
    }
}
