use std::collections::BTreeMap;

use errors::ErrorMetadata;

use crate::relation::RelationDecl;
use crate::resource::ResourceSchema;

/// The full set of declared resources, validated as a unit so that cross-
/// resource references (a `one` relation's target, a `many` relation's
/// source) can be checked once at construction rather than discovered at
/// merge or query time.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    resources: BTreeMap<String, ResourceSchema>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceSchema> {
        self.resources.get(name)
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn require_resource(&self, name: &str) -> anyhow::Result<&ResourceSchema> {
        self.resource(name).ok_or_else(|| {
            anyhow::Error::new(ErrorMetadata::planning(
                "UnknownResource",
                format!("No resource named {name:?} is declared."),
            ))
        })
    }
}

#[derive(Default)]
pub struct SchemaBuilder {
    resources: BTreeMap<String, ResourceSchema>,
}

impl SchemaBuilder {
    pub fn resource(mut self, resource: ResourceSchema) -> Self {
        self.resources.insert(resource.name.clone(), resource);
        self
    }

    pub fn build(self) -> anyhow::Result<Schema> {
        for resource in self.resources.values() {
            resource.validate()?;
            for relation in resource.relations.values() {
                let target_name = relation.target_resource();
                let target = self.resources.get(target_name).ok_or_else(|| {
                    anyhow::Error::new(ErrorMetadata::planning(
                        "UnknownResource",
                        format!(
                            "Resource {:?} declares a relation to undeclared resource {target_name:?}.",
                            resource.name
                        ),
                    ))
                })?;
                if let RelationDecl::Many { field, .. } = relation {
                    match target.field_kind(field) {
                        Some(crate::field::FieldKind::Reference { target: back_target })
                            if back_target == &resource.name => {}
                        _ => anyhow::bail!(ErrorMetadata::planning(
                            "InvalidRelation",
                            format!(
                                "Resource {:?} declares a many-relation via {target_name:?}.{field:?}, which is not a reference back to it.",
                                resource.name
                            )
                        )),
                    }
                }
            }
        }
        Ok(Schema {
            resources: self.resources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldSchema;

    fn orgs_posts_schema() -> anyhow::Result<Schema> {
        let orgs = ResourceSchema::new("orgs")
            .field(FieldSchema::string("name"))
            .many("posts", "posts", "orgId");
        let posts = ResourceSchema::new("posts")
            .field(FieldSchema::string("title"))
            .field(FieldSchema::reference("orgId", "orgs"))
            .one("org", "orgs", "orgId", false);
        Schema::builder().resource(orgs).resource(posts).build()
    }

    #[test]
    fn build_accepts_consistent_cross_references() {
        assert!(orgs_posts_schema().is_ok());
    }

    #[test]
    fn build_rejects_relation_to_undeclared_resource() {
        let posts = ResourceSchema::new("posts")
            .field(FieldSchema::reference("orgId", "orgs"))
            .one("org", "orgs", "orgId", false);
        let result = Schema::builder().resource(posts).build();
        assert!(result.is_err());
    }

    #[test]
    fn build_rejects_many_relation_whose_field_does_not_point_back() {
        let orgs = ResourceSchema::new("orgs").many("posts", "posts", "title");
        let posts = ResourceSchema::new("posts").field(FieldSchema::string("title"));
        let result = Schema::builder().resource(orgs).resource(posts).build();
        assert!(result.is_err());
    }

    #[test]
    fn require_resource_errors_on_unknown_name() {
        let schema = orgs_posts_schema().unwrap();
        assert!(schema.require_resource("comments").is_err());
        assert!(schema.require_resource("orgs").is_ok());
    }
}
