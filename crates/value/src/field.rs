use errors::ErrorMetadata;
use serde_json::Value as Json;
use wire::identifier::check_valid_identifier;

/// The declared type of a field, per spec.md §3.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    /// An instant; carried as an ISO 8601 string on the wire, same as field
    /// and object LWW timestamps, but conceptually distinct data.
    Timestamp,
    Enum(Vec<String>),
    /// Opaque JSON payload; the core does not interpret its shape.
    Json,
    /// `target.id` — carries a graph edge in addition to a plain value.
    Reference { target: String },
}

impl FieldKind {
    /// Does `value` conform to this field's declared type? `null` is
    /// accepted here iff the field is nullable, checked by the caller.
    pub fn accepts(&self, value: &Json) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Timestamp => value.is_string(),
            FieldKind::Enum(labels) => value.as_str().is_some_and(|s| labels.iter().any(|l| l == s)),
            FieldKind::Json => true,
            FieldKind::Reference { .. } => value.is_string(),
        }
    }
}

/// A single field declaration on a [`crate::resource::ResourceSchema`].
#[derive(Clone, Debug)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub default: Option<Json>,
}

impl FieldSchema {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            default: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Timestamp)
    }

    pub fn enum_(name: impl Into<String>, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(
            name,
            FieldKind::Enum(labels.into_iter().map(Into::into).collect()),
        )
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Json)
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                target: target.into(),
            },
        )
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default(mut self, value: Json) -> Self {
        self.default = Some(value);
        self
    }

    /// Synchronous construction-time validation: name shape, and a default
    /// whose declared type matches the field.
    pub fn validate(&self) -> anyhow::Result<()> {
        check_valid_identifier(&self.name)?;
        if let Some(default) = &self.default {
            if !self.kind.accepts(default) && !(default.is_null() && self.nullable) {
                anyhow::bail!(ErrorMetadata::planning(
                    "InvalidDefault",
                    format!(
                        "Default value for field {:?} does not match its declared type.",
                        self.name
                    )
                ));
            }
        }
        if let FieldKind::Enum(labels) = &self.kind {
            if labels.is_empty() {
                anyhow::bail!(ErrorMetadata::planning(
                    "InvalidEnum",
                    format!("Field {:?} declares an enum with no labels.", self.name)
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_types() {
        assert!(FieldKind::String.accepts(&serde_json::json!("x")));
        assert!(!FieldKind::String.accepts(&serde_json::json!(1)));
        assert!(FieldKind::Number.accepts(&serde_json::json!(1.5)));
        assert!(FieldKind::Enum(vec!["a".into(), "b".into()]).accepts(&serde_json::json!("a")));
        assert!(!FieldKind::Enum(vec!["a".into()]).accepts(&serde_json::json!("b")));
    }

    #[test]
    fn validate_rejects_mistyped_default() {
        let field = FieldSchema::number("age").default(serde_json::json!("not a number"));
        assert!(field.validate().is_err());
    }

    #[test]
    fn validate_accepts_null_default_on_nullable_field() {
        let field = FieldSchema::string("nickname").nullable().default(serde_json::Value::Null);
        assert!(field.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_enum() {
        let field = FieldSchema::enum_("status", Vec::<String>::new());
        assert!(field.validate().is_err());
    }
}
