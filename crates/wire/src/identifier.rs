//! Validation for resource, field, and relation names.
//!
//! Grounded on the teacher's `convex_sync_types::path::check_valid_path_component`.

use errors::ErrorMetadata;

pub const MAX_IDENTIFIER_LEN: usize = 64;

pub fn check_valid_identifier(s: &str) -> anyhow::Result<()> {
    if s.is_empty() {
        anyhow::bail!(ErrorMetadata::planning(
            "InvalidIdentifier",
            "Identifier cannot be empty."
        ));
    }
    if s.len() > MAX_IDENTIFIER_LEN {
        anyhow::bail!(ErrorMetadata::planning(
            "InvalidIdentifier",
            format!(
                "Identifier {s:?} is too long ({} > maximum {MAX_IDENTIFIER_LEN}).",
                s.len()
            )
        ));
    }
    if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!(ErrorMetadata::planning(
            "InvalidIdentifier",
            format!("Identifier {s:?} can only contain alphanumeric characters or underscores.")
        ));
    }
    if !s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_') {
        anyhow::bail!(ErrorMetadata::planning(
            "InvalidIdentifier",
            format!("Identifier {s:?} must start with a letter or underscore.")
        ));
    }
    Ok(())
}
