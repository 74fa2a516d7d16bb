//! Common type definitions shared across the crate.
//!
//! All entity IDs are UUIDs behind type aliases for readability at call
//! sites. [`abbrev_uuid`] shortens IDs for log lines.

use uuid::Uuid;

// Type aliases for IDs
pub type TenantId = Uuid;
pub type UserId = Uuid;
pub type ApiKeyId = Uuid;
pub type CatalogEntryId = Uuid;
pub type UsageRowId = Uuid;
pub type FileId = Uuid;
pub type BatchId = Uuid;
pub type BatchItemId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbrev_uuid() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(abbrev_uuid(&id), "550e8400");
    }
}
