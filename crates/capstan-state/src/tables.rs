//! redb table definitions for the Capstan state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Numeric key components are zero-padded so that lexicographic
//! order equals numeric order.

use redb::TableDefinition;

/// Capsules keyed by `{capsule_id}`.
pub const CAPSULES: TableDefinition<&str, &[u8]> = TableDefinition::new("capsules");

/// Builds keyed by `{capsule_id}:{build_id}`.
pub const BUILDS: TableDefinition<&str, &[u8]> = TableDefinition::new("builds");

/// Rollout records keyed by `{capsule_id}:{rollout_id:020}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Rollout events keyed by `{capsule_id}:{rollout_id:020}:{seq:010}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Secret blobs keyed by `{secret_id}`.
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Key of a rollout record.
pub fn rollout_key(capsule_id: uuid::Uuid, rollout_id: u64) -> String {
    format!("{capsule_id}:{rollout_id:020}")
}

/// Key of one rollout event.
pub fn event_key(capsule_id: uuid::Uuid, rollout_id: u64, seq: u64) -> String {
    format!("{capsule_id}:{rollout_id:020}:{seq:010}")
}

/// Key of a build row.
pub fn build_key(capsule_id: uuid::Uuid, build_id: &str) -> String {
    format!("{capsule_id}:{build_id}")
}
