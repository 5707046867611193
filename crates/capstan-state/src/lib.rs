//! capstan-state — embedded state store for the Capstan control plane.
//!
//! Backed by [redb](https://docs.rs/redb), persists capsules, builds,
//! rollouts, events, and secrets. All domain types are JSON-serialized
//! into redb's `&[u8]` value columns; composite keys zero-pad numeric
//! components so lexicographic key order matches numeric order.
//!
//! The [`Store`] is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and implements the engine's [`capstan_core::CapsuleRepository`],
//! [`capstan_core::SecretStore`], and [`capstan_core::EventLog`]
//! contracts. Rollout statuses are versioned; `update_rollout_status`
//! enforces compare-and-set on the stored version.

pub mod store;
pub mod tables;

pub use store::Store;
