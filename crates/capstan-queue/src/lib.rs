//! capstan-queue — time-ordered job queue feeding the rollout scheduler.
//!
//! The queue holds one entry per `(capsule_id, rollout_id)` with a due
//! time. It is an in-memory cache of the repository's active rollouts:
//! durable state lives in each rollout's `scheduled_at`, and the scheduler
//! rebuilds the queue from the repository at start-up.

pub mod queue;

pub use queue::{Job, JobQueue};
