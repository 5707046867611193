//! capstan-engine — the rollout convergence engine.
//!
//! A rollout is a durable per-capsule state machine walked one *turn* at a
//! time: each turn loads the rollout, advances at most one phase, persists
//! the status with a compare-and-set write, and re-enqueues itself when
//! more work is due. The [`RolloutScheduler`] feeds turns from the job
//! queue to a bounded pool of workers and rebuilds the queue from the
//! repository after a restart.
//!
//! The engine owns no storage and no cluster access of its own; it drives
//! the contracts in `capstan-core` (`CapsuleRepository`, `SecretStore`,
//! `ServiceAccountRegistry`, `ClusterGateway`, `EventLog`).

pub mod config;
pub mod local;
pub mod scheduler;
pub mod service;
mod turn;

pub use config::EngineConfig;
pub use scheduler::RolloutScheduler;
pub use service::RolloutService;
pub use turn::{ENV_CLIENT_ID, ENV_CLIENT_SECRET, ENV_PROJECT_ID};
