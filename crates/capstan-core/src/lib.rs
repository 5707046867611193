//! capstan-core — shared domain model for the Capstan control plane.
//!
//! Defines the capsule/rollout/build/event types persisted by the state
//! store and exchanged with the cluster, the error taxonomy used across
//! every crate, the injectable [`Clock`], and the contracts the rollout
//! engine consumes: [`CapsuleRepository`], [`SecretStore`],
//! [`ServiceAccountRegistry`], [`ClusterGateway`], and [`EventLog`].

pub mod clock;
pub mod contracts;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use contracts::{
    CapsuleRepository, ClusterGateway, EventLog, SecretStore, ServiceAccountRegistry,
};
pub use error::{Error, Result};
pub use types::*;
