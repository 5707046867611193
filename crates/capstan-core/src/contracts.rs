//! Contracts between the rollout engine and its collaborators.
//!
//! The engine holds each of these as `Arc<dyn Trait>`. Implementations
//! translate their failures into the [`crate::Error`] taxonomy; the engine
//! branches on error kinds, never on concrete implementation types.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    ActiveRollout, Author, Build, Capsule, CapsuleId, CapsuleSpec, Event, Instance,
    JwtSigningMethod, NewServiceAccount, Pagination, RolloutConfig, RolloutId, RolloutStatus,
    ServiceAccount,
};

/// Durable storage for capsules, builds, and rollouts.
///
/// Rollout statuses are versioned: `update_rollout_status` must reject a
/// write whose `version` no longer matches the stored record with
/// [`crate::Error::StaleVersion`], and bump the version on success.
#[async_trait]
pub trait CapsuleRepository: Send + Sync {
    async fn get(&self, capsule_id: CapsuleId) -> Result<Capsule>;

    async fn update(&self, capsule: &Capsule) -> Result<()>;

    async fn get_build(&self, capsule_id: CapsuleId, build_id: &str) -> Result<Build>;

    /// Persists a new rollout and assigns the next per-capsule rollout id.
    async fn create_rollout(
        &self,
        capsule_id: CapsuleId,
        config: &RolloutConfig,
        status: &RolloutStatus,
    ) -> Result<RolloutId>;

    /// Returns `(config, status, version)`; the version is the CAS token
    /// for the next `update_rollout_status`.
    async fn get_rollout(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
    ) -> Result<(RolloutConfig, RolloutStatus, u64)>;

    async fn update_rollout_status(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
        version: u64,
        status: &RolloutStatus,
    ) -> Result<()>;

    /// Every rollout whose status carries a `scheduled_at`, in stable
    /// order. Drives work-queue rehydration after restart.
    async fn active_rollouts(&self, page: &Pagination) -> Result<Vec<ActiveRollout>>;
}

/// Opaque byte-blob secrets addressed by id.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn create(&self, secret_id: Uuid, value: &[u8]) -> Result<()>;

    async fn get(&self, secret_id: Uuid) -> Result<Vec<u8>>;

    async fn delete(&self, secret_id: Uuid) -> Result<()>;
}

/// Machine-identity registry plus caller identification.
#[async_trait]
pub trait ServiceAccountRegistry: Send + Sync {
    /// Fails with [`crate::Error::AlreadyExists`] on a name collision.
    async fn create_service_account(&self, name: &str, system: bool)
        -> Result<NewServiceAccount>;

    async fn list_service_accounts(&self) -> Result<Vec<ServiceAccount>>;

    async fn delete_service_account(&self, id: Uuid) -> Result<()>;

    /// The signing material used for workload tokens; determines the
    /// `jwt_method` variant handed to the cluster gateway.
    async fn jwt_signing_method(&self) -> Result<JwtSigningMethod>;

    /// Identity of the caller, stamped into `RolloutConfig::created_by`.
    async fn get_author(&self) -> Result<Author>;
}

/// Abstraction over the container cluster's control plane.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Idempotent reconciliation of the capsule's namespace, deployment,
    /// service, ingress, and credential material.
    async fn upsert_capsule(&self, name: &str, spec: &CapsuleSpec) -> Result<()>;

    async fn list_instances(&self, name: &str) -> Result<Vec<Instance>>;
}

/// Append-only audit log of rollout events.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: &Event) -> Result<()>;

    /// Events for one rollout in insertion order.
    async fn list(&self, capsule_id: CapsuleId, rollout_id: RolloutId) -> Result<Vec<Event>>;
}
