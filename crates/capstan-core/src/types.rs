//! Domain types for the Capstan control plane.
//!
//! Everything here is serde-serializable: the state store persists these
//! types as JSON values and the API exposes them unchanged where the
//! contract allows (rollout statuses are stripped first, see
//! [`RolloutStatus::public`]).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a capsule.
pub type CapsuleId = Uuid;

/// Unique identifier of the project (tenant) owning a capsule. Doubles as
/// the cluster namespace for the capsule's resources.
pub type ProjectId = Uuid;

/// Per-capsule monotonically increasing rollout number. `0` means "no
/// rollout yet" and is never a valid rollout id.
pub type RolloutId = u64;

// ── Capsule ────────────────────────────────────────────────────────

/// A unit of workload definition: one deployment plus its networking and
/// credential material on the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub id: CapsuleId,
    pub project_id: ProjectId,
    pub name: String,
    /// Id of the newest rollout, advanced by `new_rollout`. `0` if the
    /// capsule has never been rolled out.
    pub current_rollout: RolloutId,
}

// ── Rollout ────────────────────────────────────────────────────────

/// Progress of a rollout through the convergence state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Pending,
    Preparing,
    Deploying,
    Observing,
    Done,
    Failed,
    Aborted,
}

impl RolloutState {
    /// Terminal states accept no further transitions and are never
    /// scheduled for more work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutState::Done | RolloutState::Failed | RolloutState::Aborted
        )
    }
}

/// One requested modification to a capsule's target configuration.
///
/// The set of constructors is closed; requests carrying an unrecognized
/// kind fail to deserialize at the API boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Change {
    Replicas(u32),
    BuildId(String),
    Network(Network),
    ContainerSettings(ContainerSettings),
    AutoAddRigServiceAccounts(bool),
}

/// Immutable desired state for one rollout, fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub replicas: u32,
    #[serde(default)]
    pub build_id: String,
    #[serde(default)]
    pub network: Option<Network>,
    #[serde(default)]
    pub container_settings: Option<ContainerSettings>,
    #[serde(default)]
    pub auto_add_rig_service_accounts: bool,
    /// The changes that produced this config, kept verbatim for audit.
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Author,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Credentials of the service account auto-provisioned for a capsule.
/// `client_secret_key` is the id of the secret-store row holding the
/// client secret, never the secret itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccountCredentials {
    pub client_id: String,
    pub client_secret_key: String,
}

/// Mutable, versioned progress record of a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub state: RolloutState,
    #[serde(default)]
    pub message: String,
    pub updated_at: DateTime<Utc>,
    /// When the rollout is due for its next turn. `None` means the rollout
    /// is not on the work queue; terminal states always carry `None`.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rig_service_account: Option<ServiceAccountCredentials>,
}

impl RolloutStatus {
    /// The caller-visible view: no `scheduled_at`, no secret-store key.
    pub fn public(&self) -> PublicRolloutStatus {
        PublicRolloutStatus {
            state: self.state,
            message: self.message.clone(),
            updated_at: self.updated_at,
            client_id: self
                .rig_service_account
                .as_ref()
                .map(|sa| sa.client_id.clone()),
        }
    }
}

/// Rollout status as exposed through the public API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicRolloutStatus {
    pub state: RolloutState,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Config plus public status, as returned by `get_rollout`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub rollout_id: RolloutId,
    pub config: RolloutConfig,
    pub status: PublicRolloutStatus,
}

/// One row of the repository's active-rollout scan: every rollout whose
/// status still carries a `scheduled_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRollout {
    pub project_id: ProjectId,
    pub capsule_id: CapsuleId,
    pub rollout_id: RolloutId,
    pub scheduled_at: DateTime<Utc>,
}

/// Offset/limit window for repository scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: Option<u64>,
}

// ── Container settings ─────────────────────────────────────────────

/// Per-container runtime settings carried by a rollout config and handed
/// to the cluster gateway unchanged (modulo injected environment).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub resources: Option<Resources>,
}

/// Resource requests for a capsule's containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_weight: Option<u32>,
}

// ── Network ────────────────────────────────────────────────────────

/// Network exposure for a capsule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub public: bool,
}

// ── Build ──────────────────────────────────────────────────────────

/// A registered image build. Owned by the build service; the engine only
/// resolves `image` from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Rollout,
    Abort,
    Error,
}

/// Append-only audit record of rollout progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub capsule_id: CapsuleId,
    pub rollout_id: RolloutId,
    pub message: String,
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
}

// ── Identity ───────────────────────────────────────────────────────

/// Who created a rollout, as reported by the service-account registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A registered machine identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub id: Uuid,
    pub name: String,
    pub client_id: String,
}

/// Result of creating a service account. The client secret is returned
/// exactly once, here; it is not retrievable later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewServiceAccount {
    pub id: Uuid,
    pub client_id: String,
    pub client_secret: String,
}

/// The registry's token-signing material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JwtSigningMethod {
    Hmac(Vec<u8>),
    Certificate(Vec<u8>),
}

// ── Cluster gateway ────────────────────────────────────────────────

/// JWT verification material handed to the cluster proxy alongside the
/// workload, derived from the registry's signing method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JwtMethod {
    Secret(Vec<u8>),
    Certificate(Vec<u8>),
}

/// Desired state of a capsule on the cluster, as handed to
/// [`crate::ClusterGateway::upsert_capsule`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleSpec {
    pub capsule_id: CapsuleId,
    /// Cluster namespace; the stringified project id.
    pub namespace: String,
    pub image: String,
    pub container_settings: ContainerSettings,
    pub build_id: String,
    pub replicas: u32,
    #[serde(default)]
    pub network: Option<Network>,
    pub jwt_method: JwtMethod,
}

/// Lifecycle state of one running instance, as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Failed,
}

/// One instance of a capsule on the cluster, with build provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub state: InstanceState,
    pub build_id: String,
}
