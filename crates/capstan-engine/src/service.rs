//! RolloutService — the engine's public operations and shared plumbing.
//!
//! `new_rollout` / `get_rollout` / `abort_rollout` are the caller-facing
//! surface; the FSM turn itself lives in `turn.rs` and the dispatch loop
//! in `scheduler.rs`, all on this struct.

use std::sync::Arc;

use tracing::debug;

use capstan_core::{
    CapsuleId, CapsuleRepository, Change, Clock, ClusterGateway, Error, Event, EventKind,
    EventLog, Pagination, Result, Rollout, RolloutConfig, RolloutId, RolloutState, RolloutStatus,
    SecretStore, ServiceAccountRegistry,
};
use capstan_queue::{Job, JobQueue};

use crate::config::EngineConfig;

/// The rollout engine. Cheap to clone via `Arc`; every collaborator is
/// shared.
pub struct RolloutService {
    pub(crate) repo: Arc<dyn CapsuleRepository>,
    pub(crate) secrets: Arc<dyn SecretStore>,
    pub(crate) registry: Arc<dyn ServiceAccountRegistry>,
    pub(crate) gateway: Arc<dyn ClusterGateway>,
    pub(crate) events: Arc<dyn EventLog>,
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
}

impl RolloutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn CapsuleRepository>,
        secrets: Arc<dyn SecretStore>,
        registry: Arc<dyn ServiceAccountRegistry>,
        gateway: Arc<dyn ClusterGateway>,
        events: Arc<dyn EventLog>,
        queue: Arc<JobQueue>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            secrets,
            registry,
            gateway,
            events,
            queue,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Create a rollout converging the capsule onto the changed target
    /// configuration, and queue its first turn.
    ///
    /// Starts from the previous rollout's config (a rollout describes the
    /// full target, not a delta), applies `changes`, and rejects with
    /// [`Error::FailedPrecondition`] while a previous rollout is still in
    /// flight.
    pub async fn new_rollout(
        &self,
        capsule_id: CapsuleId,
        changes: Vec<Change>,
    ) -> Result<RolloutId> {
        let mut capsule = self.repo.get(capsule_id).await?;

        let mut config = RolloutConfig {
            replicas: 1,
            ..RolloutConfig::default()
        };

        if capsule.current_rollout != 0 {
            let (previous_config, previous_status, _) = self
                .repo
                .get_rollout(capsule_id, capsule.current_rollout)
                .await?;

            if !previous_status.state.is_terminal() {
                return Err(Error::FailedPrecondition(
                    "rollout already in progress".to_string(),
                ));
            }

            config = previous_config;
        }

        let now = self.clock.now();
        config.created_at = now;
        config.created_by = self.registry.get_author().await?;

        for change in &changes {
            match change {
                Change::Replicas(replicas) => config.replicas = *replicas,
                Change::BuildId(build_id) => config.build_id = build_id.clone(),
                Change::Network(network) => config.network = Some(network.clone()),
                Change::ContainerSettings(settings) => {
                    config.container_settings = Some(settings.clone());
                }
                Change::AutoAddRigServiceAccounts(enabled) => {
                    config.auto_add_rig_service_accounts = *enabled;
                }
            }
        }
        config.changes = changes;

        // The referenced build must exist before any work is queued.
        self.repo.get_build(capsule_id, &config.build_id).await?;

        let status = RolloutStatus {
            state: RolloutState::Pending,
            message: String::new(),
            updated_at: now,
            scheduled_at: Some(now),
            rig_service_account: None,
        };

        let rollout_id = self
            .repo
            .create_rollout(capsule_id, &config, &status)
            .await?;

        capsule.current_rollout = rollout_id;
        self.repo.update(&capsule).await?;

        self.queue_rollout_job(capsule.project_id, capsule_id, rollout_id, now);

        Ok(rollout_id)
    }

    /// The rollout with its public status (no `scheduled_at`, no secret
    /// key).
    pub async fn get_rollout(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
    ) -> Result<Rollout> {
        let (config, status, _) = self.repo.get_rollout(capsule_id, rollout_id).await?;
        Ok(Rollout {
            rollout_id,
            config,
            status: status.public(),
        })
    }

    /// Flip the rollout to `ABORTED` and take it off the work queue.
    ///
    /// Does not roll back cluster state. Safe at any time: a concurrent
    /// turn observes either the aborted state on read or a stale version
    /// on write.
    pub async fn abort_rollout(&self, capsule_id: CapsuleId, rollout_id: RolloutId) -> Result<()> {
        let (_, mut status, version) = self.repo.get_rollout(capsule_id, rollout_id).await?;

        status.state = RolloutState::Aborted;
        status.scheduled_at = None;
        status.updated_at = self.clock.now();
        self.repo
            .update_rollout_status(capsule_id, rollout_id, version, &status)
            .await?;

        self.create_event(capsule_id, rollout_id, "rollout aborted", EventKind::Abort)
            .await
    }

    /// Events recorded for one rollout, in turn order.
    pub async fn list_events(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
    ) -> Result<Vec<Event>> {
        self.events.list(capsule_id, rollout_id).await
    }

    /// Rebuild the job queue from every rollout the repository still has
    /// scheduled. Run to completion before dispatching any work.
    pub async fn init_jobs(&self) -> Result<()> {
        tracing::info!("loading active rollouts from repository");

        let active = self.repo.active_rollouts(&Pagination::default()).await?;
        for rollout in active {
            self.queue_rollout_job(
                rollout.project_id,
                rollout.capsule_id,
                rollout.rollout_id,
                rollout.scheduled_at,
            );
        }
        Ok(())
    }

    pub(crate) fn queue_rollout_job(
        &self,
        project_id: uuid::Uuid,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
        due_at: chrono::DateTime<chrono::Utc>,
    ) {
        self.queue.add_job(
            Job {
                project_id,
                capsule_id,
                rollout_id,
            },
            due_at,
        );
        debug!(%capsule_id, rollout_id, %due_at, "rollout job scheduled");
    }

    pub(crate) async fn create_event(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
        message: &str,
        kind: EventKind,
    ) -> Result<()> {
        self.events
            .append(&Event {
                capsule_id,
                rollout_id,
                message: message.to_string(),
                kind,
                created_at: self.clock.now(),
            })
            .await
    }
}
