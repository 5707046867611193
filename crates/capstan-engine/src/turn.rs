//! One FSM turn: dispatch on the rollout's state, persist, re-enqueue.
//!
//! A turn advances a rollout by at most one phase. Anything long-running
//! (waiting for instances to come up) is expressed as a failed turn plus a
//! re-enqueue a few seconds out, never as a sleep inside a worker.

use tracing::{info, warn};
use uuid::Uuid;

use capstan_core::{
    Capsule, CapsuleSpec, Error, EventKind, InstanceState, JwtMethod, JwtSigningMethod, Result,
    RolloutConfig, RolloutState, RolloutStatus, ServiceAccountCredentials,
};
use capstan_queue::Job;

use crate::service::RolloutService;

/// Injected into every capsule container.
pub const ENV_PROJECT_ID: &str = "RIG_PROJECT_ID";
/// Injected when service-account auto-binding is enabled.
pub const ENV_CLIENT_ID: &str = "RIG_CLIENT_ID";
/// Injected when service-account auto-binding is enabled.
pub const ENV_CLIENT_SECRET: &str = "RIG_CLIENT_SECRET";

/// Name of the service account auto-provisioned for a capsule.
fn service_account_name(capsule: &Capsule) -> String {
    format!("rig-capsule-{}", capsule.name)
}

fn parse_secret_key(key: &str) -> Result<Uuid> {
    Uuid::parse_str(key)
        .map_err(|e| Error::InvalidArgument(format!("malformed secret key '{key}': {e}")))
}

impl RolloutService {
    /// Run one turn for `job`.
    ///
    /// Loads the rollout, dispatches on its state, then decides scheduling
    /// from what the dispatch did:
    ///
    /// - no visible progress (and not terminal): back off by the retry
    ///   interval and try again;
    /// - `InvalidArgument`: the rollout can never make progress; mark it
    ///   `FAILED` and de-schedule;
    /// - success: terminal states are de-scheduled, everything else runs
    ///   again immediately;
    /// - any other error: record the message, back off, append an `ERROR`
    ///   event.
    ///
    /// Every status write goes through the version CAS. A stale version
    /// means another writer (typically an abort) advanced the rollout; the
    /// turn exits without re-enqueueing and lets the winner's scheduling
    /// decision stand.
    pub async fn run_turn(&self, job: &Job) -> Result<()> {
        info!(
            project_id = %job.project_id,
            capsule_id = %job.capsule_id,
            rollout_id = job.rollout_id,
            "running rollout turn"
        );

        let capsule = self.repo.get(job.capsule_id).await?;
        let (config, prev, version) = self
            .repo
            .get_rollout(job.capsule_id, job.rollout_id)
            .await?;

        let mut status = prev.clone();
        let outcome = self.step(job, &capsule, &config, &mut status).await;

        if status == prev && !status.state.is_terminal() {
            // The turn made no visible progress; keep the state and retry
            // after the backoff interval.
            status.scheduled_at = Some(self.clock.now() + self.config.retry_interval);
            if let Err(err) = &outcome {
                status.message = err.message().to_string();
            }
            status.updated_at = self.clock.now();
            self.repo
                .update_rollout_status(job.capsule_id, job.rollout_id, version, &status)
                .await?;
            if let Err(err) = &outcome {
                self.record_error_event(job, err).await;
            }
        } else {
            match &outcome {
                Err(err) if err.is_invalid_argument() => {
                    status.state = RolloutState::Failed;
                    status.message = err.message().to_string();
                    status.scheduled_at = None;
                    status.updated_at = self.clock.now();
                    self.repo
                        .update_rollout_status(job.capsule_id, job.rollout_id, version, &status)
                        .await?;
                    self.record_error_event(job, err).await;
                }
                Ok(()) => {
                    status.scheduled_at = if status.state.is_terminal() {
                        None
                    } else {
                        Some(self.clock.now())
                    };
                    status.updated_at = self.clock.now();
                    self.repo
                        .update_rollout_status(job.capsule_id, job.rollout_id, version, &status)
                        .await?;
                }
                Err(err) => {
                    status.scheduled_at = Some(self.clock.now() + self.config.retry_interval);
                    status.message = err.message().to_string();
                    status.updated_at = self.clock.now();
                    if let Err(write_err) = self
                        .repo
                        .update_rollout_status(job.capsule_id, job.rollout_id, version, &status)
                        .await
                    {
                        if write_err.is_stale_version() {
                            return Err(write_err);
                        }
                        warn!(error = %write_err, "failed to record rollout error status");
                    }
                    self.record_error_event(job, err).await;
                }
            }
        }

        if let Some(due_at) = status.scheduled_at {
            self.queue_rollout_job(job.project_id, job.capsule_id, job.rollout_id, due_at);
        }

        outcome
    }

    /// Dispatch on the current state and advance at most one phase.
    /// Mutates `status` only when progress is made.
    async fn step(
        &self,
        job: &Job,
        capsule: &Capsule,
        config: &RolloutConfig,
        status: &mut RolloutStatus,
    ) -> Result<()> {
        match status.state {
            RolloutState::Pending => {
                self.create_event(
                    job.capsule_id,
                    job.rollout_id,
                    "new rollout initiated",
                    EventKind::Rollout,
                )
                .await?;

                status.state = RolloutState::Preparing;
                status.message = "preparing rollout".to_string();
                Ok(())
            }

            RolloutState::Preparing => self.prepare(job, capsule, config, status).await,
            RolloutState::Deploying => self.deploy(job, capsule, config, status).await,
            RolloutState::Observing => self.observe(job, capsule, config, status).await,

            // Terminated rollouts that still hold a queue slot get
            // de-scheduled here and nothing else.
            RolloutState::Done | RolloutState::Failed | RolloutState::Aborted => {
                status.scheduled_at = None;
                Ok(())
            }
        }
    }

    /// PREPARING: reconcile the service-account binding with the config,
    /// then move on to DEPLOYING.
    ///
    /// Idempotent: re-entering with the binding already made is a no-op;
    /// re-entering after a crash before the status write re-creates it,
    /// replacing any half-made account of the same name.
    async fn prepare(
        &self,
        job: &Job,
        capsule: &Capsule,
        config: &RolloutConfig,
        status: &mut RolloutStatus,
    ) -> Result<()> {
        let account_name = service_account_name(capsule);

        if config.auto_add_rig_service_accounts {
            if status.rig_service_account.is_none() {
                self.create_event(
                    job.capsule_id,
                    job.rollout_id,
                    "creating service-account",
                    EventKind::Rollout,
                )
                .await?;

                let account = match self
                    .registry
                    .create_service_account(&account_name, true)
                    .await
                {
                    Err(err) if err.is_already_exists() => {
                        // Left over from an earlier attempt; replace it.
                        self.delete_accounts_named(&account_name).await?;
                        self.registry
                            .create_service_account(&account_name, true)
                            .await?
                    }
                    other => other?,
                };

                let secret_id = Uuid::new_v4();
                self.secrets
                    .create(secret_id, account.client_secret.as_bytes())
                    .await?;

                status.rig_service_account = Some(ServiceAccountCredentials {
                    client_id: account.client_id,
                    client_secret_key: secret_id.to_string(),
                });
            }
        } else if let Some(credentials) = status.rig_service_account.clone() {
            self.create_event(
                job.capsule_id,
                job.rollout_id,
                "deleting service-account",
                EventKind::Rollout,
            )
            .await?;

            let secret_id = parse_secret_key(&credentials.client_secret_key)?;
            match self.secrets.delete(secret_id).await {
                Err(err) if err.is_not_found() => {}
                other => other?,
            }

            self.delete_accounts_named(&account_name).await?;
            status.rig_service_account = None;
        }

        status.state = RolloutState::Deploying;
        status.message = "deploying rollout to cluster".to_string();
        Ok(())
    }

    /// DEPLOYING: resolve the build, assemble the desired capsule spec,
    /// and upsert it through the gateway.
    async fn deploy(
        &self,
        job: &Job,
        capsule: &Capsule,
        config: &RolloutConfig,
        status: &mut RolloutStatus,
    ) -> Result<()> {
        let build = match self.repo.get_build(job.capsule_id, &config.build_id).await {
            Err(err) if err.is_not_found() => {
                return Err(Error::Aborted("build not available".to_string()));
            }
            other => other?,
        };

        let mut container_settings = config.container_settings.clone().unwrap_or_default();
        container_settings
            .environment_variables
            .insert(ENV_PROJECT_ID.to_string(), job.project_id.to_string());

        if config.auto_add_rig_service_accounts {
            let credentials = status.rig_service_account.as_ref().ok_or_else(|| {
                Error::Internal("service-account binding missing".to_string())
            })?;
            let secret_id = parse_secret_key(&credentials.client_secret_key)?;
            let client_secret = self.secrets.get(secret_id).await?;

            container_settings
                .environment_variables
                .insert(ENV_CLIENT_ID.to_string(), credentials.client_id.clone());
            container_settings.environment_variables.insert(
                ENV_CLIENT_SECRET.to_string(),
                String::from_utf8_lossy(&client_secret).into_owned(),
            );
        }

        let jwt_method = match self.registry.jwt_signing_method().await? {
            JwtSigningMethod::Hmac(key) => JwtMethod::Secret(key),
            JwtSigningMethod::Certificate(key) => JwtMethod::Certificate(key),
        };

        let spec = CapsuleSpec {
            capsule_id: job.capsule_id,
            namespace: job.project_id.to_string(),
            image: build.image,
            container_settings,
            build_id: config.build_id.clone(),
            replicas: config.replicas,
            network: config.network.clone(),
            jwt_method,
        };

        self.create_event(
            job.capsule_id,
            job.rollout_id,
            "configuring cluster resources",
            EventKind::Rollout,
        )
        .await?;

        self.gateway.upsert_capsule(&capsule.name, &spec).await?;

        status.state = RolloutState::Observing;
        status.message = "waiting for new instances".to_string();
        Ok(())
    }

    /// OBSERVING: succeed only once every instance runs the rollout's
    /// build and the replica count is met. Makes no changes; a shortfall
    /// is an `Unavailable` error and the turn retries later.
    async fn observe(
        &self,
        job: &Job,
        capsule: &Capsule,
        config: &RolloutConfig,
        status: &mut RolloutStatus,
    ) -> Result<()> {
        let instances = self.gateway.list_instances(&capsule.name).await?;

        let mut running: u32 = 0;
        for instance in &instances {
            if instance.build_id != config.build_id {
                return Err(Error::Unavailable(format!(
                    "instance '{}' is wrong build",
                    instance.instance_id
                )));
            }
            if instance.state != InstanceState::Running {
                // Not a typo: this exact wording is the published message
                // for an instance that is not yet running.
                return Err(Error::Unavailable(format!(
                    "instance '{}' is running",
                    instance.instance_id
                )));
            }
            running += 1;
        }

        if running < config.replicas {
            return Err(Error::Unavailable(format!(
                "only {running} instances running, expected {}",
                config.replicas
            )));
        }

        self.create_event(
            job.capsule_id,
            job.rollout_id,
            "cluster resources created",
            EventKind::Rollout,
        )
        .await?;

        status.state = RolloutState::Done;
        status.message = "rollout done".to_string();
        status.scheduled_at = None;
        Ok(())
    }

    async fn delete_accounts_named(&self, name: &str) -> Result<()> {
        for account in self.registry.list_service_accounts().await? {
            if account.name == name {
                self.registry.delete_service_account(account.id).await?;
            }
        }
        Ok(())
    }

    /// Best-effort audit record of a failed turn.
    async fn record_error_event(&self, job: &Job, err: &Error) {
        if let Err(event_err) = self
            .create_event(
                job.capsule_id,
                job.rollout_id,
                err.message(),
                EventKind::Error,
            )
            .await
        {
            warn!(error = %event_err, "failed to append error event");
        }
    }
}
