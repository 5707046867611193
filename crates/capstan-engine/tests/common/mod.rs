//! Shared harness for engine integration tests: an in-memory store, the
//! local registry, a scriptable gateway, and a hand-advanced clock.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use capstan_core::{
    Author, Build, Capsule, CapsuleSpec, Clock, ClusterGateway, Instance, InstanceState,
    ManualClock, Result,
};
use capstan_engine::{local::LocalRegistry, EngineConfig, RolloutService};
use capstan_queue::{Job, JobQueue};
use capstan_state::Store;

/// Gateway whose instance listings follow a script.
///
/// Each `list_instances` call consumes the next phase; the last phase
/// repeats once the script runs out. Upserts are recorded for inspection.
#[derive(Default)]
pub struct ScriptedGateway {
    phases: Mutex<VecDeque<Vec<Instance>>>,
    upserts: Mutex<Vec<(String, CapsuleSpec)>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_phase(&self, instances: Vec<Instance>) {
        self.phases.lock().unwrap().push_back(instances);
    }

    pub fn upserts(&self) -> Vec<(String, CapsuleSpec)> {
        self.upserts.lock().unwrap().clone()
    }

    pub fn last_upsert(&self) -> Option<CapsuleSpec> {
        self.upserts
            .lock()
            .unwrap()
            .last()
            .map(|(_, spec)| spec.clone())
    }
}

#[async_trait]
impl ClusterGateway for ScriptedGateway {
    async fn upsert_capsule(&self, name: &str, spec: &CapsuleSpec) -> Result<()> {
        self.upserts
            .lock()
            .unwrap()
            .push((name.to_string(), spec.clone()));
        Ok(())
    }

    async fn list_instances(&self, _name: &str) -> Result<Vec<Instance>> {
        let mut phases = self.phases.lock().unwrap();
        if phases.len() > 1 {
            Ok(phases.pop_front().unwrap())
        } else {
            Ok(phases.front().cloned().unwrap_or_default())
        }
    }
}

pub fn running_instance(id: &str, build_id: &str) -> Instance {
    Instance {
        instance_id: id.to_string(),
        state: InstanceState::Running,
        build_id: build_id.to_string(),
    }
}

pub fn pending_instance(id: &str, build_id: &str) -> Instance {
    Instance {
        instance_id: id.to_string(),
        state: InstanceState::Pending,
        build_id: build_id.to_string(),
    }
}

pub struct Harness {
    pub store: Store,
    pub registry: Arc<LocalRegistry>,
    pub gateway: Arc<ScriptedGateway>,
    pub clock: Arc<ManualClock>,
    pub service: Arc<RolloutService>,
    pub capsule: Capsule,
}

impl Harness {
    pub fn new() -> Self {
        let store = Store::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(LocalRegistry::new(Author {
            id: "acc-1".to_string(),
            name: "tester".to_string(),
        }));
        let gateway = Arc::new(ScriptedGateway::new());

        let capsule = Capsule {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "checkout".to_string(),
            current_rollout: 0,
        };
        store.create_capsule(&capsule).unwrap();

        let service = Arc::new(RolloutService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            registry.clone(),
            gateway.clone(),
            Arc::new(store.clone()),
            Arc::new(JobQueue::new()),
            clock.clone(),
            EngineConfig::default(),
        ));

        Self {
            store,
            registry,
            gateway,
            clock,
            service,
            capsule,
        }
    }

    pub fn register_build(&self, build_id: &str, image: &str) {
        self.store
            .create_build(
                self.capsule.id,
                &Build {
                    id: build_id.to_string(),
                    image: image.to_string(),
                    created_at: self.clock.now(),
                },
            )
            .unwrap();
    }

    pub fn job(&self, rollout_id: u64) -> Job {
        Job {
            project_id: self.capsule.project_id,
            capsule_id: self.capsule.id,
            rollout_id,
        }
    }

    /// One FSM turn, driven the way the scheduler would drive it.
    pub async fn turn(&self, rollout_id: u64) -> Result<()> {
        self.service.run_turn(&self.job(rollout_id)).await
    }

    /// Advance the clock past the retry interval and run another turn.
    pub async fn turn_after_backoff(&self, rollout_id: u64) -> Result<()> {
        self.clock.advance(chrono::Duration::seconds(3));
        self.turn(rollout_id).await
    }

    pub fn status(&self, rollout_id: u64) -> capstan_core::RolloutStatus {
        let (_, status, _) = self
            .store
            .get_rollout_record(self.capsule.id, rollout_id)
            .unwrap();
        status
    }

    pub fn version(&self, rollout_id: u64) -> u64 {
        let (_, _, version) = self
            .store
            .get_rollout_record(self.capsule.id, rollout_id)
            .unwrap();
        version
    }

    pub fn event_messages(&self, rollout_id: u64) -> Vec<String> {
        self.store
            .list_events(self.capsule.id, rollout_id)
            .unwrap()
            .into_iter()
            .map(|event| event.message)
            .collect()
    }
}
