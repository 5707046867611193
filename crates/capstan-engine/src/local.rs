//! In-process registry and gateway implementations.
//!
//! Back the single-node `capstand` daemon and the engine's tests. The
//! local gateway does not run workloads; it records the desired spec and
//! reports the requested replicas as running instances of the upserted
//! build, which is what a converged cluster would answer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use capstan_core::{
    Author, CapsuleSpec, ClusterGateway, Error, Instance, InstanceState, JwtSigningMethod,
    NewServiceAccount, Result, ServiceAccount, ServiceAccountRegistry,
};

/// In-memory service-account registry with an HMAC signing key generated
/// at construction.
pub struct LocalRegistry {
    accounts: Mutex<Vec<ServiceAccount>>,
    signing_key: Vec<u8>,
    author: Author,
}

impl LocalRegistry {
    pub fn new(author: Author) -> Self {
        let mut signing_key = Uuid::new_v4().into_bytes().to_vec();
        signing_key.extend_from_slice(&Uuid::new_v4().into_bytes());
        Self {
            accounts: Mutex::new(Vec::new()),
            signing_key,
            author,
        }
    }

    /// Snapshot of the registered accounts.
    pub fn accounts(&self) -> Vec<ServiceAccount> {
        self.accounts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceAccountRegistry for LocalRegistry {
    async fn create_service_account(
        &self,
        name: &str,
        _system: bool,
    ) -> Result<NewServiceAccount> {
        let mut accounts = self.accounts.lock().unwrap();
        if accounts.iter().any(|account| account.name == name) {
            return Err(Error::AlreadyExists(format!("service account '{name}'")));
        }

        let id = Uuid::new_v4();
        let account = ServiceAccount {
            id,
            name: name.to_string(),
            client_id: format!("ca-{}", id.simple()),
        };
        let client_secret = format!(
            "cs-{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        accounts.push(account.clone());
        debug!(name, client_id = %account.client_id, "service account created");

        Ok(NewServiceAccount {
            id,
            client_id: account.client_id,
            client_secret,
        })
    }

    async fn list_service_accounts(&self) -> Result<Vec<ServiceAccount>> {
        Ok(self.accounts.lock().unwrap().clone())
    }

    async fn delete_service_account(&self, id: Uuid) -> Result<()> {
        let mut accounts = self.accounts.lock().unwrap();
        let before = accounts.len();
        accounts.retain(|account| account.id != id);
        if accounts.len() == before {
            return Err(Error::NotFound(format!("service account '{id}'")));
        }
        Ok(())
    }

    async fn jwt_signing_method(&self) -> Result<JwtSigningMethod> {
        Ok(JwtSigningMethod::Hmac(self.signing_key.clone()))
    }

    async fn get_author(&self) -> Result<Author> {
        Ok(self.author.clone())
    }
}

/// Gateway for a single-node deployment: stores the last upserted spec per
/// capsule name and reports it as fully converged.
#[derive(Default)]
pub struct LocalGateway {
    capsules: Mutex<HashMap<String, CapsuleSpec>>,
}

impl LocalGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently upserted spec for a capsule, if any.
    pub fn capsule(&self, name: &str) -> Option<CapsuleSpec> {
        self.capsules.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl ClusterGateway for LocalGateway {
    async fn upsert_capsule(&self, name: &str, spec: &CapsuleSpec) -> Result<()> {
        self.capsules
            .lock()
            .unwrap()
            .insert(name.to_string(), spec.clone());
        debug!(capsule = name, build_id = %spec.build_id, "capsule upserted");
        Ok(())
    }

    async fn list_instances(&self, name: &str) -> Result<Vec<Instance>> {
        let capsules = self.capsules.lock().unwrap();
        let Some(spec) = capsules.get(name) else {
            return Ok(Vec::new());
        };
        Ok((0..spec.replicas)
            .map(|index| Instance {
                instance_id: format!("{name}-{index}"),
                state: InstanceState::Running,
                build_id: spec.build_id.clone(),
            })
            .collect())
    }
}
