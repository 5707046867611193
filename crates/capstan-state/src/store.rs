//! Store — redb-backed persistence for capsules, rollouts, and secrets.
//!
//! Storage failures surface as [`Error::Internal`]; domain outcomes
//! (missing rows, duplicate keys, stale status versions) map onto the
//! shared taxonomy so the engine can branch on error kinds.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use tracing::debug;
use uuid::Uuid;

use capstan_core::{
    ActiveRollout, Build, Capsule, CapsuleId, CapsuleRepository, Error, Event, EventLog,
    Pagination, Result, RolloutConfig, RolloutId, RolloutStatus, SecretStore,
};

use crate::tables::{build_key, event_key, rollout_key, BUILDS, CAPSULES, EVENTS, ROLLOUTS, SECRETS};

/// Convert any `Display` error into `Error::Internal` with context.
macro_rules! map_internal {
    ($ctx:literal) => {
        |e| Error::Internal(format!(concat!($ctx, ": {}"), e))
    };
}

/// Stored form of a rollout: config, status, CAS version, and the owning
/// project (denormalized for the active-rollout scan).
#[derive(serde::Serialize, serde::Deserialize)]
struct RolloutRecord {
    project_id: Uuid,
    config: RolloutConfig,
    status: RolloutStatus,
    version: u64,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(map_internal!("open database"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_internal!("open database"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CAPSULES).map_err(map_internal!("table"))?;
        txn.open_table(BUILDS).map_err(map_internal!("table"))?;
        txn.open_table(ROLLOUTS).map_err(map_internal!("table"))?;
        txn.open_table(EVENTS).map_err(map_internal!("table"))?;
        txn.open_table(SECRETS).map_err(map_internal!("table"))?;
        txn.commit().map_err(map_internal!("transaction"))?;
        Ok(())
    }

    // ── Capsules ───────────────────────────────────────────────────

    pub fn create_capsule(&self, capsule: &Capsule) -> Result<()> {
        let key = capsule.id.to_string();
        let value = serde_json::to_vec(capsule).map_err(map_internal!("serialize"))?;
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        {
            let mut table = txn.open_table(CAPSULES).map_err(map_internal!("table"))?;
            let exists = table
                .get(key.as_str())
                .map_err(map_internal!("read"))?
                .is_some();
            if exists {
                return Err(Error::AlreadyExists(format!("capsule '{}'", capsule.id)));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_internal!("write"))?;
        }
        txn.commit().map_err(map_internal!("transaction"))?;
        debug!(capsule_id = %capsule.id, name = %capsule.name, "capsule stored");
        Ok(())
    }

    pub fn get_capsule(&self, capsule_id: CapsuleId) -> Result<Capsule> {
        let txn = self.db.begin_read().map_err(map_internal!("transaction"))?;
        let table = txn.open_table(CAPSULES).map_err(map_internal!("table"))?;
        match table
            .get(capsule_id.to_string().as_str())
            .map_err(map_internal!("read"))?
        {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_internal!("deserialize"))
            }
            None => Err(Error::NotFound(format!("capsule '{capsule_id}'"))),
        }
    }

    pub fn update_capsule(&self, capsule: &Capsule) -> Result<()> {
        let key = capsule.id.to_string();
        let value = serde_json::to_vec(capsule).map_err(map_internal!("serialize"))?;
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        {
            let mut table = txn.open_table(CAPSULES).map_err(map_internal!("table"))?;
            let exists = table
                .get(key.as_str())
                .map_err(map_internal!("read"))?
                .is_some();
            if !exists {
                return Err(Error::NotFound(format!("capsule '{}'", capsule.id)));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_internal!("write"))?;
        }
        txn.commit().map_err(map_internal!("transaction"))?;
        Ok(())
    }

    pub fn list_capsules(&self) -> Result<Vec<Capsule>> {
        let txn = self.db.begin_read().map_err(map_internal!("transaction"))?;
        let table = txn.open_table(CAPSULES).map_err(map_internal!("table"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_internal!("read"))? {
            let (_, value) = entry.map_err(map_internal!("read"))?;
            let capsule: Capsule =
                serde_json::from_slice(value.value()).map_err(map_internal!("deserialize"))?;
            results.push(capsule);
        }
        Ok(results)
    }

    // ── Builds ─────────────────────────────────────────────────────

    pub fn create_build(&self, capsule_id: CapsuleId, build: &Build) -> Result<()> {
        let key = build_key(capsule_id, &build.id);
        let value = serde_json::to_vec(build).map_err(map_internal!("serialize"))?;
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        {
            let mut table = txn.open_table(BUILDS).map_err(map_internal!("table"))?;
            let exists = table
                .get(key.as_str())
                .map_err(map_internal!("read"))?
                .is_some();
            if exists {
                return Err(Error::AlreadyExists(format!("build '{}'", build.id)));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_internal!("write"))?;
        }
        txn.commit().map_err(map_internal!("transaction"))?;
        Ok(())
    }

    pub fn get_build_record(&self, capsule_id: CapsuleId, build_id: &str) -> Result<Build> {
        let txn = self.db.begin_read().map_err(map_internal!("transaction"))?;
        let table = txn.open_table(BUILDS).map_err(map_internal!("table"))?;
        match table
            .get(build_key(capsule_id, build_id).as_str())
            .map_err(map_internal!("read"))?
        {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_internal!("deserialize"))
            }
            None => Err(Error::NotFound(format!("build '{build_id}'"))),
        }
    }

    /// Remove a build registration. Returns true if it existed.
    pub fn delete_build(&self, capsule_id: CapsuleId, build_id: &str) -> Result<bool> {
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        let existed;
        {
            let mut table = txn.open_table(BUILDS).map_err(map_internal!("table"))?;
            existed = table
                .remove(build_key(capsule_id, build_id).as_str())
                .map_err(map_internal!("write"))?
                .is_some();
        }
        txn.commit().map_err(map_internal!("transaction"))?;
        Ok(existed)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Persist a new rollout with the next per-capsule rollout id.
    ///
    /// Id assignment and the insert happen in one write transaction, so
    /// ids stay dense and monotonic under concurrent callers.
    pub fn create_rollout_record(
        &self,
        capsule_id: CapsuleId,
        config: &RolloutConfig,
        status: &RolloutStatus,
    ) -> Result<RolloutId> {
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        let rollout_id;
        {
            let capsules = txn.open_table(CAPSULES).map_err(map_internal!("table"))?;
            let project_id = match capsules
                .get(capsule_id.to_string().as_str())
                .map_err(map_internal!("read"))?
            {
                Some(guard) => {
                    let capsule: Capsule = serde_json::from_slice(guard.value())
                        .map_err(map_internal!("deserialize"))?;
                    capsule.project_id
                }
                None => return Err(Error::NotFound(format!("capsule '{capsule_id}'"))),
            };
            drop(capsules);

            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_internal!("table"))?;
            rollout_id = last_rollout_id(&rollouts, capsule_id)? + 1;

            let record = RolloutRecord {
                project_id,
                config: config.clone(),
                status: status.clone(),
                version: 1,
            };
            let value = serde_json::to_vec(&record).map_err(map_internal!("serialize"))?;
            rollouts
                .insert(rollout_key(capsule_id, rollout_id).as_str(), value.as_slice())
                .map_err(map_internal!("write"))?;
        }
        txn.commit().map_err(map_internal!("transaction"))?;
        debug!(%capsule_id, rollout_id, "rollout created");
        Ok(rollout_id)
    }

    pub fn get_rollout_record(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
    ) -> Result<(RolloutConfig, RolloutStatus, u64)> {
        let txn = self.db.begin_read().map_err(map_internal!("transaction"))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_internal!("table"))?;
        match table
            .get(rollout_key(capsule_id, rollout_id).as_str())
            .map_err(map_internal!("read"))?
        {
            Some(guard) => {
                let record: RolloutRecord = serde_json::from_slice(guard.value())
                    .map_err(map_internal!("deserialize"))?;
                Ok((record.config, record.status, record.version))
            }
            None => Err(Error::NotFound(format!("rollout '{rollout_id}'"))),
        }
    }

    /// Compare-and-set write of a rollout status.
    ///
    /// Rejects with [`Error::StaleVersion`] when `version` no longer
    /// matches the stored record; bumps the version on success.
    pub fn update_rollout_status_record(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
        version: u64,
        status: &RolloutStatus,
    ) -> Result<()> {
        let key = rollout_key(capsule_id, rollout_id);
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_internal!("table"))?;
            let mut record: RolloutRecord = match table
                .get(key.as_str())
                .map_err(map_internal!("read"))?
            {
                Some(guard) => serde_json::from_slice(guard.value())
                    .map_err(map_internal!("deserialize"))?,
                None => return Err(Error::NotFound(format!("rollout '{rollout_id}'"))),
            };

            if record.version != version {
                return Err(Error::StaleVersion(format!(
                    "rollout '{rollout_id}' status is at version {}, write expected {version}",
                    record.version
                )));
            }

            record.status = status.clone();
            record.version += 1;
            let value = serde_json::to_vec(&record).map_err(map_internal!("serialize"))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_internal!("write"))?;
        }
        txn.commit().map_err(map_internal!("transaction"))?;
        Ok(())
    }

    /// Every rollout whose status still carries a `scheduled_at`.
    pub fn active_rollout_records(&self, page: &Pagination) -> Result<Vec<ActiveRollout>> {
        let txn = self.db.begin_read().map_err(map_internal!("transaction"))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_internal!("table"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_internal!("read"))? {
            let (key, value) = entry.map_err(map_internal!("read"))?;
            let record: RolloutRecord =
                serde_json::from_slice(value.value()).map_err(map_internal!("deserialize"))?;
            let Some(scheduled_at) = record.status.scheduled_at else {
                continue;
            };
            let (capsule_id, rollout_id) = parse_rollout_key(key.value())?;
            results.push(ActiveRollout {
                project_id: record.project_id,
                capsule_id,
                rollout_id,
                scheduled_at,
            });
        }

        let offset = usize::try_from(page.offset).unwrap_or(usize::MAX);
        let mut window: Vec<ActiveRollout> = results.into_iter().skip(offset).collect();
        if let Some(limit) = page.limit {
            window.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(window)
    }

    // ── Events ─────────────────────────────────────────────────────

    pub fn append_event(&self, event: &Event) -> Result<()> {
        let value = serde_json::to_vec(event).map_err(map_internal!("serialize"))?;
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_internal!("table"))?;
            let prefix = format!("{}:{:020}:", event.capsule_id, event.rollout_id);
            let mut seq: u64 = 0;
            for entry in table.iter().map_err(map_internal!("read"))? {
                let (key, _) = entry.map_err(map_internal!("read"))?;
                if key.value().starts_with(&prefix) {
                    seq += 1;
                }
            }
            table
                .insert(
                    event_key(event.capsule_id, event.rollout_id, seq).as_str(),
                    value.as_slice(),
                )
                .map_err(map_internal!("write"))?;
        }
        txn.commit().map_err(map_internal!("transaction"))?;
        Ok(())
    }

    pub fn list_events(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
    ) -> Result<Vec<Event>> {
        let prefix = format!("{capsule_id}:{rollout_id:020}:");
        let txn = self.db.begin_read().map_err(map_internal!("transaction"))?;
        let table = txn.open_table(EVENTS).map_err(map_internal!("table"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_internal!("read"))? {
            let (key, value) = entry.map_err(map_internal!("read"))?;
            if key.value().starts_with(&prefix) {
                let event: Event =
                    serde_json::from_slice(value.value()).map_err(map_internal!("deserialize"))?;
                results.push(event);
            }
        }
        Ok(results)
    }

    // ── Secrets ────────────────────────────────────────────────────

    pub fn create_secret(&self, secret_id: Uuid, value: &[u8]) -> Result<()> {
        let key = secret_id.to_string();
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_internal!("table"))?;
            let exists = table
                .get(key.as_str())
                .map_err(map_internal!("read"))?
                .is_some();
            if exists {
                return Err(Error::AlreadyExists(format!("secret '{secret_id}'")));
            }
            table
                .insert(key.as_str(), value)
                .map_err(map_internal!("write"))?;
        }
        txn.commit().map_err(map_internal!("transaction"))?;
        Ok(())
    }

    pub fn get_secret(&self, secret_id: Uuid) -> Result<Vec<u8>> {
        let txn = self.db.begin_read().map_err(map_internal!("transaction"))?;
        let table = txn.open_table(SECRETS).map_err(map_internal!("table"))?;
        match table
            .get(secret_id.to_string().as_str())
            .map_err(map_internal!("read"))?
        {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(Error::NotFound(format!("secret '{secret_id}'"))),
        }
    }

    pub fn delete_secret(&self, secret_id: Uuid) -> Result<()> {
        let txn = self.db.begin_write().map_err(map_internal!("transaction"))?;
        let existed;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_internal!("table"))?;
            existed = table
                .remove(secret_id.to_string().as_str())
                .map_err(map_internal!("write"))?
                .is_some();
        }
        txn.commit().map_err(map_internal!("transaction"))?;
        if !existed {
            return Err(Error::NotFound(format!("secret '{secret_id}'")));
        }
        Ok(())
    }
}

/// Highest rollout id already assigned for a capsule, or 0.
fn last_rollout_id(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    capsule_id: CapsuleId,
) -> Result<RolloutId> {
    let prefix = format!("{capsule_id}:");
    let mut last = 0;
    for entry in table.iter().map_err(map_internal!("read"))? {
        let (key, _) = entry.map_err(map_internal!("read"))?;
        if key.value().starts_with(&prefix) {
            let (_, rollout_id) = parse_rollout_key(key.value())?;
            last = last.max(rollout_id);
        }
    }
    Ok(last)
}

fn parse_rollout_key(key: &str) -> Result<(CapsuleId, RolloutId)> {
    let (capsule, rollout) = key
        .split_once(':')
        .ok_or_else(|| Error::Internal(format!("malformed rollout key '{key}'")))?;
    let capsule_id = Uuid::parse_str(capsule)
        .map_err(|e| Error::Internal(format!("malformed rollout key '{key}': {e}")))?;
    let rollout_id = rollout
        .parse::<u64>()
        .map_err(|e| Error::Internal(format!("malformed rollout key '{key}': {e}")))?;
    Ok((capsule_id, rollout_id))
}

// ── Contract implementations ───────────────────────────────────────

#[async_trait::async_trait]
impl CapsuleRepository for Store {
    async fn get(&self, capsule_id: CapsuleId) -> Result<Capsule> {
        self.get_capsule(capsule_id)
    }

    async fn update(&self, capsule: &Capsule) -> Result<()> {
        self.update_capsule(capsule)
    }

    async fn get_build(&self, capsule_id: CapsuleId, build_id: &str) -> Result<Build> {
        self.get_build_record(capsule_id, build_id)
    }

    async fn create_rollout(
        &self,
        capsule_id: CapsuleId,
        config: &RolloutConfig,
        status: &RolloutStatus,
    ) -> Result<RolloutId> {
        self.create_rollout_record(capsule_id, config, status)
    }

    async fn get_rollout(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
    ) -> Result<(RolloutConfig, RolloutStatus, u64)> {
        self.get_rollout_record(capsule_id, rollout_id)
    }

    async fn update_rollout_status(
        &self,
        capsule_id: CapsuleId,
        rollout_id: RolloutId,
        version: u64,
        status: &RolloutStatus,
    ) -> Result<()> {
        self.update_rollout_status_record(capsule_id, rollout_id, version, status)
    }

    async fn active_rollouts(&self, page: &Pagination) -> Result<Vec<ActiveRollout>> {
        self.active_rollout_records(page)
    }
}

#[async_trait::async_trait]
impl SecretStore for Store {
    async fn create(&self, secret_id: Uuid, value: &[u8]) -> Result<()> {
        self.create_secret(secret_id, value)
    }

    async fn get(&self, secret_id: Uuid) -> Result<Vec<u8>> {
        self.get_secret(secret_id)
    }

    async fn delete(&self, secret_id: Uuid) -> Result<()> {
        self.delete_secret(secret_id)
    }
}

#[async_trait::async_trait]
impl EventLog for Store {
    async fn append(&self, event: &Event) -> Result<()> {
        self.append_event(event)
    }

    async fn list(&self, capsule_id: CapsuleId, rollout_id: RolloutId) -> Result<Vec<Event>> {
        self.list_events(capsule_id, rollout_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::{EventKind, RolloutState};
    use chrono::Utc;

    fn test_capsule(name: &str) -> Capsule {
        Capsule {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: name.to_string(),
            current_rollout: 0,
        }
    }

    fn test_status(state: RolloutState) -> RolloutStatus {
        RolloutStatus {
            state,
            message: String::new(),
            updated_at: Utc::now(),
            scheduled_at: Some(Utc::now()),
            rig_service_account: None,
        }
    }

    // ── Capsule CRUD ───────────────────────────────────────────────

    #[test]
    fn capsule_create_and_get() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");

        store.create_capsule(&capsule).unwrap();
        let retrieved = store.get_capsule(capsule.id).unwrap();

        assert_eq!(retrieved, capsule);
    }

    #[test]
    fn capsule_get_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.get_capsule(Uuid::new_v4()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn capsule_duplicate_create_rejected() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();

        let err = store.create_capsule(&capsule).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn capsule_update_advances_current_rollout() {
        let store = Store::open_in_memory().unwrap();
        let mut capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();

        capsule.current_rollout = 4;
        store.update_capsule(&capsule).unwrap();

        assert_eq!(store.get_capsule(capsule.id).unwrap().current_rollout, 4);
    }

    #[test]
    fn capsule_update_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.update_capsule(&test_capsule("ghost")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn capsule_list_all() {
        let store = Store::open_in_memory().unwrap();
        store.create_capsule(&test_capsule("a")).unwrap();
        store.create_capsule(&test_capsule("b")).unwrap();

        assert_eq!(store.list_capsules().unwrap().len(), 2);
    }

    // ── Builds ─────────────────────────────────────────────────────

    #[test]
    fn build_create_and_get() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();

        let build = Build {
            id: "b1".to_string(),
            image: "registry.example.com/api:1.4".to_string(),
            created_at: Utc::now(),
        };
        store.create_build(capsule.id, &build).unwrap();

        assert_eq!(store.get_build_record(capsule.id, "b1").unwrap(), build);
        assert!(store
            .get_build_record(capsule.id, "b2")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn build_delete() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();
        store
            .create_build(
                capsule.id,
                &Build {
                    id: "b1".to_string(),
                    image: "img".to_string(),
                    created_at: Utc::now(),
                },
            )
            .unwrap();

        assert!(store.delete_build(capsule.id, "b1").unwrap());
        assert!(!store.delete_build(capsule.id, "b1").unwrap());
        assert!(store.get_build_record(capsule.id, "b1").unwrap_err().is_not_found());
    }

    #[test]
    fn build_scoped_per_capsule() {
        let store = Store::open_in_memory().unwrap();
        let a = test_capsule("a");
        let b = test_capsule("b");
        store.create_capsule(&a).unwrap();
        store.create_capsule(&b).unwrap();

        let build = Build {
            id: "b1".to_string(),
            image: "img".to_string(),
            created_at: Utc::now(),
        };
        store.create_build(a.id, &build).unwrap();

        assert!(store.get_build_record(b.id, "b1").unwrap_err().is_not_found());
    }

    // ── Rollouts ───────────────────────────────────────────────────

    #[test]
    fn rollout_ids_are_monotonic_per_capsule() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();

        let config = RolloutConfig::default();
        let first = store
            .create_rollout_record(capsule.id, &config, &test_status(RolloutState::Pending))
            .unwrap();
        let second = store
            .create_rollout_record(capsule.id, &config, &test_status(RolloutState::Pending))
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let other = test_capsule("other");
        store.create_capsule(&other).unwrap();
        let third = store
            .create_rollout_record(other.id, &config, &test_status(RolloutState::Pending))
            .unwrap();
        assert_eq!(third, 1);
    }

    #[test]
    fn rollout_create_requires_capsule() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .create_rollout_record(
                Uuid::new_v4(),
                &RolloutConfig::default(),
                &test_status(RolloutState::Pending),
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn status_update_bumps_version() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();
        let id = store
            .create_rollout_record(
                capsule.id,
                &RolloutConfig::default(),
                &test_status(RolloutState::Pending),
            )
            .unwrap();

        let (_, status, version) = store.get_rollout_record(capsule.id, id).unwrap();
        assert_eq!(version, 1);

        let mut next = status.clone();
        next.state = RolloutState::Preparing;
        store
            .update_rollout_status_record(capsule.id, id, version, &next)
            .unwrap();

        let (_, stored, version) = store.get_rollout_record(capsule.id, id).unwrap();
        assert_eq!(stored.state, RolloutState::Preparing);
        assert_eq!(version, 2);
    }

    #[test]
    fn stale_status_write_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();
        let id = store
            .create_rollout_record(
                capsule.id,
                &RolloutConfig::default(),
                &test_status(RolloutState::Pending),
            )
            .unwrap();

        let (_, status, version) = store.get_rollout_record(capsule.id, id).unwrap();

        // Two writers read the same version; exactly one wins.
        let mut a = status.clone();
        a.state = RolloutState::Preparing;
        let mut b = status.clone();
        b.state = RolloutState::Aborted;
        b.scheduled_at = None;

        store
            .update_rollout_status_record(capsule.id, id, version, &a)
            .unwrap();
        let err = store
            .update_rollout_status_record(capsule.id, id, version, &b)
            .unwrap_err();
        assert!(err.is_stale_version());

        let (_, stored, _) = store.get_rollout_record(capsule.id, id).unwrap();
        assert_eq!(stored.state, RolloutState::Preparing);
    }

    #[test]
    fn config_changes_round_trip_bit_identical() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();

        let config = RolloutConfig {
            replicas: 2,
            build_id: "b1".to_string(),
            changes: vec![
                capstan_core::Change::Replicas(2),
                capstan_core::Change::BuildId("b1".to_string()),
                capstan_core::Change::AutoAddRigServiceAccounts(true),
            ],
            auto_add_rig_service_accounts: true,
            created_at: Utc::now(),
            ..Default::default()
        };

        let id = store
            .create_rollout_record(capsule.id, &config, &test_status(RolloutState::Pending))
            .unwrap();
        let (stored, _, _) = store.get_rollout_record(capsule.id, id).unwrap();

        assert_eq!(stored.changes, config.changes);
        assert_eq!(stored, config);
    }

    // ── Active rollouts ────────────────────────────────────────────

    #[test]
    fn active_rollouts_filters_unscheduled() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();

        let scheduled = store
            .create_rollout_record(
                capsule.id,
                &RolloutConfig::default(),
                &test_status(RolloutState::Pending),
            )
            .unwrap();

        let mut done = test_status(RolloutState::Done);
        done.scheduled_at = None;
        store
            .create_rollout_record(capsule.id, &RolloutConfig::default(), &done)
            .unwrap();

        let active = store.active_rollout_records(&Pagination::default()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rollout_id, scheduled);
        assert_eq!(active[0].capsule_id, capsule.id);
        assert_eq!(active[0].project_id, capsule.project_id);
    }

    #[test]
    fn active_rollouts_pagination_window() {
        let store = Store::open_in_memory().unwrap();
        let capsule = test_capsule("api");
        store.create_capsule(&capsule).unwrap();
        for _ in 0..5 {
            store
                .create_rollout_record(
                    capsule.id,
                    &RolloutConfig::default(),
                    &test_status(RolloutState::Pending),
                )
                .unwrap();
        }

        let page = Pagination {
            offset: 1,
            limit: Some(2),
        };
        let window = store.active_rollout_records(&page).unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].rollout_id, 2);
        assert_eq!(window[1].rollout_id, 3);
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn events_keep_insertion_order() {
        let store = Store::open_in_memory().unwrap();
        let capsule_id = Uuid::new_v4();

        for (i, message) in ["new rollout initiated", "configuring cluster resources"]
            .iter()
            .enumerate()
        {
            store
                .append_event(&Event {
                    capsule_id,
                    rollout_id: 1,
                    message: (*message).to_string(),
                    kind: EventKind::Rollout,
                    created_at: Utc::now() + chrono::Duration::seconds(i as i64),
                })
                .unwrap();
        }

        let events = store.list_events(capsule_id, 1).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "new rollout initiated");
        assert_eq!(events[1].message, "configuring cluster resources");
    }

    #[test]
    fn events_scoped_per_rollout() {
        let store = Store::open_in_memory().unwrap();
        let capsule_id = Uuid::new_v4();
        let event = |rollout_id: u64| Event {
            capsule_id,
            rollout_id,
            message: "m".to_string(),
            kind: EventKind::Rollout,
            created_at: Utc::now(),
        };
        store.append_event(&event(1)).unwrap();
        store.append_event(&event(2)).unwrap();

        assert_eq!(store.list_events(capsule_id, 1).unwrap().len(), 1);
        assert_eq!(store.list_events(capsule_id, 2).unwrap().len(), 1);
        assert!(store.list_events(capsule_id, 3).unwrap().is_empty());
    }

    // ── Secrets ────────────────────────────────────────────────────

    #[test]
    fn secret_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::new_v4();

        store.create_secret(id, b"hunter2").unwrap();
        assert_eq!(store.get_secret(id).unwrap(), b"hunter2");

        assert!(store.create_secret(id, b"other").unwrap_err().is_already_exists());

        store.delete_secret(id).unwrap();
        assert!(store.get_secret(id).unwrap_err().is_not_found());
        assert!(store.delete_secret(id).unwrap_err().is_not_found());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("capstan.redb");
        let capsule = test_capsule("api");

        {
            let store = Store::open(&db_path).unwrap();
            store.create_capsule(&capsule).unwrap();
            store
                .create_rollout_record(
                    capsule.id,
                    &RolloutConfig::default(),
                    &test_status(RolloutState::Pending),
                )
                .unwrap();
        }

        let store = Store::open(&db_path).unwrap();
        assert_eq!(store.get_capsule(capsule.id).unwrap().name, "api");
        let (_, status, version) = store.get_rollout_record(capsule.id, 1).unwrap();
        assert_eq!(status.state, RolloutState::Pending);
        assert_eq!(version, 1);
    }
}
