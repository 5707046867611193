//! The job queue proper.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::trace;

use capstan_core::{CapsuleId, Clock, Error, ProjectId, Result, RolloutId};

/// One unit of rollout work: run a single FSM turn for this rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub project_id: ProjectId,
    pub capsule_id: CapsuleId,
    pub rollout_id: RolloutId,
}

/// Queue identity of a job. One entry per rollout; re-adding replaces the
/// due time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct JobKey {
    capsule_id: CapsuleId,
    rollout_id: RolloutId,
}

impl JobKey {
    fn of(job: &Job) -> Self {
        Self {
            capsule_id: job.capsule_id,
            rollout_id: job.rollout_id,
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Entries ordered by due time. `(due_at, key)` is unique because
    /// `due_by_key` guarantees one entry per key.
    by_due: BTreeMap<(DateTime<Utc>, JobKey), Job>,
    due_by_key: HashMap<JobKey, DateTime<Utc>>,
}

/// Time-ordered, single-consumer queue of rollout jobs.
///
/// `add_job` is idempotent per `(capsule_id, rollout_id)`; [`JobQueue::next`]
/// blocks until the earliest entry is due and removes it atomically.
#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `job` for `due_at`, replacing any existing entry for the
    /// same rollout.
    pub fn add_job(&self, job: Job, due_at: DateTime<Utc>) {
        let key = JobKey::of(&job);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(prev) = inner.due_by_key.insert(key.clone(), due_at) {
                inner.by_due.remove(&(prev, key.clone()));
            }
            inner.by_due.insert((due_at, key), job);
        }
        // Stores a permit when no consumer is parked, so a racing `next`
        // observes the new entry.
        self.notify.notify_one();
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Due time of a queued rollout, if present.
    pub fn due_at(&self, capsule_id: CapsuleId, rollout_id: RolloutId) -> Option<DateTime<Utc>> {
        let key = JobKey {
            capsule_id,
            rollout_id,
        };
        self.inner.lock().unwrap().due_by_key.get(&key).copied()
    }

    /// Block until the earliest-due job is due, then remove and return it.
    ///
    /// Returns [`Error::Internal`] once `shutdown` flips to true (or its
    /// sender goes away).
    pub async fn next(
        &self,
        clock: &dyn Clock,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Job> {
        loop {
            if *shutdown.borrow() {
                return Err(Error::Internal("job queue interrupted".to_string()));
            }

            let now = clock.now();
            let wait = {
                let mut inner = self.inner.lock().unwrap();
                let earliest = inner.by_due.first_key_value().map(|((due_at, _), _)| *due_at);
                match earliest {
                    Some(due_at) if due_at <= now => {
                        let ((_, key), job) = inner.by_due.pop_first().unwrap();
                        inner.due_by_key.remove(&key);
                        trace!(capsule_id = %job.capsule_id, rollout_id = job.rollout_id, "job due");
                        return Ok(job);
                    }
                    Some(due_at) => Some((due_at - now).to_std().unwrap_or_default()),
                    None => None,
                }
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.notify.notified() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                // Sender gone; nobody can wake us again.
                                return Err(Error::Internal("job queue interrupted".to_string()));
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return Err(Error::Internal("job queue interrupted".to_string()));
                            }
                        }
                    }
                }
            }
        }
    }
}
