//! Worker contact information and liveness tracking.

use std::collections::{BTreeMap, BTreeSet};

use czar_common::WorkerId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Where to reach one worker and when the registry last heard from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerContact {
    pub host: String,
    #[serde(default)]
    pub management_host: String,
    pub port: u16,
    pub last_update_time_ms: u64,
}

impl WorkerContact {
    /// `host:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Registry view of every worker's contact record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerContactSnapshot {
    pub workers: BTreeMap<WorkerId, WorkerContact>,
}

impl WorkerContactSnapshot {
    pub fn with_worker(mut self, id: &str, contact: WorkerContact) -> Self {
        self.workers.insert(WorkerId::from(id), contact);
        self
    }
}

#[derive(Debug, Clone)]
struct ContactState {
    contact: WorkerContact,
    alive: bool,
}

/// Current contact info and liveness per worker.
///
/// A worker is dead once its last registry heartbeat is older than `dead_after_ms`, when
/// it disappears from the registry, or when explicitly marked dead after a failed dispatch.
#[derive(Debug)]
pub struct WorkerContactMap {
    dead_after_ms: u64,
    workers: BTreeMap<WorkerId, ContactState>,
}

impl WorkerContactMap {
    pub fn new(dead_after_ms: u64) -> Self {
        Self {
            dead_after_ms,
            workers: BTreeMap::new(),
        }
    }

    /// Merge a registry snapshot taken at `now_ms`.
    ///
    /// Returns the workers that went from alive to dead with this snapshot.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &WorkerContactSnapshot,
        now_ms: u64,
    ) -> Vec<WorkerId> {
        let mut newly_dead = Vec::new();
        let seen: BTreeSet<&WorkerId> = snapshot.workers.keys().collect();

        for (id, state) in self.workers.iter_mut() {
            if !seen.contains(id) && state.alive {
                state.alive = false;
                newly_dead.push(id.clone());
            }
        }

        for (id, contact) in &snapshot.workers {
            let fresh = now_ms.saturating_sub(contact.last_update_time_ms) <= self.dead_after_ms;
            match self.workers.get_mut(id) {
                Some(state) => {
                    if state.alive && !fresh {
                        newly_dead.push(id.clone());
                    } else if !state.alive && fresh {
                        info!(
                            worker_id = %id,
                            operator = "WorkerContactMap",
                            "worker is alive again"
                        );
                    }
                    state.contact = contact.clone();
                    state.alive = fresh;
                }
                None => {
                    self.workers.insert(
                        id.clone(),
                        ContactState {
                            contact: contact.clone(),
                            alive: fresh,
                        },
                    );
                }
            }
        }

        for id in &newly_dead {
            warn!(worker_id = %id, operator = "WorkerContactMap", "worker considered dead");
        }
        newly_dead.sort();
        newly_dead
    }

    /// Contact record of a live worker.
    pub fn contact(&self, id: &WorkerId) -> Option<&WorkerContact> {
        self.workers
            .get(id)
            .filter(|state| state.alive)
            .map(|state| &state.contact)
    }

    pub fn is_alive(&self, id: &WorkerId) -> bool {
        self.workers.get(id).is_some_and(|state| state.alive)
    }

    /// Mark a worker dead until the next fresh registry heartbeat. Returns whether it was alive.
    pub fn mark_dead(&mut self, id: &WorkerId) -> bool {
        match self.workers.get_mut(id) {
            Some(state) if state.alive => {
                state.alive = false;
                warn!(worker_id = %id, operator = "WorkerContactMap", "worker marked dead");
                true
            }
            _ => false,
        }
    }

    pub fn alive_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, state)| state.alive)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
