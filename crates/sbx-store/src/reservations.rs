use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::StoreError;

/// Team-scoped ledger of starts that are still in flight. A reservation is
/// held from admission until the sandbox record lands in the store (or the
/// start fails) and counts toward the team's quota either way.
pub struct ReservationGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    teams: Mutex<HashMap<Uuid, HashSet<String>>>,
}

impl ReservationGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                teams: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Reservations currently held for a team.
    pub fn count(&self, team_id: Uuid) -> usize {
        self.inner
            .teams
            .lock()
            .get(&team_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Admits one start against `limit`. `running` is the set of sandbox ids
    /// the store already tracks for the team; the union defends against a
    /// start that finished (reservation released, record inserted) between
    /// two attempts with the same id. A negative limit admits unconditionally.
    ///
    /// The caller must hold the store's admission mutex so the count and the
    /// insert are one atomic step.
    pub(crate) fn reserve(
        &self,
        sandbox_id: &str,
        team_id: Uuid,
        limit: i64,
        running: &HashSet<String>,
    ) -> Result<Reservation, StoreError> {
        let mut teams = self.inner.teams.lock();
        let entry = teams.entry(team_id).or_default();

        if entry.contains(sandbox_id) || running.contains(sandbox_id) {
            return Err(StoreError::AlreadyBeingStarted(sandbox_id.to_string()));
        }

        if limit >= 0 {
            let in_flight_or_running = entry.union(running).count();
            if in_flight_or_running as i64 >= limit {
                return Err(StoreError::LimitExceeded { team_id });
            }
        }

        entry.insert(sandbox_id.to_string());
        Ok(Reservation {
            gate: Arc::clone(&self.inner),
            team_id,
            sandbox_id: sandbox_id.to_string(),
            released: AtomicBool::new(false),
        })
    }
}

impl Default for ReservationGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle surrendering one admission slot. `release` is idempotent and also
/// runs on drop, so every exit path gives the slot back.
pub struct Reservation {
    gate: Arc<GateInner>,
    team_id: Uuid,
    sandbox_id: String,
    released: AtomicBool,
}

impl Reservation {
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut teams = self.gate.teams.lock();
        if let Some(entry) = teams.get_mut(&self.team_id) {
            entry.remove(&self.sandbox_id);
            if entry.is_empty() {
                teams.remove(&self.team_id);
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}
