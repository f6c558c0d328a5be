use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{Expirable, LifecycleCache};
use crate::error::StoreError;
use crate::reservations::{Reservation, ReservationGate};
use crate::sandbox::{RemoveAction, Removal, Sandbox};

// FIXME: expose the sync grace period as configuration instead of a constant.
const SYNC_GRACE_SECONDS: i64 = 10;

/// Side effects fired when a sandbox record enters the store.
#[async_trait]
pub trait StoreHooks: Send + Sync + 'static {
    /// Runs inline; `add` does not return until the routing table knows the
    /// sandbox.
    fn on_insert(&self, sandbox: &Sandbox);
    /// Runs in the background after every insert (gauges, counters).
    async fn on_insert_background(&self, sandbox: Sandbox);
    /// Runs in the background only for newly created sandboxes (analytics).
    async fn on_created(&self, sandbox: Sandbox);
}

/// Drives teardown of an expired sandbox on its worker node. Invoked by the
/// eviction loop; implementations route through `start_removing` so request
/// paths and eviction share one transition gate.
#[async_trait]
pub trait SandboxRemover: Send + Sync + 'static {
    async fn remove(&self, sandbox: Sandbox);
}

/// Admission and query facade over the sandbox cache, the reservation gate
/// and the per-record state machines.
pub struct SandboxStore {
    cache: Arc<LifecycleCache<Sandbox>>,
    gate: ReservationGate,
    admission: Mutex<()>,
    hooks: Arc<dyn StoreHooks>,
}

impl SandboxStore {
    pub fn new(hooks: Arc<dyn StoreHooks>) -> Arc<Self> {
        Arc::new(Self {
            cache: LifecycleCache::new(),
            gate: ReservationGate::new(),
            admission: Mutex::new(()),
            hooks,
        })
    }

    /// Spawns the eviction loop feeding expired sandboxes to `remover`.
    pub fn start_eviction(
        self: &Arc<Self>,
        cancel: CancellationToken,
        remover: Arc<dyn SandboxRemover>,
    ) -> JoinHandle<()> {
        self.cache.start_eviction(cancel, move |_key, sandbox| {
            let remover = Arc::clone(&remover);
            async move {
                remover.remove(sandbox).await;
            }
        })
    }

    /// Claims an admission slot for a start-in-flight. The count of
    /// reservations plus live sandboxes for the team is compared against
    /// `limit` atomically under the admission mutex.
    pub fn reserve(
        &self,
        sandbox_id: &str,
        team_id: Uuid,
        limit: i64,
    ) -> Result<Reservation, StoreError> {
        let _admission = self.admission.lock();
        let running: HashSet<String> = self
            .cache
            .items()
            .into_iter()
            .filter(|sandbox| sandbox.team_id() == team_id)
            .map(|sandbox| sandbox.sandbox_id().to_string())
            .collect();
        self.gate.reserve(sandbox_id, team_id, limit, &running)
    }

    /// Inserts a sandbox record. Validates the record, clamps its end time to
    /// the instance length limit, and fires the insert hooks. Re-inserting an
    /// existing key (a reconciliation race) is not an error; only the
    /// newly-created hook still applies.
    pub fn add(&self, sandbox: Sandbox, newly_created: bool) -> Result<(), StoreError> {
        validate(&sandbox)?;
        sandbox.clamp_end_time();

        let inserted = self
            .cache
            .set_if_absent(sandbox.sandbox_id().to_string(), sandbox.clone());

        if inserted {
            self.hooks.on_insert(&sandbox);
            let hooks = Arc::clone(&self.hooks);
            let background = sandbox.clone();
            tokio::spawn(async move {
                hooks.on_insert_background(background).await;
            });
        } else {
            debug!(sandbox_id = %sandbox.sandbox_id(), "sandbox already present, skipping insert hooks");
        }

        if newly_created {
            let hooks = Arc::clone(&self.hooks);
            let created = sandbox;
            tokio::spawn(async move {
                hooks.on_created(created).await;
            });
        }

        Ok(())
    }

    pub fn get(&self, sandbox_id: &str, include_evicting: bool) -> Result<Sandbox, StoreError> {
        self.cache
            .get(sandbox_id, include_evicting)
            .ok_or_else(|| StoreError::NotFound(sandbox_id.to_string()))
    }

    /// Requests a pause or kill. Removal paths and eviction both come through
    /// here; the record's transition gate serializes them.
    pub async fn start_removing(
        &self,
        cancel: &CancellationToken,
        sandbox_id: &str,
        action: RemoveAction,
    ) -> Result<Removal, StoreError> {
        // mid-eviction records are still transitionable (kill after pause)
        let sandbox = self.get(sandbox_id, true)?;
        sandbox.start_removing(cancel, action).await
    }

    pub async fn wait_for_state_change(
        &self,
        cancel: &CancellationToken,
        sandbox_id: &str,
    ) -> Result<(), StoreError> {
        let sandbox = self.get(sandbox_id, true)?;
        sandbox.wait_for_state_change(cancel).await
    }

    /// Moves a sandbox's end time; see [`Sandbox::extend_end_time`] for the
    /// shrink/cap rules. Returns the effective end time.
    pub fn extend_end_time(
        &self,
        sandbox_id: &str,
        new_end: DateTime<Utc>,
        allow_shorter: bool,
    ) -> Result<DateTime<Utc>, StoreError> {
        let sandbox = self.get(sandbox_id, false)?;
        Ok(sandbox.extend_end_time(new_end, allow_shorter))
    }

    /// Live sandboxes, optionally filtered to one team. Expired and
    /// mid-eviction records are excluded.
    pub fn items(&self, team_id: Option<Uuid>) -> Vec<Sandbox> {
        self.cache
            .items()
            .into_iter()
            .filter(|sandbox| team_id.map_or(true, |team| sandbox.team_id() == team))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Reconciles the store against the set of sandboxes a node reports it is
    /// actually running. Records missing from the report are marked expired
    /// (the eviction loop collects them); reported records the store has
    /// never seen are inserted as pre-existing. Both directions skip records
    /// younger than the grace period so a sandbox started moments ago is not
    /// torn down before the node's next heartbeat can observe it.
    pub fn sync(&self, node_id: &str, reported: Vec<Sandbox>) {
        let now = Utc::now();
        let grace = Duration::seconds(SYNC_GRACE_SECONDS);

        let reported_ids: HashSet<&str> = reported
            .iter()
            .map(|sandbox| sandbox.sandbox_id())
            .collect();

        for sandbox in self.cache.items() {
            if sandbox.node_id() != node_id {
                continue;
            }
            if reported_ids.contains(sandbox.sandbox_id()) {
                continue;
            }
            if now.signed_duration_since(sandbox.start_time()) <= grace {
                continue;
            }
            warn!(
                sandbox_id = %sandbox.sandbox_id(),
                node_id,
                "sandbox missing from node report, expiring"
            );
            sandbox.mark_expired();
        }

        for sandbox in reported {
            if now.signed_duration_since(sandbox.start_time()) <= grace {
                continue;
            }
            if self.cache.has(sandbox.sandbox_id(), true) {
                continue;
            }
            let sandbox_id = sandbox.sandbox_id().to_string();
            if let Err(error) = self.add(sandbox, false) {
                warn!(sandbox_id = %sandbox_id, %error, "rejecting reported sandbox");
            }
        }
    }
}

fn validate(sandbox: &Sandbox) -> Result<(), StoreError> {
    let spec = sandbox.spec();
    let required = [
        ("sandbox_id", spec.sandbox_id.as_str()),
        ("template_id", spec.template_id.as_str()),
        ("node_id", spec.node_id.as_str()),
        ("client_id", spec.client_id.as_str()),
    ];
    for (field, value) in required {
        if value.is_empty() {
            return Err(StoreError::InvalidSandbox(format!("{field} is empty")));
        }
    }
    if spec.team_id.is_nil() {
        return Err(StoreError::InvalidSandbox("team_id is empty".to_string()));
    }
    if sandbox.end_time() < sandbox.start_time() {
        return Err(StoreError::InvalidSandbox(
            "end_time precedes start_time".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::sandbox::test_support;

    #[derive(Default)]
    struct CountingHooks {
        inserts: AtomicUsize,
        background: AtomicUsize,
        created: AtomicUsize,
    }

    #[async_trait]
    impl StoreHooks for CountingHooks {
        fn on_insert(&self, _sandbox: &Sandbox) {
            self.inserts.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_insert_background(&self, _sandbox: Sandbox) {
            self.background.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_created(&self, _sandbox: Sandbox) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn store_with_hooks() -> (Arc<SandboxStore>, Arc<CountingHooks>) {
        let hooks = Arc::new(CountingHooks::default());
        (SandboxStore::new(hooks.clone()), hooks)
    }

    fn sandbox(id: &str, team: Uuid) -> Sandbox {
        let now = Utc::now();
        Sandbox::running(test_support::spec(id, team), now, now + Duration::hours(1))
    }

    #[tokio::test]
    async fn add_fires_hooks_in_order() {
        let (store, hooks) = store_with_hooks();
        let team = Uuid::new_v4();

        store.add(sandbox("sbx-1", team), true).unwrap();
        // the routing hook is synchronous
        assert_eq!(hooks.inserts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hooks.background.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_add_only_replays_created_hook() {
        let (store, hooks) = store_with_hooks();
        let team = Uuid::new_v4();

        store.add(sandbox("sbx-1", team), false).unwrap();
        store.add(sandbox("sbx-1", team), true).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hooks.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.background.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_rejects_incomplete_records() {
        let (store, _) = store_with_hooks();
        let team = Uuid::new_v4();

        let mut spec = test_support::spec("", team);
        spec.sandbox_id = String::new();
        let now = Utc::now();
        let bad = Sandbox::running(spec, now, now + Duration::hours(1));
        assert!(matches!(
            store.add(bad, true),
            Err(StoreError::InvalidSandbox(_))
        ));
    }

    #[tokio::test]
    async fn get_distinguishes_missing_from_found() {
        let (store, _) = store_with_hooks();
        let team = Uuid::new_v4();

        store.add(sandbox("sbx-1", team), false).unwrap();
        assert!(store.get("sbx-1", false).is_ok());
        assert!(matches!(
            store.get("sbx-2", false),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn items_filters_by_team() {
        let (store, _) = store_with_hooks();
        let team_a = Uuid::new_v4();
        let team_b = Uuid::new_v4();

        store.add(sandbox("sbx-a1", team_a), false).unwrap();
        store.add(sandbox("sbx-a2", team_a), false).unwrap();
        store.add(sandbox("sbx-b1", team_b), false).unwrap();

        assert_eq!(store.items(None).len(), 3);
        assert_eq!(store.items(Some(team_a)).len(), 2);
        assert_eq!(store.items(Some(team_b)).len(), 1);
    }

    #[tokio::test]
    async fn sync_expires_missing_and_adopts_unknown() {
        let (store, _) = store_with_hooks();
        let team = Uuid::new_v4();

        // a record old enough to be past the grace period
        let old_start = Utc::now() - Duration::seconds(60);
        let stale = Sandbox::running(
            test_support::spec("sbx-stale", team),
            old_start,
            old_start + Duration::hours(1),
        );
        store.add(stale, false).unwrap();

        // node reports a different, equally old sandbox
        let adopted = Sandbox::running(
            test_support::spec("sbx-adopted", team),
            old_start,
            old_start + Duration::hours(1),
        );
        store.sync("node-1", vec![adopted]);

        let stale = store.get("sbx-stale", true).unwrap();
        assert!(stale.is_expired());
        assert!(store.get("sbx-adopted", false).is_ok());
    }

    #[tokio::test]
    async fn sync_spares_recently_started_sandboxes() {
        let (store, _) = store_with_hooks();
        let team = Uuid::new_v4();

        let fresh = sandbox("sbx-fresh", team);
        store.add(fresh, false).unwrap();

        // the node does not know about it yet; the grace period protects it
        store.sync("node-1", Vec::new());
        let fresh = store.get("sbx-fresh", false).unwrap();
        assert!(!fresh.is_expired());

        // a freshly started sandbox in the report is likewise ignored
        store.sync("node-1", vec![sandbox("sbx-new", team)]);
        assert!(store.get("sbx-new", true).is_err());
    }
}
