use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Capability set a pool provides to the periodic two-set diff.
///
/// `Source` items come from ground truth (a database, service discovery);
/// `Item`s are the pool's in-memory members. The engine never mutates the
/// pool itself, it only drives these callbacks.
#[async_trait]
pub trait PoolStore: Send + Sync + 'static {
    type Source: Clone + Send + Sync + 'static;
    type Item: Clone + Send + Sync + 'static;

    /// One authoritative listing of ground truth for this round.
    async fn source_list(&self) -> anyhow::Result<Vec<Self::Source>>;
    /// Whether a pool member is still present in the listed source.
    fn source_contains(&self, source: &[Self::Source], item: &Self::Item) -> bool;
    /// Current pool membership snapshot.
    fn pool_list(&self) -> Vec<Self::Item>;
    /// Whether a source item already has a pool member.
    fn pool_contains(&self, source: &Self::Source) -> bool;
    /// A source item the pool has never seen.
    async fn pool_insert(&self, source: Self::Source);
    /// Periodic refresh of a member still present in the source.
    async fn pool_update(&self, item: Self::Item);
    /// A member that disappeared from the source.
    async fn pool_remove(&self, item: Self::Item);
}

/// Periodic reconciliation driver. Failures inside a round are logged and
/// never propagate; rounds do not overlap because every task of a round is
/// joined before the loop sleeps again.
pub struct Reconciler<S: PoolStore> {
    store: Arc<S>,
    cancel: CancellationToken,
}

impl<S: PoolStore> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Spawns the loop. Each tick runs one bounded sync round; the handle
    /// resolves after [`Reconciler::close`].
    pub fn start(
        &self,
        interval: Duration,
        round_timeout: Duration,
        run_initial: bool,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if run_initial {
                run_round(&store, round_timeout).await;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                run_round(&store, round_timeout).await;
            }
        })
    }

    /// One synchronous round, surfacing the error; used at startup and in
    /// tests where the caller wants to observe convergence.
    pub async fn sync_once(&self, round_timeout: Duration) -> anyhow::Result<()> {
        sync(&self.store, round_timeout).await
    }

    /// Idempotent; wakes the loop, which then returns.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn run_round<S: PoolStore>(store: &Arc<S>, round_timeout: Duration) {
    if let Err(error) = sync(store, round_timeout).await {
        warn!(%error, "reconciliation round failed");
    }
}

/// One two-phase diff: discovery of new source items first, then refresh or
/// removal of existing members. Discovery is fully joined before the
/// reconciliation phase reads the pool.
async fn sync<S: PoolStore>(store: &Arc<S>, op_timeout: Duration) -> anyhow::Result<()> {
    let source = timeout(op_timeout, store.source_list())
        .await
        .context("source listing timed out")?
        .context("listing reconciliation source")?;

    let mut discoveries = Vec::new();
    for item in &source {
        if store.pool_contains(item) {
            continue;
        }
        let store = Arc::clone(store);
        let item = item.clone();
        discoveries.push(tokio::spawn(async move {
            if timeout(op_timeout, store.pool_insert(item)).await.is_err() {
                warn!("pool insert timed out");
            }
        }));
    }
    join_logged(discoveries).await;

    let mut refreshes = Vec::new();
    for member in store.pool_list() {
        let task_store = Arc::clone(store);
        if store.source_contains(&source, &member) {
            refreshes.push(tokio::spawn(async move {
                if timeout(op_timeout, task_store.pool_update(member)).await.is_err() {
                    warn!("pool update timed out");
                }
            }));
        } else {
            refreshes.push(tokio::spawn(async move {
                if timeout(op_timeout, task_store.pool_remove(member)).await.is_err() {
                    warn!("pool remove timed out");
                }
            }));
        }
    }
    join_logged(refreshes).await;

    Ok(())
}

async fn join_logged(tasks: Vec<JoinHandle<()>>) {
    for result in join_all(tasks).await {
        if let Err(error) = result {
            error!(%error, "reconciliation task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::anyhow;
    use parking_lot::Mutex;

    use super::*;

    /// In-memory pool of plain strings driven from a mutable source list.
    struct FakeStore {
        source: Mutex<Result<Vec<String>, String>>,
        pool: Mutex<HashMap<String, u32>>,
        removed: Mutex<Vec<String>>,
    }

    impl FakeStore {
        fn with_source(items: &[&str]) -> Arc<Self> {
            let store = Arc::new(Self {
                source: Mutex::new(Ok(Vec::new())),
                pool: Mutex::new(HashMap::new()),
                removed: Mutex::new(Vec::new()),
            });
            store.set_source(items);
            store
        }

        fn set_source(&self, items: &[&str]) {
            *self.source.lock() = Ok(items.iter().map(|s| s.to_string()).collect());
        }

        fn fail_source(&self, message: &str) {
            *self.source.lock() = Err(message.to_string());
        }

        fn pool_keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.pool.lock().keys().cloned().collect();
            keys.sort();
            keys
        }
    }

    #[async_trait]
    impl PoolStore for FakeStore {
        type Source = String;
        type Item = String;

        async fn source_list(&self) -> anyhow::Result<Vec<String>> {
            self.source.lock().clone().map_err(|message| anyhow!(message))
        }

        fn source_contains(&self, source: &[String], item: &String) -> bool {
            source.contains(item)
        }

        fn pool_list(&self) -> Vec<String> {
            self.pool.lock().keys().cloned().collect()
        }

        fn pool_contains(&self, source: &String) -> bool {
            self.pool.lock().contains_key(source)
        }

        async fn pool_insert(&self, source: String) {
            self.pool.lock().insert(source, 0);
        }

        async fn pool_update(&self, item: String) {
            if let Some(refreshes) = self.pool.lock().get_mut(&item) {
                *refreshes += 1;
            }
        }

        async fn pool_remove(&self, item: String) {
            self.pool.lock().remove(&item);
            self.removed.lock().push(item);
        }
    }

    const ROUND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn discovery_inserts_new_items() {
        let store = FakeStore::with_source(&["a", "b"]);
        let engine = Reconciler::new(Arc::clone(&store));

        engine.sync_once(ROUND).await.unwrap();
        assert_eq!(store.pool_keys(), vec!["a".to_string(), "b".to_string()]);
        assert!(store.removed.lock().is_empty());
    }

    #[tokio::test]
    async fn vanished_items_are_removed() {
        let store = FakeStore::with_source(&["a", "b"]);
        let engine = Reconciler::new(Arc::clone(&store));
        engine.sync_once(ROUND).await.unwrap();

        store.set_source(&["a"]);
        engine.sync_once(ROUND).await.unwrap();

        assert_eq!(store.pool_keys(), vec!["a".to_string()]);
        assert_eq!(store.removed.lock().clone(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn surviving_items_are_refreshed() {
        let store = FakeStore::with_source(&["a"]);
        let engine = Reconciler::new(Arc::clone(&store));

        engine.sync_once(ROUND).await.unwrap();
        engine.sync_once(ROUND).await.unwrap();
        engine.sync_once(ROUND).await.unwrap();

        // first round inserts, the next two refresh
        assert_eq!(store.pool.lock().get("a"), Some(&2));
    }

    #[tokio::test]
    async fn convergence_from_arbitrary_pool_state() {
        let store = FakeStore::with_source(&["b", "c"]);
        store.pool.lock().insert("a".to_string(), 0);
        store.pool.lock().insert("b".to_string(), 0);

        let engine = Reconciler::new(Arc::clone(&store));
        engine.sync_once(ROUND).await.unwrap();

        assert_eq!(store.pool_keys(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn failed_source_skips_the_round() {
        let store = FakeStore::with_source(&["a"]);
        let engine = Reconciler::new(Arc::clone(&store));
        engine.sync_once(ROUND).await.unwrap();

        store.fail_source("database is down");
        assert!(engine.sync_once(ROUND).await.is_err());
        // the pool is untouched by the failed round
        assert_eq!(store.pool_keys(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn background_loop_converges_and_stops() {
        let store = FakeStore::with_source(&["a"]);
        let engine = Reconciler::new(Arc::clone(&store));
        let handle = engine.start(Duration::from_millis(10), ROUND, true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while store.pool_keys().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "pool never converged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        engine.close();
        engine.close(); // idempotent
        handle.await.unwrap();
    }
}
