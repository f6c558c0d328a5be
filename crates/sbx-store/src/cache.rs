use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::shard_map::ShardMap;

// FIXME: expose the eviction tick as configuration instead of a constant.
const EVICTION_TICK: Duration = Duration::from_millis(50);

/// Items owned by the lifecycle cache report and accept expiry.
pub trait Expirable {
    fn is_expired(&self) -> bool;
    fn mark_expired(&self);
}

/// Expiry-driven cache. Live items sit in `items`; an expired item is handed
/// off to `evicting` while its eviction callback runs, so slow callbacks
/// (node RPCs deallocating the VM) never stall reads or inserts.
pub struct LifecycleCache<T> {
    items: ShardMap<T>,
    evicting: ShardMap<T>,
}

impl<T> LifecycleCache<T>
where
    T: Expirable + Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            items: ShardMap::new(),
            evicting: ShardMap::new(),
        })
    }

    pub fn has(&self, key: &str, include_evicting: bool) -> bool {
        self.items.contains(key) || (include_evicting && self.evicting.contains(key))
    }

    pub fn get(&self, key: &str, include_evicting: bool) -> Option<T> {
        match self.items.get(key) {
            Some(value) => Some(value),
            None if include_evicting => self.evicting.get(key),
            None => None,
        }
    }

    pub fn set_if_absent(&self, key: impl Into<String>, value: T) -> bool {
        self.items.insert_if_absent(key, value)
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.items.remove(key)
    }

    /// Live items, excluding ones already past their end time.
    pub fn items(&self) -> Vec<T> {
        self.items
            .snapshot()
            .into_iter()
            .map(|(_, value)| value)
            .filter(|value| !value.is_expired())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Spawns the eviction loop. Each pass sweeps a snapshot of the live map
    /// and hands expired items to `on_evict`, invoked at most once per
    /// insertion. The loop exits when `cancel` fires.
    pub fn start_eviction<F, Fut>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        on_evict: F,
    ) -> JoinHandle<()>
    where
        F: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cache = Arc::clone(self);
        let on_evict = Arc::new(on_evict);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(EVICTION_TICK) => {}
                }
                cache.sweep(&on_evict);
            }
        })
    }

    fn sweep<F, Fut>(self: &Arc<Self>, on_evict: &Arc<F>)
    where
        F: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        for (key, value) in self.items.snapshot() {
            if !value.is_expired() {
                continue;
            }
            // Leave `items` before entering `evicting` so a key never sits in
            // both maps; the predicate re-check under the shard lock keeps a
            // racing remove() from double-firing the callback.
            let Some(value) = self.items.remove_if(&key, |item| item.is_expired()) else {
                continue;
            };
            if !self.evicting.insert_if_absent(key.clone(), value.clone()) {
                continue;
            }

            let cache = Arc::clone(self);
            let on_evict = Arc::clone(on_evict);
            tokio::spawn(async move {
                if AssertUnwindSafe(on_evict(key.clone(), value))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!(key = %key, "eviction callback panicked");
                }
                cache.evicting.remove(&key);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Clone)]
    struct Item {
        expired: Arc<AtomicBool>,
    }

    impl Item {
        fn live() -> Self {
            Self {
                expired: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Expirable for Item {
        fn is_expired(&self) -> bool {
            self.expired.load(Ordering::SeqCst)
        }

        fn mark_expired(&self) {
            self.expired.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn expired_item_is_evicted_once() {
        let cache = LifecycleCache::new();
        let cancel = CancellationToken::new();
        let evictions = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&evictions);
        cache.start_eviction(cancel.clone(), move |_key, _item: Item| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let item = Item::live();
        assert!(cache.set_if_absent("sbx-a", item.clone()));
        item.mark_expired();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert!(!cache.has("sbx-a", true));
        cancel.cancel();
    }

    #[tokio::test]
    async fn evicting_item_never_lives_in_both_maps() {
        let cache = LifecycleCache::new();
        let cancel = CancellationToken::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(Some(release_rx)));

        {
            let release_rx = Arc::clone(&release_rx);
            cache.start_eviction(cancel.clone(), move |_key, _item: Item| {
                let rx = release_rx.lock().take();
                async move {
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                }
            });
        }

        let item = Item::live();
        cache.set_if_absent("sbx-b", item.clone());
        item.mark_expired();

        // wait until the sweep moved the item into `evicting`
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if cache.get("sbx-b", true).is_some() && cache.get("sbx-b", false).is_none() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "item never reached evicting");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(cache.has("sbx-b", true));
        assert!(!cache.has("sbx-b", false));

        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!cache.has("sbx-b", true));
        cancel.cancel();
    }

    #[tokio::test]
    async fn items_excludes_expired_entries() {
        let cache = LifecycleCache::new();
        let live = Item::live();
        let dead = Item::live();
        cache.set_if_absent("live", live);
        cache.set_if_absent("dead", dead.clone());
        dead.mark_expired();

        assert_eq!(cache.items().len(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn callback_panic_is_contained() {
        let cache = LifecycleCache::new();
        let cancel = CancellationToken::new();

        cache.start_eviction(cancel.clone(), move |_key, _item: Item| async move {
            panic!("callback exploded");
        });

        let item = Item::live();
        cache.set_if_absent("sbx-c", item.clone());
        item.mark_expired();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // the panic is swallowed and the key fully drained
        assert!(!cache.has("sbx-c", true));
        cancel.cancel();
    }
}
