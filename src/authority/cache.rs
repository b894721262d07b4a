use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::time::Instant;

/// How long an answer is replayed for a repeated idempotency key.
pub const DEFAULT_IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct Slot<V> {
    /// Completion time and answer, set once.
    answer: OnceCell<(Instant, V)>,
}

/// Answers keyed by idempotency key, kept for a fixed window after they complete.
///
/// Callers racing on one key share a single in-flight computation. A failed
/// computation leaves the key free for the next caller.
#[derive(Debug)]
pub(crate) struct IdempotencyCache<V> {
    window: Duration,
    slots: DashMap<String, Arc<Slot<V>>>,
}

impl<V: Clone> Default for IdempotencyCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_IDEMPOTENCY_WINDOW)
    }
}

impl<V: Clone> IdempotencyCache<V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// The live answer for `key`, if one completed within the window.
    pub fn get(&self, key: &str) -> Option<V> {
        let slot = self.slots.get(key)?;
        let (completed, value) = slot.answer.get()?;
        (completed.elapsed() < self.window).then(|| value.clone())
    }

    /// Returns the live answer for `key`, or runs `compute` to produce one.
    ///
    /// The flag is `true` when the answer was produced by this call.
    pub async fn get_or_try_insert_with<E, F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<(V, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.evict_expired();
        if let Some(value) = self.get(key) {
            return Ok((value, false));
        }

        let slot = Arc::clone(
            self.slots
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        answer: OnceCell::new(),
                    })
                })
                .value(),
        );

        let computed = AtomicBool::new(false);
        let flag = &computed;
        let (_, value) = slot
            .answer
            .get_or_try_init(|| async move {
                flag.store(true, Ordering::Relaxed);
                compute().await.map(|value| (Instant::now(), value))
            })
            .await?;
        Ok((value.clone(), computed.load(Ordering::Relaxed)))
    }

    /// Records an answer computed elsewhere, replacing any previous one.
    pub fn insert(&self, key: &str, value: V) {
        self.evict_expired();
        self.slots.insert(
            key.to_string(),
            Arc::new(Slot {
                answer: OnceCell::new_with(Some((Instant::now(), value))),
            }),
        );
    }

    /// Drops answers older than the window and abandoned empty slots.
    pub fn evict_expired(&self) {
        self.slots.retain(|_, slot| match slot.answer.get() {
            Some((completed, _)) => completed.elapsed() < self.window,
            None => Arc::strong_count(slot) > 1,
        });
    }

    /// Number of keys currently held, including in-flight ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_answers_expire_after_the_window() {
        let cache = IdempotencyCache::new(Duration::from_secs(10));
        cache.insert("old", 1);
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.insert("new", 2);

        assert_eq!(cache.get("old"), None);
        assert_eq!(cache.get("new"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_computation_leaves_key_free() {
        let cache = IdempotencyCache::<u32>::default();
        let failed: Result<_, &str> = cache
            .get_or_try_insert_with("k", || async { Err("down") })
            .await;
        assert_eq!(failed, Err("down"));

        cache.evict_expired();
        assert_eq!(cache.len(), 0);

        let answered: Result<_, &str> = cache.get_or_try_insert_with("k", || async { Ok(7) }).await;
        assert_eq!(answered, Ok((7, true)));
        let replayed: Result<_, &str> = cache.get_or_try_insert_with("k", || async { Ok(8) }).await;
        assert_eq!(replayed, Ok((7, false)));
    }

    #[tokio::test]
    async fn test_racing_callers_share_one_computation() {
        let cache = IdempotencyCache::<u32>::default();
        let counter = std::sync::atomic::AtomicUsize::new(0);
        let runs = &counter;
        let compute = move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, ()>(5)
        };

        let (a, b) = tokio::join!(
            cache.get_or_try_insert_with("k", compute),
            cache.get_or_try_insert_with("k", compute)
        );
        assert_eq!(a.unwrap().0, 5);
        assert_eq!(b.unwrap().0, 5);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
