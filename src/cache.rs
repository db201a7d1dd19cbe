//! Request-keyed cache in front of the [`Fetcher`].
//!
//! Entries are keyed by [`cache_key`] and carry a tag set made of the key itself
//! plus any caller-supplied labels. Three maps cooperate:
//!
//! - `entries`: key -> stored result with its creation time and TTL
//! - `tag_index`: tag -> keys carrying that tag, so invalidation only touches
//!   matching entries
//! - `in_flight`: key -> the one fetch currently running for that key, with the
//!   tags of every caller waiting on it
//!
//! Each fetch runs on its own task and settles even if every caller goes away.
//! A fetch only stores its result while it still owns the key's in-flight slot;
//! invalidating one of its tags detaches it, so the result is handed to the
//! callers already waiting but never cached.
//!
//! Expiry is lazy: a stale entry is dropped by the read that finds it. All maps
//! are sharded, so work on distinct keys does not contend. Locks are always
//! taken in the order `in_flight`, `entries`, `tag_index`.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    fetcher::{FetchMode, Fetcher, QueryResult},
    keyer::{cache_key, CacheKey},
};

/// Lifetime of a cached result unless configured otherwise.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

type SharedFetch = Shared<BoxFuture<'static, Result<QueryResult, Arc<Error>>>>;

struct CacheEntry {
    value: QueryResult,
    tags: HashSet<String>,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) < self.ttl
    }
}

/// A running fetch and the tags its result will be stored under.
struct InFlight {
    id: u64,
    fetch: SharedFetch,
    tags: HashSet<String>,
}

/// Process-wide query cache. Cloning shares the same store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: Fetcher,
    ttl: Duration,
    entries: DashMap<CacheKey, CacheEntry>,
    tag_index: DashMap<String, HashSet<CacheKey>>,
    in_flight: DashMap<CacheKey, InFlight>,
    next_fetch: AtomicU64,
}

impl QueryCache {
    pub fn new(fetcher: Fetcher, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                ttl,
                entries: DashMap::new(),
                tag_index: DashMap::new(),
                in_flight: DashMap::new(),
                next_fetch: AtomicU64::new(0),
            }),
        }
    }

    /// Return the live cached result for this query, or fetch it once.
    ///
    /// Concurrent callers with the same key share one fetch and observe the
    /// same value or failure. The stored tag set is the key plus the tags of
    /// every caller that joined the fetch. Failures are not cached.
    pub async fn get_or_fetch(
        &self,
        relays: &[String],
        filter: &Value,
        mode: FetchMode,
        tags: &[String],
    ) -> Result<QueryResult> {
        let key = cache_key(relays, filter, mode.is_single());
        if let Some(value) = self.inner.lookup(&key) {
            debug!(%key, "cache hit");
            return Ok(value);
        }

        let fetch = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(mut pending) => {
                debug!(%key, "joining in-flight fetch");
                let pending = pending.get_mut();
                pending.tags.extend(tags.iter().cloned());
                pending.fetch.clone()
            }
            Entry::Vacant(slot) => {
                // A fetch may have completed between the lookup and taking the slot.
                if let Some(value) = self.inner.lookup(&key) {
                    return Ok(value);
                }
                debug!(%key, ?mode, "cache miss");
                let id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
                let fetch = Inner::start_fetch(
                    &self.inner,
                    id,
                    key.clone(),
                    relays.to_vec(),
                    filter.clone(),
                    mode,
                );
                let mut record_tags: HashSet<String> = tags.iter().cloned().collect();
                record_tags.insert(key.as_str().to_string());
                slot.insert(InFlight {
                    id,
                    fetch: fetch.clone(),
                    tags: record_tags,
                });
                fetch
            }
        };
        fetch.await.map_err(Error::Shared)
    }

    /// Drop every entry whose tag set contains `tag` and detach every running
    /// fetch that would store under it; returns how many of both.
    pub fn invalidate(&self, tag: &str) -> usize {
        let mut detached = 0;
        self.inner.in_flight.retain(|_, pending| {
            let keep = !pending.tags.contains(tag);
            if !keep {
                detached += 1;
            }
            keep
        });

        let mut dropped = 0;
        if let Some((_, keys)) = self.inner.tag_index.remove(tag) {
            for key in keys {
                if let Some((_, entry)) = self.inner.entries.remove(&key) {
                    self.inner.unindex(&key, &entry.tags);
                    dropped += 1;
                }
            }
        }
        if dropped + detached == 0 {
            debug!(tag, "invalidate matched nothing");
        } else {
            info!(tag, dropped, detached, "invalidated cache tag");
        }
        dropped + detached
    }

    /// Number of entries that have not yet expired.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .count()
    }
}

impl Inner {
    /// Spawn the fetch for `key` and return a handle every caller can await.
    fn start_fetch(
        this: &Arc<Self>,
        id: u64,
        key: CacheKey,
        relays: Vec<String>,
        filter: Value,
        mode: FetchMode,
    ) -> SharedFetch {
        let inner = Arc::clone(this);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let outcome = inner.fetcher.fetch(&relays, &filter, mode).await;
            inner.settle(id, &task_key, &outcome);
            outcome.map_err(Arc::new)
        });
        let inner = Arc::clone(this);
        task.map(move |joined| match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%key, error = %e, "fetch task failed");
                inner.in_flight.remove_if(&key, |_, pending| pending.id == id);
                Err(Arc::new(Error::FetchTask(e.to_string())))
            }
        })
        .boxed()
        .shared()
    }

    /// Release the in-flight slot of fetch `id`, storing a successful result
    /// only if the slot was still its own.
    fn settle(&self, id: u64, key: &CacheKey, outcome: &Result<QueryResult>) {
        let Entry::Occupied(slot) = self.in_flight.entry(key.clone()) else {
            debug!(%key, "fetch detached before it settled; result not stored");
            return;
        };
        if slot.get().id != id {
            debug!(%key, "fetch superseded before it settled; result not stored");
            return;
        }
        match outcome {
            Ok(value) => self.store(key, value.clone(), slot.get().tags.clone()),
            Err(e) => warn!(%key, error = %e, "fetch failed; nothing cached"),
        }
        slot.remove();
    }

    /// Live value for `key`, dropping the entry if it has expired.
    fn lookup(&self, key: &CacheKey) -> Option<QueryResult> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if entry.is_live(now) {
                return Some(entry.value.clone());
            }
        }
        if let Some((_, stale)) = self.entries.remove_if(key, |_, e| !e.is_live(now)) {
            debug!(%key, "cache entry expired");
            self.unindex(key, &stale.tags);
        }
        None
    }

    fn store(&self, key: &CacheKey, value: QueryResult, tags: HashSet<String>) {
        let entry = CacheEntry {
            value,
            tags: tags.clone(),
            created_at: Instant::now(),
            ttl: self.ttl,
        };
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            let dropped: HashSet<String> = previous.tags.difference(&tags).cloned().collect();
            self.unindex(key, &dropped);
        }
        for tag in tags {
            self.tag_index.entry(tag).or_default().insert(key.clone());
        }
    }

    fn unindex(&self, key: &CacheKey, tags: &HashSet<String>) {
        for tag in tags {
            if let Some(mut keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
            }
            self.tag_index.remove_if(tag, |_, keys| keys.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::UnsignedEvent, keys::Keys, relay::testing::SpyPool};
    use futures_util::future::join_all;
    use serde_json::json;

    fn cache_with(pool: &Arc<SpyPool>) -> QueryCache {
        QueryCache::new(Fetcher::new(pool.clone()), DEFAULT_TTL)
    }

    fn relays() -> Vec<String> {
        vec!["wss://r1".to_string()]
    }

    fn spy_with_note() -> Arc<SpyPool> {
        let keys = Keys::generate();
        let ev = keys.sign(UnsignedEvent::note("hi", vec![])).unwrap();
        Arc::new(SpyPool::with_events(vec![ev]))
    }

    fn delayed_spy(delay: Duration) -> Arc<SpyPool> {
        let mut spy = SpyPool::with_events(vec![]);
        spy.delay = delay;
        Arc::new(spy)
    }

    #[tokio::test]
    async fn repeated_query_fetches_once() {
        let pool = spy_with_note();
        let cache = cache_with(&pool);
        let filter = json!({"kinds": [1]});
        let first = cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();
        let second = cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let pool = delayed_spy(Duration::from_millis(50));
        let cache = cache_with(&pool);
        let filter = json!({"kinds": [1]});
        let relays = relays();
        let calls =
            (0..16).map(|_| cache.get_or_fetch(&relays, &filter, FetchMode::SingleEvent, &[]));
        let results = join_all(calls).await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(QueryResult::Single(None)))));
        assert_eq!(pool.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let mut spy = SpyPool::unreachable();
        spy.delay = Duration::from_millis(50);
        let pool = Arc::new(spy);
        let cache = cache_with(&pool);
        let filter = json!({});
        let relays = relays();
        let calls = (0..4).map(|_| cache.get_or_fetch(&relays, &filter, FetchMode::SetSync, &[]));
        let results = join_all(calls).await;
        for res in results {
            let err = res.unwrap_err();
            assert!(matches!(err.root(), Error::RelayUnreachable { .. }));
        }
        assert_eq!(pool.calls(), 1);
        assert_eq!(cache.len(), 0);

        // Failures are not cached: the next call goes back to the network.
        let _ = cache
            .get_or_fetch(&relays, &filter, FetchMode::SetSync, &[])
            .await;
        assert_eq!(pool.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let pool = spy_with_note();
        let cache = cache_with(&pool);
        let filter = json!({"kinds": [1]});
        cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3599)).await;
        cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert_eq!(pool.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.len(), 0);
        cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert_eq!(pool.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_drops_only_tagged_entries() {
        let pool = spy_with_note();
        let cache = cache_with(&pool);
        let tagged = json!({"kinds": [0]});
        let also_tagged = json!({"kinds": [3]});
        let untagged = json!({"kinds": [1]});
        let x = vec!["X".to_string()];
        let xy = vec!["X".to_string(), "Y".to_string()];
        cache
            .get_or_fetch(&relays(), &tagged, FetchMode::SetSync, &x)
            .await
            .unwrap();
        cache
            .get_or_fetch(&relays(), &also_tagged, FetchMode::SetSync, &xy)
            .await
            .unwrap();
        cache
            .get_or_fetch(&relays(), &untagged, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert_eq!(pool.calls(), 3);

        assert_eq!(cache.invalidate("X"), 2);
        assert_eq!(cache.len(), 1);
        // The second entry's other tag no longer points anywhere.
        assert_eq!(cache.invalidate("Y"), 0);

        cache
            .get_or_fetch(&relays(), &untagged, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert_eq!(pool.calls(), 3);
        cache
            .get_or_fetch(&relays(), &tagged, FetchMode::SetSync, &x)
            .await
            .unwrap();
        assert_eq!(pool.calls(), 4);
    }

    #[tokio::test]
    async fn key_is_its_own_tag() {
        let pool = spy_with_note();
        let cache = cache_with(&pool);
        let filter = json!({"kinds": [1]});
        let key = cache_key(&relays(), &filter, false);
        cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert_eq!(cache.invalidate(key.as_str()), 1);
        cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert_eq!(pool.calls(), 2);
    }

    #[tokio::test]
    async fn modes_are_cached_separately() {
        let pool = spy_with_note();
        let cache = cache_with(&pool);
        let filter = json!({"kinds": [1]});
        let single = cache
            .get_or_fetch(&relays(), &filter, FetchMode::SingleEvent, &[])
            .await
            .unwrap();
        let set = cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert!(matches!(single, QueryResult::Single(Some(_))));
        assert!(matches!(set, QueryResult::Set(ref v) if v.len() == 1));
        assert_eq!(pool.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_fetch_still_settles() {
        let pool = delayed_spy(Duration::from_millis(200));
        let cache = cache_with(&pool);
        let filter = json!({"kinds": [1]});
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            cache.get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[]),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.calls(), 1);
        assert_eq!(cache.inner.in_flight.len(), 0);
        assert_eq!(cache.len(), 1);

        cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert_eq!(pool.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidating_a_running_fetch_keeps_its_result_out() {
        let pool = delayed_spy(Duration::from_millis(200));
        let cache = cache_with(&pool);
        let filter = json!({"kinds": [0]});
        let tags = vec!["profile:x".to_string()];
        let early = tokio::spawn({
            let cache = cache.clone();
            let filter = filter.clone();
            let tags = tags.clone();
            async move {
                cache
                    .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &tags)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.invalidate("profile:x"), 1);

        // Callers already waiting still get their answer.
        assert!(early.await.unwrap().is_ok());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.inner.in_flight.len(), 0);

        cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &tags)
            .await
            .unwrap();
        assert_eq!(pool.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bypassing_a_running_fetch_goes_back_to_network() {
        let pool = delayed_spy(Duration::from_millis(200));
        let cache = cache_with(&pool);
        let filter = json!({"kinds": [1]});
        let key = cache_key(&relays(), &filter, false);
        let first = tokio::spawn({
            let cache = cache.clone();
            let filter = filter.clone();
            async move {
                cache
                    .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // What the endpoint does for `noCache`.
        assert_eq!(cache.invalidate(key.as_str()), 1);
        cache
            .get_or_fetch(&relays(), &filter, FetchMode::SetSync, &[])
            .await
            .unwrap();
        assert_eq!(pool.calls(), 2);

        first.await.unwrap().unwrap();
        assert_eq!(cache.inner.in_flight.len(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_fetch_in_parallel() {
        let pool = delayed_spy(Duration::from_millis(200));
        let cache = cache_with(&pool);
        let relays = relays();
        let profile = json!({"kinds": [0]});
        let notes = json!({"kinds": [1]});
        let started = Instant::now();
        let (a, b) = tokio::join!(
            cache.get_or_fetch(&relays, &profile, FetchMode::SetSync, &[]),
            cache.get_or_fetch(&relays, &notes, FetchMode::SetSync, &[]),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(pool.calls(), 2);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn joining_callers_add_their_tags() {
        let pool = delayed_spy(Duration::from_millis(100));
        let cache = cache_with(&pool);
        let relays = relays();
        let filter = json!({"kinds": [3]});
        let first = vec!["a".to_string()];
        let second = vec!["b".to_string()];
        let (r1, r2) = tokio::join!(
            cache.get_or_fetch(&relays, &filter, FetchMode::SetSync, &first),
            cache.get_or_fetch(&relays, &filter, FetchMode::SetSync, &second),
        );
        r1.unwrap();
        r2.unwrap();
        assert_eq!(pool.calls(), 1);
        assert_eq!(cache.invalidate("b"), 1);
        assert_eq!(cache.len(), 0);
    }
}
