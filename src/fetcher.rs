//! Uncached relay queries in single-event or set-sync mode.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    error::{Error, Result},
    event::Event,
    relay::RelayPool,
};

/// How a query is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// First matching event from any relay.
    SingleEvent,
    /// Deduplicated union of matching events from every relay.
    SetSync,
}

impl FetchMode {
    pub fn from_single_flag(single: bool) -> Self {
        if single {
            FetchMode::SingleEvent
        } else {
            FetchMode::SetSync
        }
    }

    pub fn is_single(self) -> bool {
        self == FetchMode::SingleEvent
    }
}

/// Outcome of one query; serializes to an event, `null`, or an array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Single(Option<Event>),
    Set(Vec<Event>),
}

impl QueryResult {
    /// The "nothing found" value for `mode`.
    pub fn empty(mode: FetchMode) -> Self {
        match mode {
            FetchMode::SingleEvent => QueryResult::Single(None),
            FetchMode::SetSync => QueryResult::Set(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QueryResult::Single(ev) => usize::from(ev.is_some()),
            QueryResult::Set(events) => events.len(),
        }
    }
}

/// Executes exactly one network query per call, with no caching.
#[derive(Clone)]
pub struct Fetcher {
    pool: Arc<dyn RelayPool>,
}

impl Fetcher {
    pub fn new(pool: Arc<dyn RelayPool>) -> Self {
        Self { pool }
    }

    pub async fn fetch(
        &self,
        relays: &[String],
        filter: &Value,
        mode: FetchMode,
    ) -> Result<QueryResult> {
        if relays.is_empty() {
            return Err(Error::BadRequest("relay set is empty".into()));
        }
        let started = Instant::now();
        let result = match mode {
            FetchMode::SingleEvent => QueryResult::Single(self.pool.get(relays, filter).await?),
            FetchMode::SetSync => QueryResult::Set(self.pool.query_sync(relays, filter).await?),
        };
        debug!(
            relays = relays.len(),
            ?mode,
            events = result.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "relay fetch finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::UnsignedEvent, keys::Keys, relay::testing::SpyPool};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn relays() -> Vec<String> {
        vec!["wss://r1".to_string()]
    }

    #[tokio::test]
    async fn modes_dispatch_to_matching_pool_call() {
        let keys = Keys::generate();
        let ev = keys.sign(UnsignedEvent::note("hi", vec![])).unwrap();
        let pool = Arc::new(SpyPool::with_events(vec![ev.clone()]));
        let fetcher = Fetcher::new(pool.clone());

        let single = fetcher
            .fetch(&relays(), &json!({}), FetchMode::SingleEvent)
            .await
            .unwrap();
        assert_eq!(single, QueryResult::Single(Some(ev.clone())));
        assert_eq!(pool.get_calls.load(Ordering::SeqCst), 1);

        let set = fetcher
            .fetch(&relays(), &json!({}), FetchMode::SetSync)
            .await
            .unwrap();
        assert_eq!(set, QueryResult::Set(vec![ev]));
        assert_eq!(pool.query_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_relay_set_is_rejected_without_network() {
        let pool = Arc::new(SpyPool::default());
        let fetcher = Fetcher::new(pool.clone());
        let err = fetcher
            .fetch(&[], &json!({}), FetchMode::SetSync)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(pool.calls(), 0);
    }

    #[test]
    fn results_serialize_as_plain_json() {
        assert_eq!(
            serde_json::to_string(&QueryResult::empty(FetchMode::SingleEvent)).unwrap(),
            "null"
        );
        assert_eq!(
            serde_json::to_string(&QueryResult::empty(FetchMode::SetSync)).unwrap(),
            "[]"
        );
    }
}
