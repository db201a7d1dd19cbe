//! HTTP endpoints for health checks, cached relay queries, and revalidation.

use anyhow::Result;
use axum::{
    extract::{Query as AxumQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{future::Future, net::SocketAddr, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    cache::QueryCache,
    config::csv_strings,
    error::Error,
    fetcher::{FetchMode, QueryResult},
    keyer::{cache_key, CacheKey},
};

#[derive(Clone)]
struct HttpState {
    cache: QueryCache,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
    /// Live cache entries.
    entries: usize,
}

/// Start an HTTP server exposing `/healthz` and the pool endpoints.
pub async fn serve_http(
    addr: SocketAddr,
    cache: QueryCache,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http listening");
    axum::serve(listener, router(cache).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn router(cache: QueryCache) -> Router {
    let state = Arc::new(HttpState { cache });
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/nostr/pool/get", get(pool_get))
        .route("/api/nostr/pool/revalidate", post(revalidate))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<HttpState>>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        entries: state.cache.len(),
    })
}

/// URL query parameters accepted by `/api/nostr/pool/get`.
#[derive(Deserialize)]
struct PoolParams {
    /// URL-encoded JSON `{ "relays": [...], "filter": {...} }`.
    query: Option<String>,
    #[serde(rename = "isSingleEvent")]
    is_single_event: Option<String>,
    #[serde(rename = "noCache")]
    no_cache: Option<String>,
    /// Comma-separated invalidation labels.
    tags: Option<String>,
}

#[derive(Deserialize)]
struct QueryPayload {
    relays: Vec<String>,
    filter: Value,
}

/// One parsed pool request.
#[derive(Debug)]
struct QueryRequest {
    relays: Vec<String>,
    filter: Value,
    mode: FetchMode,
    no_cache: bool,
    tags: Vec<String>,
}

impl QueryRequest {
    fn from_params(params: PoolParams) -> Result<Self, Error> {
        let raw = params
            .query
            .ok_or_else(|| Error::BadRequest("missing query".into()))?;
        // The query string layer has already decoded once; the payload itself
        // is encoded again by clients.
        let decoded = percent_decode_str(&raw)
            .decode_utf8()
            .map_err(|e| Error::BadRequest(format!("query is not utf-8: {e}")))?;
        let payload: QueryPayload = serde_json::from_str(&decoded)
            .map_err(|e| Error::BadRequest(format!("query is not valid JSON: {e}")))?;
        if payload.relays.is_empty() {
            return Err(Error::BadRequest("relays must not be empty".into()));
        }
        Ok(Self {
            relays: payload.relays,
            filter: payload.filter,
            mode: FetchMode::from_single_flag(is_truthy(params.is_single_event.as_deref())),
            no_cache: is_truthy(params.no_cache.as_deref()),
            tags: params.tags.map(csv_strings).unwrap_or_default(),
        })
    }

    fn key(&self) -> CacheKey {
        cache_key(&self.relays, &self.filter, self.mode.is_single())
    }
}

/// Flags count as set when present with a non-empty value.
fn is_truthy(flag: Option<&str>) -> bool {
    flag.is_some_and(|v| !v.is_empty())
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, "Bad request").into_response()
}

/// Serve a relay query through the cache.
///
/// `noCache` drops only this query's own entry before fetching; entries that
/// merely share one of the caller's tags are left alone. No HTTP caching
/// headers are emitted.
async fn pool_get(
    State(state): State<Arc<HttpState>>,
    AxumQuery(params): AxumQuery<PoolParams>,
) -> Response {
    let request = match QueryRequest::from_params(params) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "rejecting pool request");
            return bad_request();
        }
    };
    let key = request.key();
    if request.no_cache {
        state.cache.invalidate(key.as_str());
    }
    debug!(%key, filter = %request.filter, "pool request");
    match state
        .cache
        .get_or_fetch(&request.relays, &request.filter, request.mode, &request.tags)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(err) => match err.root() {
            Error::RelayUnreachable { .. } => {
                Json(QueryResult::empty(request.mode)).into_response()
            }
            Error::BadRequest(_) => bad_request(),
            other => {
                warn!(%key, error = %other, "pool request failed");
                (StatusCode::BAD_GATEWAY, "Relay error").into_response()
            }
        },
    }
}

#[derive(Deserialize)]
struct RevalidateParams {
    tag: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Revalidated {
    revalidated: String,
    dropped: usize,
}

/// Drop every cache entry carrying `tag`, including fetches still running.
async fn revalidate(
    State(state): State<Arc<HttpState>>,
    AxumQuery(params): AxumQuery<RevalidateParams>,
) -> Response {
    let Some(tag) = params.tag.filter(|t| !t.is_empty()) else {
        return bad_request();
    };
    let dropped = state.cache.invalidate(&tag);
    Json(Revalidated {
        revalidated: tag,
        dropped,
    })
    .into_response()
}
