//! NIP-01 relay client: one-shot subscriptions and publishing over WebSockets.
//!
//! Every call opens fresh connections, fans out to all relays concurrently, and
//! tears the sockets down when it returns. A relay that fails after others have
//! answered is logged and left out of the result.

use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{future::join_all, stream::FuturesUnordered, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    event::Event,
};

/// Default bound on a single fetch or publish round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay capabilities the cache and publisher depend on.
#[async_trait]
pub trait RelayPool: Send + Sync {
    /// First event matching `filter` from any relay, or `None` once every relay
    /// has finished or the deadline passes.
    async fn get(&self, relays: &[String], filter: &Value) -> Result<Option<Event>>;

    /// Deduplicated union of matching events across all relays.
    async fn query_sync(&self, relays: &[String], filter: &Value) -> Result<Vec<Event>>;

    /// Send a signed event to every relay and collect their `OK` replies.
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishReport>;
}

/// Per-relay outcome of a publish.
#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct PublishReport {
    pub accepted: Vec<String>,
    /// Relays that answered `OK false` with their reason.
    pub rejected: Vec<(String, String)>,
    /// Relays that could not be reached or never answered.
    pub failed: Vec<(String, String)>,
}

/// WebSocket implementation of [`RelayPool`].
pub struct WsPool {
    tor_socks: Option<String>,
    timeout: Duration,
    next_sub: AtomicU64,
}

impl WsPool {
    pub fn new(tor_socks: Option<String>, timeout: Duration) -> Self {
        Self {
            tor_socks,
            timeout,
            next_sub: AtomicU64::new(0),
        }
    }

    fn subscription_id(&self) -> String {
        format!("rc{}", self.next_sub.fetch_add(1, Ordering::Relaxed))
    }

    /// Run one `REQ` against `url` until `EOSE`, `max` events, or `deadline`.
    ///
    /// Only a failure to connect is returned as an error; anything after the
    /// handshake yields the events gathered so far.
    async fn collect(
        &self,
        url: &str,
        filter: &Value,
        deadline: Instant,
        max: Option<usize>,
    ) -> Result<Vec<Event>> {
        let mut ws = match timeout_at(deadline, connect_ws(url, self.tor_socks.as_deref())).await {
            Ok(res) => res?,
            Err(_) => return Err(Error::relay(url, "connect timed out")),
        };
        let sub_id = self.subscription_id();
        let mut events = Vec::new();
        let req = json!(["REQ", sub_id, filter]);
        if let Err(e) = ws.send(Message::Text(req.to_string())).await {
            warn!(relay = url, error = %e, "failed to send subscription");
            return Ok(events);
        }

        loop {
            if max.is_some_and(|m| events.len() >= m) {
                break;
            }
            let msg = match timeout_at(deadline, ws.next()).await {
                Err(_) => {
                    debug!(relay = url, received = events.len(), "relay hit deadline");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(relay = url, error = %e, "relay stream error");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };
            match msg {
                Message::Text(txt) => match parse_frame(&txt, &sub_id) {
                    Frame::Event(ev) => match ev.verify() {
                        Ok(()) => events.push(*ev),
                        Err(e) => debug!(relay = url, error = %e, "dropping invalid event"),
                    },
                    Frame::EndOfStored => break,
                    Frame::Closed(reason) => {
                        warn!(relay = url, reason = %reason, "relay closed subscription");
                        break;
                    }
                    Frame::Other => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        // Tear down in the background so a slow peer cannot hold the caller.
        tokio::spawn(async move {
            let _ = ws.send(Message::Text(json!(["CLOSE", sub_id]).to_string())).await;
            let _ = ws.close(None).await;
        });
        Ok(events)
    }

    async fn publish_one(&self, url: &str, event: &Event, deadline: Instant) -> PublishOutcome {
        let mut ws = match timeout_at(deadline, connect_ws(url, self.tor_socks.as_deref())).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return PublishOutcome::Unreachable(e.to_string()),
            Err(_) => return PublishOutcome::Unreachable("connect timed out".into()),
        };
        let msg = json!(["EVENT", event]);
        if let Err(e) = ws.send(Message::Text(msg.to_string())).await {
            return PublishOutcome::Failed(e.to_string());
        }
        let outcome = loop {
            match timeout_at(deadline, ws.next()).await {
                Err(_) => break PublishOutcome::Failed("no OK before deadline".into()),
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                    break PublishOutcome::Failed("connection closed".into())
                }
                Ok(Some(Err(e))) => break PublishOutcome::Failed(e.to_string()),
                Ok(Some(Ok(Message::Text(txt)))) => {
                    if let Some((accepted, reason)) = parse_ok(&txt, &event.id) {
                        break if accepted {
                            PublishOutcome::Accepted
                        } else {
                            PublishOutcome::Rejected(reason)
                        };
                    }
                }
                Ok(Some(Ok(_))) => {}
            }
        };
        tokio::spawn(async move {
            let _ = ws.close(None).await;
        });
        outcome
    }
}

impl Default for WsPool {
    fn default() -> Self {
        Self::new(None, DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl RelayPool for WsPool {
    async fn get(&self, relays: &[String], filter: &Value) -> Result<Option<Event>> {
        let deadline = Instant::now() + self.timeout;
        let filter = &with_limit_one(filter);
        let mut pending: FuturesUnordered<_> = relays
            .iter()
            .map(|url| async move { (url, self.collect(url, filter, deadline, Some(1)).await) })
            .collect();
        let mut unreachable = 0;
        while let Some((url, res)) = pending.next().await {
            match res {
                Ok(mut events) => {
                    if let Some(ev) = events.pop() {
                        debug!(relay = %url, id = %ev.id, "first matching event");
                        return Ok(Some(ev));
                    }
                }
                Err(e) => {
                    warn!(relay = %url, error = %e, "relay unreachable");
                    unreachable += 1;
                }
            }
        }
        if unreachable == relays.len() {
            return Err(Error::RelayUnreachable {
                attempted: relays.len(),
            });
        }
        Ok(None)
    }

    async fn query_sync(&self, relays: &[String], filter: &Value) -> Result<Vec<Event>> {
        let deadline = Instant::now() + self.timeout;
        let results = join_all(
            relays
                .iter()
                .map(|url| self.collect(url, filter, deadline, None)),
        )
        .await;
        let mut unreachable = 0;
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for (url, res) in relays.iter().zip(results) {
            match res {
                Ok(events) => {
                    for ev in events {
                        if seen.insert(ev.id.clone()) {
                            merged.push(ev);
                        }
                    }
                }
                Err(e) => {
                    warn!(relay = %url, error = %e, "relay unreachable");
                    unreachable += 1;
                }
            }
        }
        if unreachable == relays.len() {
            return Err(Error::RelayUnreachable {
                attempted: relays.len(),
            });
        }
        Ok(merged)
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishReport> {
        let deadline = Instant::now() + self.timeout;
        let outcomes = join_all(
            relays
                .iter()
                .map(|url| self.publish_one(url, event, deadline)),
        )
        .await;
        let mut report = PublishReport::default();
        let mut unreachable = 0;
        for (url, outcome) in relays.iter().zip(outcomes) {
            match outcome {
                PublishOutcome::Accepted => report.accepted.push(url.clone()),
                PublishOutcome::Rejected(reason) => report.rejected.push((url.clone(), reason)),
                PublishOutcome::Failed(reason) => report.failed.push((url.clone(), reason)),
                PublishOutcome::Unreachable(reason) => {
                    unreachable += 1;
                    report.failed.push((url.clone(), reason));
                }
            }
        }
        if unreachable == relays.len() {
            return Err(Error::RelayUnreachable {
                attempted: relays.len(),
            });
        }
        Ok(report)
    }
}

enum PublishOutcome {
    Accepted,
    Rejected(String),
    Failed(String),
    Unreachable(String),
}

/// Relay-to-client frames relevant to one subscription.
enum Frame {
    Event(Box<Event>),
    EndOfStored,
    Closed(String),
    Other,
}

fn parse_frame(txt: &str, sub_id: &str) -> Frame {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        return Frame::Other;
    };
    let Some(arr) = val.as_array() else {
        return Frame::Other;
    };
    if arr.get(1).and_then(|v| v.as_str()) != Some(sub_id) {
        return Frame::Other;
    }
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => match serde_json::from_value::<Event>(arr[2].clone()) {
            Ok(ev) => Frame::Event(Box::new(ev)),
            Err(_) => Frame::Other,
        },
        Some("EOSE") => Frame::EndOfStored,
        Some("CLOSED") => Frame::Closed(
            arr.get(2)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        ),
        _ => Frame::Other,
    }
}

/// Parse `["OK", <id>, <accepted>, <message>]` for the given event id.
fn parse_ok(txt: &str, event_id: &str) -> Option<(bool, String)> {
    let val: Value = serde_json::from_str(txt).ok()?;
    let arr = val.as_array()?;
    if arr.first()?.as_str()? != "OK" || arr.get(1)?.as_str()? != event_id {
        return None;
    }
    let accepted = arr.get(2)?.as_bool()?;
    let message = arr
        .get(3)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some((accepted, message))
}

fn with_limit_one(filter: &Value) -> Value {
    let mut filter = filter.clone();
    if let Some(obj) = filter.as_object_mut() {
        obj.insert("limit".into(), json!(1));
    }
    filter
}

type RelaySocket = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<RelaySocket> {
    let url = Url::parse(relay).map_err(|e| Error::relay(relay, e))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::relay(relay, "missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::relay(relay, "missing port"))?;
    let req = relay
        .into_client_request()
        .map_err(|e| Error::relay(relay, e))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::relay(relay, e))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::relay(relay, e))?,
        )
    };
    let (ws, _) = client_async_tls(req, stream)
        .await
        .map_err(|e| Error::relay(relay, e))?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
