//! Client for one remote cache node.
//!
//! Every operation is a single HTTP round-trip with a per-call deadline.
//! All failures (timeout, transport error, remote not-found) map to
//! absent/false; the cache group discriminates only by presence of a
//! value.

use crate::error::PeerError;
use crate::metrics;
use crate::types::ByteView;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Deadline applied to every RPC round-trip.
const CALL_DEADLINE: Duration = Duration::from_secs(3);

/// Deadline for the construction-time reachability probe.
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct AckResponse {
    success: bool,
}

/// A connected remote peer.
pub struct PeerClient {
    addr: String,
    base_url: String,
    http: reqwest::Client,
}

impl PeerClient {
    /// Connect to a peer, probing its health endpoint.
    ///
    /// Fails when the peer does not answer within the connect deadline;
    /// the caller decides whether to retry or skip the peer.
    pub async fn connect(addr: &str) -> Result<Self, PeerError> {
        let http = reqwest::Client::builder()
            .timeout(CALL_DEADLINE)
            .build()?;
        let client = Self {
            addr: addr.to_string(),
            base_url: format!("http://{addr}"),
            http,
        };

        let probe = client
            .http
            .get(format!("{}/health", client.base_url))
            .timeout(CONNECT_DEADLINE)
            .send()
            .await;
        match probe {
            Ok(resp) if resp.status().is_success() => Ok(client),
            Ok(resp) => Err(PeerError::Status {
                status: resp.status().as_u16(),
                addr: addr.to_string(),
            }),
            Err(e) if e.is_timeout() => Err(PeerError::Timeout(addr.to_string())),
            Err(e) => Err(PeerError::Unreachable(format!("{addr}: {e}"))),
        }
    }

    /// The peer's `host:port` address; doubles as its ring name.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn entry_url(&self, group: &str) -> String {
        format!("{}/rpc/groups/{group}/entry", self.base_url)
    }

    /// Fetch a value from the peer. Absent on any failure.
    pub async fn get(&self, group: &str, key: &str) -> Option<ByteView> {
        let _timer = metrics::PEER_CALL_DURATION
            .with_label_values(&["get"])
            .start_timer();
        let resp = self
            .http
            .get(self.entry_url(group))
            .query(&[("key", key)])
            .send()
            .await;
        let value = match resp {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(body) => Some(ByteView::from(body)),
                Err(e) => {
                    warn!(peer = %self.addr, error = %e, "Failed to read peer response");
                    None
                }
            },
            Ok(resp) => {
                debug!(peer = %self.addr, status = %resp.status(), key, "Peer get missed");
                None
            }
            Err(e) => {
                warn!(peer = %self.addr, error = %e, "Peer get failed");
                None
            }
        };
        let outcome = if value.is_some() { "ok" } else { "failed" };
        metrics::PEER_CALLS.with_label_values(&["get", outcome]).inc();
        value
    }

    /// Store a value on the peer. False on any failure.
    pub async fn set(&self, group: &str, key: &str, value: ByteView) -> bool {
        let _timer = metrics::PEER_CALL_DURATION
            .with_label_values(&["set"])
            .start_timer();
        let resp = self
            .http
            .put(self.entry_url(group))
            .query(&[("key", key)])
            .body(value.to_vec())
            .send()
            .await;
        self.ack(resp, "set").await
    }

    /// Delete a key on the peer. False on any failure.
    pub async fn delete(&self, group: &str, key: &str) -> bool {
        let _timer = metrics::PEER_CALL_DURATION
            .with_label_values(&["delete"])
            .start_timer();
        let resp = self
            .http
            .delete(self.entry_url(group))
            .query(&[("key", key)])
            .send()
            .await;
        self.ack(resp, "delete").await
    }

    /// Drop the peer's cached copy of a key. False on any failure.
    pub async fn invalidate(&self, group: &str, key: &str) -> bool {
        let _timer = metrics::PEER_CALL_DURATION
            .with_label_values(&["invalidate"])
            .start_timer();
        let resp = self
            .http
            .post(format!("{}/rpc/groups/{group}/invalidate", self.base_url))
            .query(&[("key", key)])
            .send()
            .await;
        self.ack(resp, "invalidate").await
    }

    async fn ack(&self, resp: Result<reqwest::Response, reqwest::Error>, op: &str) -> bool {
        let success = match resp {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<AckResponse>().await {
                    Ok(ack) => ack.success,
                    Err(e) => {
                        warn!(peer = %self.addr, op, error = %e, "Malformed peer ack");
                        false
                    }
                }
            }
            Ok(resp) => {
                debug!(peer = %self.addr, op, status = %resp.status(), "Peer rejected call");
                false
            }
            Err(e) => {
                warn!(peer = %self.addr, op, error = %e, "Peer call failed");
                false
            }
        };
        let outcome = if success { "ok" } else { "failed" };
        metrics::PEER_CALLS.with_label_values(&[op, outcome]).inc();
        success
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient").field("addr", &self.addr).finish()
    }
}
