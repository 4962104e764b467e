//! Cluster client SDK.
//!
//! A `ClusterClient` talks to the cache cluster from outside: it discovers
//! nodes through the registry, keeps its own consistent-hash ring of node
//! addresses, and sends each operation straight to the key's owning node.
//! Writes carry the gateway marker so the receiving node propagates them.

use crate::registry::{parse_addr, PeerEvent, PeerEventKind, ServiceRegistry};
use crate::ring::{HashRing, RingConfig};
use crate::rpc::GATEWAY_HEADER;
use crate::types::ByteView;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Deadline for one client call.
const CALL_DEADLINE: Duration = Duration::from_secs(3);

/// Failures a cluster-client call can surface.
///
/// Missing keys are not errors; they come back as `Ok(None)` or
/// `Ok(false)`.
#[derive(Debug, ThisError)]
pub enum ClientError {
    /// No node is currently known for the service.
    #[error("no known cache node")]
    NoPeer,

    /// The owning node failed or was unreachable.
    #[error("remote call failed: {0}")]
    Remote(String),
}

/// Client-side view of the cluster.
pub struct ClusterClient {
    service_name: String,
    ring: Arc<HashRing>,
    http: reqwest::Client,
    stop: broadcast::Sender<()>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterClient {
    /// Connect to the cluster: list current nodes and follow membership
    /// changes in the background.
    pub async fn new(
        service_name: &str,
        registry: Arc<dyn ServiceRegistry>,
        ring_config: RingConfig,
    ) -> Result<Arc<Self>> {
        let (stop, stop_rx) = broadcast::channel::<()>(1);
        let client = Arc::new(Self {
            service_name: service_name.to_string(),
            ring: Arc::new(HashRing::new(ring_config)),
            http: reqwest::Client::builder()
                .timeout(CALL_DEADLINE)
                .build()
                .map_err(|e| Error::General(format!("http client: {e}")))?,
            stop,
            watch_task: Mutex::new(None),
        });

        let addrs = registry
            .list(service_name)
            .await
            .map_err(Error::Registry)?;
        if !addrs.is_empty() {
            client.ring.add(&addrs);
        }
        debug!(service = service_name, nodes = addrs.len(), "Cluster client ready");

        let events = registry
            .watch(service_name)
            .await
            .map_err(Error::Registry)?;
        let task = tokio::spawn(Self::watch_loop(client.clone(), events, stop_rx));
        *client.watch_task.lock() = Some(task);

        Ok(client)
    }

    async fn watch_loop(
        client: Arc<Self>,
        mut events: broadcast::Receiver<PeerEvent>,
        mut stop: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let Some(addr) = parse_addr(&client.service_name, &event.key) else {
                            continue;
                        };
                        match event.kind {
                            PeerEventKind::Put => {
                                client.ring.add(&[addr]);
                            }
                            PeerEventKind::Delete => {
                                client.ring.remove(&addr);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Cluster membership events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Address of the node owning `key`, if any node is known.
    pub fn node_for(&self, key: &str) -> Option<String> {
        self.ring.get(key)
    }

    /// Fetch a value from the owning node.
    pub async fn get(
        &self,
        group: &str,
        key: &str,
    ) -> std::result::Result<Option<ByteView>, ClientError> {
        let node = self.node_for(key).ok_or(ClientError::NoPeer)?;
        let resp = self
            .http
            .get(format!("http://{node}/rpc/groups/{group}/entry"))
            .query(&[("key", key)])
            .send()
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(ClientError::Remote(format!(
                "{node} answered {}",
                resp.status()
            )));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))?;
        Ok(Some(ByteView::from(body)))
    }

    /// Write a value through the owning node. The gateway marker makes the
    /// node propagate the write across the cluster.
    pub async fn set(
        &self,
        group: &str,
        key: &str,
        value: ByteView,
    ) -> std::result::Result<bool, ClientError> {
        let node = self.node_for(key).ok_or(ClientError::NoPeer)?;
        let resp = self
            .http
            .put(format!("http://{node}/rpc/groups/{group}/entry"))
            .query(&[("key", key)])
            .header(GATEWAY_HEADER, "true")
            .body(value.to_vec())
            .send()
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))?;
        Self::ack(node, resp).await
    }

    /// Delete a key through the owning node, broadcast cluster-wide.
    pub async fn delete(
        &self,
        group: &str,
        key: &str,
    ) -> std::result::Result<bool, ClientError> {
        let node = self.node_for(key).ok_or(ClientError::NoPeer)?;
        let resp = self
            .http
            .delete(format!("http://{node}/rpc/groups/{group}/entry"))
            .query(&[("key", key)])
            .header(GATEWAY_HEADER, "true")
            .send()
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))?;
        Self::ack(node, resp).await
    }

    async fn ack(
        node: String,
        resp: reqwest::Response,
    ) -> std::result::Result<bool, ClientError> {
        if !resp.status().is_success() {
            return Err(ClientError::Remote(format!(
                "{node} answered {}",
                resp.status()
            )));
        }
        #[derive(serde::Deserialize)]
        struct Ack {
            success: bool,
        }
        let ack: Ack = resp
            .json()
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))?;
        Ok(ack.success)
    }

    /// Stop following membership changes.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(());
        let task = self.watch_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
    }
}
