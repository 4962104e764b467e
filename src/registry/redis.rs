//! Redis-backed service registry.
//!
//! Registrations are plain keys with a server-side expiry standing in for
//! a lease: `SET /services/{service}/{addr} {addr} EX {ttl}`. A keepalive
//! task refreshes the key at a third of the TTL, so a crashed node's entry
//! disappears within one lease period. Membership events travel over a
//! pub/sub channel per service; lease expiries observed through keyspace
//! notifications (when the server emits them) are forwarded as deletes.

use super::{service_key, service_prefix, PeerEvent, PeerEventKind, ServiceRegistry};
use crate::error::RegistryError;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;

/// Pattern matching redis keyspace expiry notifications on any database.
const EXPIRED_PATTERN: &str = "__keyevent@*__:expired";

/// Pub/sub channel carrying membership events for a service.
fn events_channel(service: &str) -> String {
    format!("meshcache:services:{service}")
}

/// Wire form of a membership event.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    op: String,
    key: String,
}

/// Configuration for [`RedisRegistry`].
#[derive(Debug, Clone)]
pub struct RedisRegistryConfig {
    /// Redis server URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Lease TTL in seconds; the keepalive refreshes at a third of this.
    pub lease_ttl_secs: u64,
    /// Timeout for establishing the initial connection.
    pub connection_timeout: Duration,
}

impl Default for RedisRegistryConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            lease_ttl_secs: 10,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// This instance's live registration.
struct Registration {
    key: String,
    stop: broadcast::Sender<()>,
    keepalive: JoinHandle<()>,
}

/// Service registry over a redis coordination store.
pub struct RedisRegistry {
    client: redis::Client,
    conn: MultiplexedConnection,
    config: RedisRegistryConfig,
    registration: Mutex<Option<Registration>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisRegistry {
    /// Connect to the coordination store.
    ///
    /// Fails visibly when the store is unreachable within the configured
    /// timeout; registry bootstrap failure is fatal for a node.
    pub async fn connect(config: RedisRegistryConfig) -> Result<Self, RegistryError> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = tokio::time::timeout(
            config.connection_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            RegistryError::Connection(format!(
                "timed out connecting to registry at {}",
                config.url
            ))
        })??;

        debug!(url = %config.url, "Connected to registry");
        Ok(Self {
            client,
            conn,
            config,
            registration: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
        })
    }

    async fn publish_event(&self, service: &str, op: &str, key: &str) {
        let payload = match serde_json::to_string(&WireEvent {
            op: op.to_string(),
            key: key.to_string(),
        }) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to encode registry event");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .publish::<_, _, i64>(events_channel(service), payload)
            .await
        {
            warn!(error = %e, "Failed to publish registry event");
        }
    }

    /// Stop watch tasks spawned by [`watch`]. Called on node shutdown.
    ///
    /// [`watch`]: ServiceRegistry::watch
    pub fn stop_watchers(&self) {
        for task in self.watchers.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for RedisRegistry {
    fn drop(&mut self) {
        self.stop_watchers();
        if let Some(registration) = self.registration.lock().take() {
            let _ = registration.stop.send(());
            registration.keepalive.abort();
        }
    }
}

#[async_trait]
impl ServiceRegistry for RedisRegistry {
    async fn register(&self, service: &str, addr: &str) -> Result<(), RegistryError> {
        if addr.is_empty() {
            return Err(RegistryError::Registration("empty address".to_string()));
        }

        // Re-registration replaces the previous lease.
        if let Some(old) = self.registration.lock().take() {
            let _ = old.stop.send(());
            old.keepalive.abort();
        }

        let key = service_key(service, addr);
        let ttl = self.config.lease_ttl_secs;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(&key, addr, ttl).await?;
        self.publish_event(service, "put", &key).await;

        let (stop, mut stop_rx) = broadcast::channel::<()>(1);
        let keepalive = {
            let mut conn = self.conn.clone();
            let key = key.clone();
            let addr = addr.to_string();
            let refresh = Duration::from_secs((ttl / 3).max(1));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(refresh);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await; // first tick fires immediately
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = conn.set_ex::<_, _, ()>(&key, &addr, ttl).await {
                                warn!(key = %key, error = %e, "Lease refresh failed");
                            }
                        }
                        _ = stop_rx.recv() => break,
                    }
                }
                debug!(key = %key, "Keepalive loop exited");
            })
        };

        *self.registration.lock() = Some(Registration {
            key: key.clone(),
            stop,
            keepalive,
        });
        info!(key = %key, "Service registered");
        Ok(())
    }

    async fn unregister(&self) -> Result<(), RegistryError> {
        let Some(registration) = self.registration.lock().take() else {
            return Ok(());
        };
        let _ = registration.stop.send(());
        let _ = registration.keepalive.await;

        let mut conn = self.conn.clone();
        conn.del::<_, i64>(&registration.key).await?;

        // The key is /services/{service}/{addr}; recover the service name
        // for the event channel.
        if let Some(rest) = registration.key.strip_prefix("/services/") {
            if let Some((service, _)) = rest.split_once('/') {
                self.publish_event(service, "delete", &registration.key)
                    .await;
            }
        }
        info!(key = %registration.key, "Service unregistered");
        Ok(())
    }

    async fn list(&self, service: &str) -> Result<Vec<String>, RegistryError> {
        let prefix = service_prefix(service);
        let pattern = format!("{prefix}*");
        let mut conn = self.conn.clone();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        let mut addrs = Vec::new();
        while let Some(key) = iter.next_item().await {
            if let Some(addr) = super::parse_addr(service, &key) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }

    async fn watch(
        &self,
        service: &str,
    ) -> Result<broadcast::Receiver<PeerEvent>, RegistryError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(events_channel(service)).await?;
        // Best effort: servers without keyspace notifications simply never
        // deliver on this pattern, and expiry is observed at the next
        // reconciliation instead.
        if let Err(e) = pubsub.psubscribe(EXPIRED_PATTERN).await {
            warn!(error = %e, "Expiry notifications unavailable");
        }

        let (tx, rx) = broadcast::channel(EVENT_BUFFER);
        let prefix = service_prefix(service);
        let channel = events_channel(service);

        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                let event = if msg.get_channel_name() == channel {
                    match serde_json::from_str::<WireEvent>(&payload) {
                        Ok(wire) => {
                            let kind = match wire.op.as_str() {
                                "put" => PeerEventKind::Put,
                                "delete" => PeerEventKind::Delete,
                                other => {
                                    debug!(op = %other, "Unknown registry event");
                                    continue;
                                }
                            };
                            PeerEvent {
                                kind,
                                key: wire.key,
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Malformed registry event");
                            continue;
                        }
                    }
                } else {
                    // Keyspace expiry notification: payload is the key.
                    if !payload.starts_with(&prefix) {
                        continue;
                    }
                    PeerEvent {
                        kind: PeerEventKind::Delete,
                        key: payload,
                    }
                };

                if tx.send(event).is_err() {
                    // Every subscriber is gone; the watch is cancelled.
                    break;
                }
            }
            debug!("Registry watch stream closed");
        });
        self.watchers.lock().push(task);

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_naming_is_per_service() {
        assert_eq!(events_channel("meshcache"), "meshcache:services:meshcache");
        assert_ne!(events_channel("a"), events_channel("b"));
    }

    #[test]
    fn default_config_matches_lease_contract() {
        let config = RedisRegistryConfig::default();
        // Keepalive cadence is a third of the lease TTL.
        assert_eq!(config.lease_ttl_secs / 3, 3);
    }

    #[test]
    fn wire_event_round_trips() {
        let wire = WireEvent {
            op: "put".to_string(),
            key: "/services/meshcache/1.2.3.4:7000".to_string(),
        };
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.op, "put");
        assert_eq!(back.key, wire.key);
    }
}
