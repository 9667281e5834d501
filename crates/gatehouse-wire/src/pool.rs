//! Connection pool — shared, reference-counted gateway connections.
//!
//! Entries are keyed by [`build_cache_key`], a fingerprint of the gateway id
//! and every connection-relevant config field. The first `acquire` for a key
//! spawns a single connect task; concurrent acquirers for the same key await
//! that task's shared outcome instead of opening their own socket. A failed
//! connect leaves no entry behind. An idle entry due for a liveness probe is
//! pinged by the same kind of task, with the slot back in `Connecting`
//! until the ping settles, so nobody leases a connection mid-probe.
//!
//! `release` never closes. Unreferenced connections stay cached until the
//! sweeper evicts them after `idle_ttl`, or until the pool is shut down.

use crate::error::WireError;
use crate::transport::{ConnectionHandle, GatewayConnector};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use gatehouse_types::{GatewayConfig, PoolConfig};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), WireError>>>;

/// Fingerprint of a gateway identity plus its connection config.
///
/// Deterministic, and distinct whenever `url`, `token`,
/// `disable_device_pairing` or `allow_insecure_tls` differ. The token only
/// enters through a digest, so keys are safe to log.
pub fn build_cache_key(gateway_id: &str, config: &GatewayConfig) -> String {
    let mut hasher = Sha256::new();
    for field in [config.url.as_bytes(), config.token.as_bytes()] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hasher.update([
        config.disable_device_pairing as u8,
        config.allow_insecure_tls as u8,
    ]);
    let digest = hasher.finalize();
    format!("{gateway_id}:{}", hex::encode(&digest[..16]))
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    OpenIdle,
    OpenBusy,
    Closed,
}

/// Snapshot of the pool, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub entries: usize,
    pub connecting: usize,
    pub idle: usize,
    pub busy: usize,
    /// Closed connections not yet replaced or evicted.
    pub closed: usize,
    /// Outstanding leases across all entries.
    pub references: usize,
}

/// A connection checked out of the pool.
///
/// Hand it back with [`PoolHandle::release`] exactly once.
pub struct PoolLease {
    connection: ConnectionHandle,
    cache_key: String,
    generation: u64,
}

impl PoolLease {
    /// A lease not backed by a [`ConnectionPool`] entry, for other
    /// [`PoolHandle`] implementations. Releasing it into a `ConnectionPool`
    /// is a no-op.
    pub fn detached(connection: ConnectionHandle, cache_key: impl Into<String>) -> Self {
        Self {
            connection,
            cache_key: cache_key.into(),
            generation: 0,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("cache_key", &self.cache_key)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Pooled connection access, as seen by the facade.
#[async_trait]
pub trait PoolHandle: Send + Sync {
    /// Check out a connection for `(gateway_id, config)`, connecting if needed.
    async fn acquire(&self, gateway_id: &str, config: &GatewayConfig)
        -> Result<PoolLease, WireError>;

    /// Return a lease. The connection stays cached.
    fn release(&self, lease: PoolLease);

    fn stats(&self) -> PoolStats {
        PoolStats::default()
    }
}

struct PoolEntry {
    connection: ConnectionHandle,
    generation: u64,
    ref_count: usize,
    last_used: Instant,
}

impl PoolEntry {
    fn state(&self) -> ConnectionState {
        if !self.connection.is_open() {
            ConnectionState::Closed
        } else if self.ref_count == 0 {
            ConnectionState::OpenIdle
        } else {
            ConnectionState::OpenBusy
        }
    }
}

enum Slot {
    Connecting {
        generation: u64,
        attempt: ConnectAttempt,
    },
    Ready(PoolEntry),
}

enum Claim {
    /// A live entry was checked out.
    Leased(PoolLease),
    /// A connect or liveness probe is in flight. `stale` is a dead
    /// connection it replaces.
    Wait {
        attempt: ConnectAttempt,
        stale: Option<ConnectionHandle>,
    },
}

/// Process-wide gateway connection pool.
pub struct ConnectionPool {
    connector: Arc<dyn GatewayConnector>,
    config: PoolConfig,
    slots: Arc<DashMap<String, Slot>>,
    next_generation: AtomicU64,
    shut_down: Arc<AtomicBool>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn GatewayConnector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            slots: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// State of the entry cached for `(gateway_id, config)`, if any.
    pub fn state(&self, gateway_id: &str, config: &GatewayConfig) -> Option<ConnectionState> {
        let key = build_cache_key(gateway_id, config);
        self.slots.get(&key).map(|slot| match slot.value() {
            Slot::Connecting { .. } => ConnectionState::Connecting,
            Slot::Ready(entry) => entry.state(),
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Close and drop unreferenced entries idle past `idle_ttl`, and any that
    /// are already closed. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let ttl = self.config.idle_ttl();
        let mut evicted: Vec<(String, ConnectionHandle)> = Vec::new();
        self.slots.retain(|key, slot| match slot {
            Slot::Ready(entry)
                if entry.ref_count == 0
                    && (entry.last_used.elapsed() >= ttl || !entry.connection.is_open()) =>
            {
                evicted.push((key.clone(), Arc::clone(&entry.connection)));
                false
            }
            _ => true,
        });

        for (key, connection) in &evicted {
            connection.close().await;
            debug!(cache_key = %key, "Evicted idle gateway connection");
        }
        evicted.len()
    }

    /// Run [`evict_idle`](Self::evict_idle) every `sweep_interval` until the
    /// pool is shut down or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                if pool.is_shut_down() {
                    break;
                }
                let evicted = pool.evict_idle().await;
                if evicted > 0 {
                    info!(evicted, "Evicted idle gateway connections");
                }
            }
        })
    }

    /// Close every cached connection and refuse further acquires.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let keys: Vec<String> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        let mut connections = Vec::new();
        for key in keys {
            // Connect tasks that lose their slot close what they opened.
            if let Some((_, Slot::Ready(entry))) = self.slots.remove(&key) {
                connections.push(entry.connection);
            }
        }
        let closed = connections.len();
        for connection in connections {
            connection.close().await;
        }
        info!(closed, "Connection pool shut down");
    }

    /// Check out an existing entry, or start a connect for `key`.
    ///
    /// An idle entry due for a liveness probe leaves the cache while it is
    /// pinged: the slot turns back into `Connecting`, so concurrent acquirers
    /// wait on the probe instead of leasing a connection that may be about to
    /// close. `fresh` skips the probe for a caller that just waited on one.
    ///
    /// Runs under the shard lock for `key`; never awaits.
    fn claim(&self, key: &str, gateway_id: &str, config: &GatewayConfig, fresh: bool) -> Claim {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Slot::Connecting { attempt, .. } = occupied.get() {
                    return Claim::Wait {
                        attempt: attempt.clone(),
                        stale: None,
                    };
                }

                let (reuse, stale) = match occupied.get_mut() {
                    Slot::Ready(entry) if entry.connection.is_open() => {
                        let probe = !fresh
                            && entry.ref_count == 0
                            && entry.last_used.elapsed() >= self.config.probe_idle_after();
                        if !probe {
                            entry.ref_count += 1;
                            entry.last_used = Instant::now();
                            return Claim::Leased(PoolLease {
                                connection: Arc::clone(&entry.connection),
                                cache_key: key.to_string(),
                                generation: entry.generation,
                            });
                        }
                        (Some(Arc::clone(&entry.connection)), None)
                    }
                    Slot::Ready(entry) => {
                        debug!(cache_key = %key, "Cached gateway connection is closed; reconnecting");
                        (None, Some(Arc::clone(&entry.connection)))
                    }
                    Slot::Connecting { .. } => (None, None),
                };

                let (generation, attempt) = self.start_connect(key, gateway_id, config, reuse);
                occupied.insert(Slot::Connecting {
                    generation,
                    attempt: attempt.clone(),
                });
                Claim::Wait { attempt, stale }
            }
            Entry::Vacant(vacant) => {
                let (generation, attempt) = self.start_connect(key, gateway_id, config, None);
                vacant.insert(Slot::Connecting {
                    generation,
                    attempt: attempt.clone(),
                });
                Claim::Wait {
                    attempt,
                    stale: None,
                }
            }
        }
    }

    /// Spawn the connect task for `key`. With `reuse`, the task pings that
    /// idle connection first and only dials a new one if the ping fails.
    /// Either way the task installs its connection only if its own
    /// `Connecting` slot is still in place.
    fn start_connect(
        &self,
        key: &str,
        gateway_id: &str,
        config: &GatewayConfig,
        reuse: Option<ConnectionHandle>,
    ) -> (u64, ConnectAttempt) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let connector = Arc::clone(&self.connector);
        let slots = Arc::clone(&self.slots);
        let shut_down = Arc::clone(&self.shut_down);
        let key = key.to_string();
        let gateway_id = gateway_id.to_string();
        let config = config.clone();

        let task = tokio::spawn(async move {
            let reused = match reuse {
                Some(existing) if existing.ping().await => Some(existing),
                Some(existing) => {
                    warn!(gateway_id = %gateway_id, cache_key = %key, "Idle gateway connection failed liveness probe");
                    existing.close().await;
                    None
                }
                None => None,
            };

            let connection = match reused {
                Some(connection) => connection,
                None => {
                    debug!(gateway_id = %gateway_id, cache_key = %key, "Opening pooled gateway connection");
                    match connector.connect(&config).await {
                        Ok(connection) => connection,
                        Err(e) => {
                            slots.remove_if(&key, |_, slot| is_attempt(slot, generation));
                            warn!(gateway_id = %gateway_id, error = %e, "Pooled gateway connect failed");
                            return Err(e);
                        }
                    }
                }
            };

            let installed = match slots.get_mut(&key) {
                Some(mut slot) if is_attempt(&slot, generation) && !shut_down.load(Ordering::SeqCst) => {
                    *slot = Slot::Ready(PoolEntry {
                        connection: Arc::clone(&connection),
                        generation,
                        ref_count: 0,
                        last_used: Instant::now(),
                    });
                    true
                }
                _ => false,
            };
            if !installed {
                connection.close().await;
                return Err(WireError::ConnectFailed(
                    "Connection pool shut down during connect".to_string(),
                ));
            }
            info!(gateway_id = %gateway_id, cache_key = %key, "Pooled gateway connection ready");
            Ok(())
        });

        let attempt = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(WireError::ConnectFailed(format!("Connect task failed: {e}"))),
            }
        }
        .boxed()
        .shared();
        (generation, attempt)
    }
}

fn is_attempt(slot: &Slot, generation: u64) -> bool {
    matches!(slot, Slot::Connecting { generation: g, .. } if *g == generation)
}

#[async_trait]
impl PoolHandle for ConnectionPool {
    async fn acquire(
        &self,
        gateway_id: &str,
        config: &GatewayConfig,
    ) -> Result<PoolLease, WireError> {
        let key = build_cache_key(gateway_id, config);
        // A connection this call just waited for needs no probe.
        let mut fresh = false;
        loop {
            if self.is_shut_down() {
                return Err(WireError::ConnectFailed(
                    "Connection pool is shut down".to_string(),
                ));
            }
            // No await between a lease being counted and handed back, so a
            // dropped acquire never leaks a reference.
            match self.claim(&key, gateway_id, config, fresh) {
                Claim::Leased(lease) => return Ok(lease),
                Claim::Wait { attempt, stale } => {
                    if let Some(stale) = stale {
                        stale.close().await;
                    }
                    attempt.await?;
                    fresh = true;
                }
            }
        }
    }

    fn release(&self, lease: PoolLease) {
        let mut released = false;
        if let Some(mut slot) = self.slots.get_mut(&lease.cache_key) {
            if let Slot::Ready(entry) = slot.value_mut() {
                if entry.generation == lease.generation {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    entry.last_used = Instant::now();
                    released = true;
                }
            }
        }
        if !released {
            debug!(cache_key = %lease.cache_key, "Released lease for a connection no longer pooled");
        }
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for slot in self.slots.iter() {
            stats.entries += 1;
            match slot.value() {
                Slot::Connecting { .. } => stats.connecting += 1,
                Slot::Ready(entry) => {
                    stats.references += entry.ref_count;
                    match entry.state() {
                        ConnectionState::OpenIdle => stats.idle += 1,
                        ConnectionState::OpenBusy => stats.busy += 1,
                        ConnectionState::Closed => stats.closed += 1,
                        ConnectionState::Connecting => stats.connecting += 1,
                    }
                }
            }
        }
        stats
    }
}
