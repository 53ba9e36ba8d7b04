//! Tracked-port set and per-port exclusive hardware access.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

use crate::metrics;
use crate::modem::decode::SimReadiness;
use crate::modem::link::LinkProvider;
use crate::modem::{AtChannel, ChannelError};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedPort {
    pub port_id: String,
    pub description: String,
    pub readiness: SimReadiness,
    pub added_at: DateTime<Utc>,
}

/// Ports that passed a readiness probe. Discovery admits; discovery and the telemetry
/// poller evict.
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: RwLock<BTreeMap<String, TrackedPort>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the port was already tracked.
    pub async fn track(&self, port: TrackedPort) -> bool {
        let mut ports = self.ports.write().await;
        if ports.contains_key(&port.port_id) {
            return false;
        }
        info!("Tracking {} ({})", port.port_id, port.description);
        ports.insert(port.port_id.clone(), port);
        true
    }

    pub async fn evict(&self, port_id: &str, reason: &str) -> Option<TrackedPort> {
        let removed = self.ports.write().await.remove(port_id);
        if removed.is_some() {
            metrics::inc_port_evictions();
            info!("Evicted {}: {}", port_id, reason);
        }
        removed
    }

    /// Drop every tracked port not in `present`; returns the dropped ids.
    pub async fn retain(&self, present: &HashSet<String>) -> Vec<String> {
        let mut ports = self.ports.write().await;
        let gone: Vec<String> = ports.keys().filter(|p| !present.contains(*p)).cloned().collect();
        for port_id in &gone {
            ports.remove(port_id);
            metrics::inc_port_evictions();
            info!("Evicted {}: no longer enumerated", port_id);
        }
        gone
    }

    pub async fn contains(&self, port_id: &str) -> bool {
        self.ports.read().await.contains_key(port_id)
    }

    pub async fn port_ids(&self) -> Vec<String> {
        self.ports.read().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.ports.read().await.is_empty()
    }
}

/// One async mutex per port id, created on first use.
#[derive(Debug, Default)]
pub struct PortLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PortLocks {
    fn lock_for(&self, port_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(port_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, port_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(port_id).lock_owned().await
    }

    pub fn try_acquire(&self, port_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(port_id).try_lock_owned().ok()
    }
}

/// An open channel together with the port's lock. Dropping it closes the channel
/// first, then releases the port.
#[derive(Debug)]
pub struct PortSession {
    channel: AtChannel,
    _guard: OwnedMutexGuard<()>,
}

impl Deref for PortSession {
    type Target = AtChannel;

    fn deref(&self) -> &AtChannel {
        &self.channel
    }
}

impl DerefMut for PortSession {
    fn deref_mut(&mut self) -> &mut AtChannel {
        &mut self.channel
    }
}

/// Hardware entry point shared by every loop: the link provider, the lock table and
/// the serial parameters.
pub struct PortAccess {
    provider: Arc<dyn LinkProvider>,
    locks: PortLocks,
    baud_rate: u32,
    connect_policy: RetryPolicy,
    command_timeout: Duration,
}

impl PortAccess {
    pub fn new(
        provider: Arc<dyn LinkProvider>,
        baud_rate: u32,
        connect_policy: RetryPolicy,
        command_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            locks: PortLocks::default(),
            baud_rate,
            connect_policy,
            command_timeout,
        }
    }

    pub fn provider(&self) -> &dyn LinkProvider {
        self.provider.as_ref()
    }

    /// Wait for the port, then open it under the connect policy.
    pub async fn session(&self, port_id: &str) -> Result<PortSession, ChannelError> {
        let guard = self.locks.acquire(port_id).await;
        self.open_locked(port_id, guard, &self.connect_policy).await
    }

    /// Open with a single attempt if nobody else holds the port; `None` when busy.
    pub async fn try_session(&self, port_id: &str) -> Option<Result<PortSession, ChannelError>> {
        let Some(guard) = self.locks.try_acquire(port_id) else {
            debug!("{} busy, skipping", port_id);
            return None;
        };
        Some(self.open_locked(port_id, guard, &RetryPolicy::once()).await)
    }

    async fn open_locked(
        &self,
        port_id: &str,
        guard: OwnedMutexGuard<()>,
        policy: &RetryPolicy,
    ) -> Result<PortSession, ChannelError> {
        let channel = AtChannel::open(
            self.provider.as_ref(),
            port_id,
            self.baud_rate,
            policy,
            self.command_timeout,
        )
        .await?;
        Ok(PortSession {
            channel,
            _guard: guard,
        })
    }
}
