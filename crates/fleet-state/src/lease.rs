//! Leader leases: time-bounded mutual exclusion across processes.
//!
//! A [`LeaderLock`] hands out leases keyed by lock path. Holders must renew
//! before the TTL elapses or another instance may take over. [`Lease`] wraps
//! acquisition with a background renewal task.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, map_err};
use crate::tables::LEASES;

/// Lower bound on the acquire poll / renewal period.
const MIN_TICK: Duration = Duration::from_millis(50);

/// Lease-based distributed mutex.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Take the lease if it is free, expired, or already ours.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> StateResult<bool>;

    /// Extend a lease we hold. Returns `false` if it was lost.
    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> StateResult<bool>;

    /// Give the lease up. Releasing a lease held by someone else is a no-op.
    async fn release(&self, key: &str, holder: &str) -> StateResult<()>;
}

/// Persisted lease state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct LeaseRecord {
    holder: String,
    /// Unix epoch milliseconds.
    expires_at: u64,
}

impl StateStore {
    fn read_lease(
        table: &impl ReadableTable<&'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<Option<LeaseRecord>> {
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Write a fresh lease for `holder` when `admit` accepts the current one.
    fn put_lease_if(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        admit: impl Fn(Option<&LeaseRecord>, u64) -> bool,
    ) -> StateResult<bool> {
        if key.is_empty() {
            return Err(StateError::InvalidLease {
                key: key.to_string(),
                reason: "empty lock key",
            });
        }
        if ttl.is_zero() {
            return Err(StateError::InvalidLease {
                key: key.to_string(),
                reason: "ttl must be non-zero",
            });
        }
        self.write(LEASES, |table| {
            let now = epoch_millis();
            let current = Self::read_lease(&*table, key)?;
            if !admit(current.as_ref(), now) {
                return Ok((false, Vec::new()));
            }
            let record = LeaseRecord {
                holder: holder.to_string(),
                expires_at: now + ttl.as_millis() as u64,
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
            Ok((true, Vec::new()))
        })
    }

    /// Current holder of a lease, if any and not expired.
    pub fn lease_holder(&self, key: &str) -> StateResult<Option<String>> {
        let Some(bytes) = self.read_value(LEASES, key)? else {
            return Ok(None);
        };
        let record: LeaseRecord =
            serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
        Ok((record.expires_at > epoch_millis()).then_some(record.holder))
    }
}

#[async_trait]
impl LeaderLock for StateStore {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> StateResult<bool> {
        self.put_lease_if(key, holder, ttl, |current, now| match current {
            None => true,
            Some(lease) => lease.holder == holder || lease.expires_at <= now,
        })
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> StateResult<bool> {
        self.put_lease_if(key, holder, ttl, |current, now| {
            matches!(current, Some(lease) if lease.holder == holder && lease.expires_at > now)
        })
    }

    async fn release(&self, key: &str, holder: &str) -> StateResult<()> {
        self.write(LEASES, |table| {
            if let Some(lease) = Self::read_lease(&*table, key)?
                && lease.holder == holder
            {
                table.remove(key).map_err(map_err!(Write))?;
            }
            Ok(((), Vec::new()))
        })
    }
}

/// A held lease with background renewal.
///
/// The [`lost`](Lease::lost) token fires if a renewal fails, at which point
/// the holder must stop doing leader-only work.
pub struct Lease {
    lock: Arc<dyn LeaderLock>,
    key: String,
    holder: String,
    lost: CancellationToken,
    stop: CancellationToken,
    renewal: JoinHandle<()>,
}

impl Lease {
    /// Block until the lease is acquired, or return `None` if `cancel` fires first.
    pub async fn acquire(
        lock: Arc<dyn LeaderLock>,
        key: &str,
        holder: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> StateResult<Option<Self>> {
        let tick = (ttl / 3).max(MIN_TICK);
        loop {
            if lock.try_acquire(key, holder, ttl).await? {
                break;
            }
            debug!(%key, %holder, "lease held elsewhere, waiting");
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
        info!(%key, %holder, "lease acquired");

        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let renewal = tokio::spawn(renew_loop(
            Arc::clone(&lock),
            key.to_string(),
            holder.to_string(),
            ttl,
            tick,
            lost.clone(),
            stop.clone(),
        ));

        Ok(Some(Self {
            lock,
            key: key.to_string(),
            holder: holder.to_string(),
            lost,
            stop,
            renewal,
        }))
    }

    /// Token cancelled when the lease can no longer be renewed.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop renewing and release the lease.
    pub async fn release(self) -> StateResult<()> {
        self.stop.cancel();
        if let Err(e) = self.renewal.await {
            warn!(key = %self.key, error = %e, "lease renewal task failed");
        }
        self.lock.release(&self.key, &self.holder).await?;
        info!(key = %self.key, holder = %self.holder, "lease released");
        Ok(())
    }
}

async fn renew_loop(
    lock: Arc<dyn LeaderLock>,
    key: String,
    holder: String,
    ttl: Duration,
    tick: Duration,
    lost: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = stop.cancelled() => return,
        }
        match lock.renew(&key, &holder, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%key, %holder, "lease lost to another holder");
                lost.cancel();
                return;
            }
            Err(e) => {
                warn!(%key, %holder, error = %e, "lease renewal failed");
                lost.cancel();
                return;
            }
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
