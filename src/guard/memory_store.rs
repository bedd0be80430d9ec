//! In-process guard store for single-instance deployments and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::health::{DependencyHealth, HealthCheckable};

use super::{GuardError, GuardStore};

/// Writes between two sweeps of expired keys
const SWEEP_EVERY: u64 = 256;

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Counter(u64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    ttl: Duration,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// DashMap-backed store with per-key expiry.
///
/// Expired keys are dropped when read, and every `SWEEP_EVERY` writes a
/// full sweep removes the ones nobody reads again (processed markers are
/// written once per job id). `set_offline` simulates a store outage: every
/// operation fails until it is switched back.
pub struct MemoryGuardStore {
    entries: DashMap<String, Entry>,
    offline: AtomicBool,
    writes: AtomicU64,
}

impl MemoryGuardStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            offline: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Expiry window the live key at `key` was written with.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.ttl)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        self.entries.retain(|_, entry| {
            if entry.is_live(now) {
                true
            } else {
                expired += 1;
                false
            }
        });

        if expired > 0 {
            tracing::debug!(expired = expired, "Swept expired guard keys");
        }
        expired
    }

    /// Must run before any entry guard is taken; `retain` locks every shard.
    fn record_write(&self) {
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.cleanup_expired();
        }
    }

    fn ensure_online(&self) -> Result<(), GuardError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GuardError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryGuardStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GuardStore for MemoryGuardStore {
    async fn exists(&self, key: &str) -> Result<bool, GuardError> {
        self.ensure_online()?;
        let now = Instant::now();
        let live = self.entries.get(key).map(|e| e.is_live(now));
        match live {
            Some(true) => Ok(true),
            Some(false) => {
                self.entries.remove_if(key, |_, e| !e.is_live(now));
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), GuardError> {
        self.ensure_online()?;
        self.record_write();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Text(value.to_string()),
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<u64, GuardError> {
        self.ensure_online()?;
        self.record_write();
        let now = Instant::now();

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: StoredValue::Counter(0),
            ttl: window,
            expires_at: now + window,
        });

        if !entry.is_live(now) {
            *entry = Entry {
                value: StoredValue::Counter(0),
                ttl: window,
                expires_at: now + window,
            };
        }

        match &mut entry.value {
            StoredValue::Counter(count) => {
                *count += 1;
                Ok(*count)
            }
            StoredValue::Text(text) => Err(GuardError::MalformedValue {
                key: key.to_string(),
                detail: format!("expected integer counter, found '{}'", text),
            }),
        }
    }
}

#[async_trait]
impl HealthCheckable for MemoryGuardStore {
    fn name(&self) -> &str {
        "guard_store"
    }

    async fn check_health(&self) -> DependencyHealth {
        if self.offline.load(Ordering::SeqCst) {
            DependencyHealth::unhealthy("memory store offline")
        } else {
            DependencyHealth::healthy()
        }
    }
}
