//! Cache of fetched include fragments, shared across compilations.

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;

use super::directive::IncludeIdentity;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let Ok(by) = chrono::Duration::from_std(by) else {
            return;
        };
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// A cached fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub fragment: Value,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.fetched_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }
}

/// Cache key of an include: sha256 hex of its identity.
pub fn cache_key(identity: &IncludeIdentity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.kind.as_str().as_bytes());
    for part in [
        Some(&identity.location),
        identity.project.as_ref(),
        identity.git_ref.as_ref(),
        identity.job.as_ref(),
    ] {
        hasher.update([0u8]);
        if let Some(part) = part {
            hasher.update(part.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

/// Pluggable fragment storage.
///
/// Implementations must be safe for concurrent use. Entries are replaced
/// wholesale; readers never see a partial entry.
pub trait FragmentCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;
    fn insert(&self, entry: CacheEntry);
    fn invalidate(&self, key: &str);
}

/// In-process cache backed by moka.
pub struct MemoryCache {
    entries: Cache<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::new(capacity),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

impl FragmentCache for MemoryCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key)
    }

    fn insert(&self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    fn invalidate(&self, key: &str) {
        self.entries.invalidate(key);
    }
}

/// A cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl FragmentCache for NoCache {
    fn get(&self, _key: &str) -> Option<CacheEntry> {
        None
    }

    fn insert(&self, _entry: CacheEntry) {}

    fn invalidate(&self, _key: &str) {}
}
