//! Provider public keys keyed by certificate serial.

mod source;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use source::{CertificateSource, PemFileSource, PemSource, SerialScheme};

use crate::error::{PaySignError, Result};
use crate::signing::VerifyingKey;

/// One provider key. Bare public keys have no expiry.
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    pub serial: String,
    pub public_key: Arc<VerifyingKey>,
    pub not_after: Option<DateTime<Utc>>,
}

impl CertificateEntry {
    pub fn new(serial: impl Into<String>, public_key: VerifyingKey, not_after: Option<DateTime<Utc>>) -> Self {
        Self {
            serial: serial.into(),
            public_key: Arc::new(public_key),
            not_after,
        }
    }
}

#[derive(Debug, Default)]
struct LockStats {
    reads: AtomicU64,
    writes: AtomicU64,
    refreshes: AtomicU64,
}

/// Serial → key map behind a reader-writer lock.
///
/// Hits share the read lock. A miss takes the write lock, re-checks, and
/// fetches from the source at most once before giving up with
/// [`PaySignError::PublicKeyNotFound`]. Nothing is evicted on a timer.
pub struct CertificateCache {
    entries: RwLock<HashMap<String, CertificateEntry>>,
    source: Option<Arc<dyn CertificateSource>>,
    stats: LockStats,
}

impl CertificateCache {
    pub fn new(source: Arc<dyn CertificateSource>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            source: Some(source),
            stats: LockStats::default(),
        }
    }

    /// A cache with a fixed key set; misses never refresh.
    pub fn fixed(entries: impl IntoIterator<Item = CertificateEntry>) -> Self {
        let map = entries
            .into_iter()
            .map(|entry| (entry.serial.clone(), entry))
            .collect();
        Self {
            entries: RwLock::new(map),
            source: None,
            stats: LockStats::default(),
        }
    }

    /// Key for `serial`, refreshing once from the source on a miss.
    pub async fn resolve(&self, serial: &str, cancel: &CancellationToken) -> Result<Arc<VerifyingKey>> {
        if let Some(key) = self.lookup(serial).await {
            return Ok(key);
        }

        let Some(source) = &self.source else {
            return Err(PaySignError::PublicKeyNotFound(serial.to_string()));
        };

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().await;
        // Another task may have refreshed while this one waited.
        if let Some(entry) = entries.get(serial) {
            return Ok(Arc::clone(&entry.public_key));
        }

        debug!(serial, "certificate cache miss, refreshing");
        let fetched = source.fetch(cancel).await.inspect_err(|e| {
            warn!(serial, error = %e, "certificate refresh failed");
        })?;
        self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
        for entry in fetched {
            entries.insert(entry.serial.clone(), entry);
        }

        entries
            .get(serial)
            .map(|entry| Arc::clone(&entry.public_key))
            .ok_or_else(|| PaySignError::PublicKeyNotFound(serial.to_string()))
    }

    /// Key for `serial` without touching the source.
    pub async fn lookup(&self, serial: &str) -> Option<Arc<VerifyingKey>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.read().await;
        entries.get(serial).map(|entry| Arc::clone(&entry.public_key))
    }

    pub async fn insert(&self, entry: CertificateEntry) {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.entries.write().await.insert(entry.serial.clone(), entry);
    }

    /// Fetch the current set and merge it in. Returns how many entries the
    /// source produced.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<usize> {
        let Some(source) = &self.source else {
            return Ok(0);
        };
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().await;
        let fetched = source.fetch(cancel).await?;
        self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
        let count = fetched.len();
        for entry in fetched {
            entries.insert(entry.serial.clone(), entry);
        }
        debug!(count, total = entries.len(), "certificate cache refreshed");
        Ok(count)
    }

    /// Cached serials, sorted.
    pub async fn serials(&self) -> Vec<String> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let mut serials: Vec<String> = self.entries.read().await.keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Entry with the latest expiry, the one to encrypt sensitive fields to.
    pub async fn newest(&self) -> Option<CertificateEntry> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|entry| entry.not_after.is_some())
            .max_by_key(|entry| entry.not_after)
            .cloned()
    }

    pub fn read_acquisitions(&self) -> u64 {
        self.stats.reads.load(Ordering::Relaxed)
    }

    pub fn write_acquisitions(&self) -> u64 {
        self.stats.writes.load(Ordering::Relaxed)
    }

    /// Completed fetches from the source.
    pub fn refresh_count(&self) -> u64 {
        self.stats.refreshes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("has_source", &self.source.is_some())
            .field("writes", &self.write_acquisitions())
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}
