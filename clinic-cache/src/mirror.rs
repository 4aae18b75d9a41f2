//! Persistent mirror abstraction and an in-process implementation.
//!
//! The mirror is a flat string key/value store shaped like browser
//! `localStorage`: items addressed by key, enumerable by index, bounded by a
//! byte quota. The cache store writes a JSON document per entry into it so
//! that entries survive a process restart within the same session.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use clinic_core::MirrorError;

/// Key/value string store backing the persistent cache tier.
///
/// Implementations must be thread-safe. `key(index)` enumerates keys in an
/// implementation-defined but stable order while the store is unchanged.
pub trait PersistentMirror: Send + Sync {
    /// Read the value stored under `key`.
    fn get_item(&self, key: &str) -> Result<Option<String>, MirrorError>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// Returns [`MirrorError::QuotaExceeded`] when the write would exceed the
    /// store's budget.
    fn set_item(&self, key: &str, value: &str) -> Result<(), MirrorError>;

    /// Remove `key`, returning whether it was present.
    fn remove_item(&self, key: &str) -> Result<bool, MirrorError>;

    /// Key at position `index`, or `None` past the end.
    fn key(&self, index: usize) -> Result<Option<String>, MirrorError>;

    /// Number of stored items.
    fn len(&self) -> Result<usize, MirrorError>;

    fn is_empty(&self) -> Result<bool, MirrorError> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of every key.
    ///
    /// The default walks `key(0..len)`; backends with a cheaper cursor
    /// should override it.
    fn keys(&self) -> Result<Vec<String>, MirrorError> {
        let len = self.len()?;
        let mut keys = Vec::with_capacity(len);
        for index in 0..len {
            if let Some(key) = self.key(index)? {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[derive(Debug, Default)]
struct MemoryMirrorInner {
    items: BTreeMap<String, String>,
    used_bytes: usize,
}

/// In-process mirror with a byte quota.
///
/// Usage is counted as key bytes plus value bytes, the way browsers account
/// `localStorage`. Keys enumerate in sorted order.
#[derive(Debug)]
pub struct MemoryMirror {
    inner: Mutex<MemoryMirrorInner>,
    quota_bytes: usize,
}

impl MemoryMirror {
    /// Create a mirror bounded to `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryMirrorInner::default()),
            quota_bytes,
        }
    }

    /// Bytes currently accounted against the quota.
    pub fn used_bytes(&self) -> usize {
        self.lock().used_bytes
    }

    pub fn quota_bytes(&self) -> usize {
        self.quota_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryMirrorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryMirror {
    fn default() -> Self {
        Self::with_quota(clinic_core::config::DEFAULT_PERSISTENT_BUDGET_BYTES)
    }
}

impl PersistentMirror for MemoryMirror {
    fn get_item(&self, key: &str) -> Result<Option<String>, MirrorError> {
        Ok(self.lock().items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        let previous = inner
            .items
            .get(key)
            .map(|old| key.len() + old.len())
            .unwrap_or(0);
        let incoming = key.len() + value.len();
        let projected = inner.used_bytes - previous + incoming;
        if projected > self.quota_bytes {
            return Err(MirrorError::QuotaExceeded {
                key: key.to_string(),
                bytes: incoming,
            });
        }
        inner.items.insert(key.to_string(), value.to_string());
        inner.used_bytes = projected;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<bool, MirrorError> {
        let mut inner = self.lock();
        match inner.items.remove(key) {
            Some(old) => {
                inner.used_bytes = inner.used_bytes.saturating_sub(key.len() + old.len());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn key(&self, index: usize) -> Result<Option<String>, MirrorError> {
        Ok(self.lock().items.keys().nth(index).cloned())
    }

    fn len(&self) -> Result<usize, MirrorError> {
        Ok(self.lock().items.len())
    }

    fn keys(&self) -> Result<Vec<String>, MirrorError> {
        Ok(self.lock().items.keys().cloned().collect())
    }
}
