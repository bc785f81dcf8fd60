use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::model::{Namespace, StorageChange, StorageMap, ValueChange};

/// Persistent key-value settings with change fan-out.
///
/// Writers do not coordinate; the last write wins.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read every key in `defaults`, substituting the default for missing keys.
    async fn get(&self, defaults: &StorageMap) -> Result<StorageMap>;
    async fn set(&self, values: StorageMap) -> Result<()>;
    /// Subscribe to change notifications for all namespaces.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// In-process store holding the `sync` namespace.
pub struct MemoryStore {
    values: Mutex<StorageMap>,
    changes: broadcast::Sender<StorageChange>,
    failures_left: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_values(StorageMap::new())
    }

    pub fn with_values(values: StorageMap) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            values: Mutex::new(values),
            changes,
            failures_left: AtomicU32::new(0),
        }
    }

    /// Make the next `count` reads and writes fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StorageMap {
        self.values.lock().clone()
    }

    /// Publish a change for a namespace this store does not hold.
    pub fn notify_foreign(&self, namespace: Namespace, values: StorageMap) {
        let changes = values
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    ValueChange {
                        old_value: None,
                        new_value: Some(v),
                    },
                )
            })
            .collect();
        let _ = self.changes.send(StorageChange {
            changes,
            namespace,
        });
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(anyhow!("storage unavailable"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, defaults: &StorageMap) -> Result<StorageMap> {
        self.check_failure()?;
        let values = self.values.lock();
        Ok(defaults
            .iter()
            .map(|(k, default)| {
                let v = values.get(k).unwrap_or(default).clone();
                (k.clone(), v)
            })
            .collect())
    }

    async fn set(&self, values: StorageMap) -> Result<()> {
        self.check_failure()?;
        let mut changes = HashMap::new();
        {
            let mut current = self.values.lock();
            for (key, value) in values {
                let old = current.insert(key.clone(), value.clone());
                if old.as_ref() != Some(&value) {
                    changes.insert(
                        key,
                        ValueChange {
                            old_value: old,
                            new_value: Some(value),
                        },
                    );
                }
            }
        }
        if changes.is_empty() {
            return Ok(());
        }
        debug!("settings store write touched {} key(s)", changes.len());
        // No subscribers is fine.
        let _ = self.changes.send(StorageChange {
            changes,
            namespace: Namespace::Sync,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
