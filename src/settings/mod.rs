// Settings: persisted preferences, their validation, and resilient reads.

pub mod model;
pub mod sanitize;
pub mod store;

use std::time::Duration;

use anyhow::Result;
use tracing::{error, warn};

use crate::config::{STORE_READ_ATTEMPTS, STORE_RETRY_DELAY_MS};
use model::{Settings, StorageMap};
use store::SettingsStore;

/// Read from the store, retrying a fixed number of times with a short delay.
pub async fn read_with_retry(store: &dyn SettingsStore, defaults: &StorageMap) -> Result<StorageMap> {
    let mut attempt = 1;
    loop {
        match store.get(defaults).await {
            Ok(values) => return Ok(values),
            Err(e) if attempt < STORE_READ_ATTEMPTS => {
                warn!("settings read failed (attempt {}): {}", attempt, e);
                tokio::time::sleep(Duration::from_millis(STORE_RETRY_DELAY_MS)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write to the store with the same retry policy as [`read_with_retry`].
pub async fn write_with_retry(store: &dyn SettingsStore, values: StorageMap) -> Result<()> {
    let mut attempt = 1;
    loop {
        match store.set(values.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < STORE_READ_ATTEMPTS => {
                warn!("settings write failed (attempt {}): {}", attempt, e);
                tokio::time::sleep(Duration::from_millis(STORE_RETRY_DELAY_MS)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Load validated settings, falling back to a disabled state if the store
/// stays unreadable.
pub async fn load_settings(store: &dyn SettingsStore) -> Settings {
    match read_with_retry(store, &Settings::defaults_map()).await {
        Ok(values) => Settings::from_storage(&values),
        Err(e) => {
            error!("settings unavailable, treating control as disabled: {}", e);
            Settings::disabled_fallback()
        }
    }
}
