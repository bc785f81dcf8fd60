use std::collections::HashMap;

use serde_json::Value;

use super::sanitize::sanitize_with_default;
use crate::config::{DEFAULT_ENABLED, ENABLED_KEY};
use crate::detect::platform::Platform;
use crate::protocol::SettingsPayload;

/// Flat key-value view of the persisted settings.
pub type StorageMap = HashMap<String, Value>;

/// Storage area a change notification came from. Only `Sync` carries settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Sync,
    Local,
    Session,
    Managed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// One change notification: every key touched by a single write.
#[derive(Debug, Clone)]
pub struct StorageChange {
    pub changes: HashMap<String, ValueChange>,
    pub namespace: Namespace,
}

impl StorageChange {
    pub fn touches(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    pub fn new_value(&self, key: &str) -> Option<&Value> {
        self.changes.get(key).and_then(|c| c.new_value.as_ref())
    }

    /// True when the change affects the enabled flag or any platform speed.
    pub fn touches_settings(&self) -> bool {
        self.touches(ENABLED_KEY) || Platform::ALL.iter().any(|p| self.touches(p.speed_key()))
    }
}

/// Resolved, validated user settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub enabled: bool,
    pub speed_by_platform: HashMap<Platform, f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_ENABLED,
            speed_by_platform: Platform::ALL
                .into_iter()
                .map(|p| (p, p.default_speed()))
                .collect(),
        }
    }
}

impl Settings {
    /// Safe state used when the store cannot be read.
    pub fn disabled_fallback() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Keys and defaults to request from the store.
    pub fn defaults_map() -> StorageMap {
        Self::default().to_storage()
    }

    /// Build settings from raw store values, sanitizing every speed.
    pub fn from_storage(values: &StorageMap) -> Self {
        let enabled = values
            .get(ENABLED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(DEFAULT_ENABLED);
        let speed_by_platform = Platform::ALL
            .into_iter()
            .map(|p| {
                let default = p.default_speed();
                let speed = values
                    .get(p.speed_key())
                    .map(|v| sanitize_with_default(v, default, default))
                    .unwrap_or(default);
                (p, speed)
            })
            .collect();
        Self {
            enabled,
            speed_by_platform,
        }
    }

    pub fn to_storage(&self) -> StorageMap {
        let mut map = StorageMap::new();
        map.insert(ENABLED_KEY.to_string(), Value::Bool(self.enabled));
        for p in Platform::ALL {
            map.insert(p.speed_key().to_string(), Value::from(self.speed_for(p)));
        }
        map
    }

    pub fn speed_for(&self, platform: Platform) -> f64 {
        self.speed_by_platform
            .get(&platform)
            .copied()
            .unwrap_or_else(|| platform.default_speed())
    }

    /// What a page on `platform` should be told.
    pub fn effective_for(&self, platform: Platform) -> SettingsPayload {
        SettingsPayload {
            enabled: self.enabled,
            speed: Some(self.speed_for(platform)),
        }
    }
}
