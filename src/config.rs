use anyhow::{Context, Result};
use serde::Deserialize;

use crate::detect::platform::Platform;

/// Lowest playback rate the controller will ever apply.
pub const MIN_SPEED: f64 = 0.1;

/// Highest playback rate the controller will ever apply.
pub const MAX_SPEED: f64 = 16.0;

/// Speed used when nothing better is known.
pub const DEFAULT_SPEED: f64 = 1.0;

/// Whether control is on for a fresh install.
pub const DEFAULT_ENABLED: bool = true;

/// Rate a video is returned to when control is disabled.
pub const NEUTRAL_SPEED: f64 = 1.0;

/// Two rates closer than this are treated as equal.
pub const RATE_TOLERANCE: f64 = 0.001;

/// Attempts made against the settings store before falling back to defaults.
pub const STORE_READ_ATTEMPTS: u32 = 3;

/// Fixed delay between settings store attempts (ms).
pub const STORE_RETRY_DELAY_MS: u64 = 200;

/// Consecutive delivery failures before the badge shows an error.
pub const BADGE_ERROR_THRESHOLD: u32 = 3;

/// Storage key holding the global on/off switch.
pub const ENABLED_KEY: &str = "enabled";

/// Delivery layer tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Delays before each retry, in ms. Its length is the retry count.
    pub retry_delays_ms: Vec<u64>,
    /// Per-attempt acknowledgment timeout (ms).
    pub timeout_ms: u64,
    /// Deferred messages kept per destination.
    pub queue_capacity: usize,
    /// Pending keys per destination above which the queue is not drained.
    pub max_concurrent: usize,
    /// Delay before draining a requeued message (ms).
    pub requeue_delay_ms: u64,
    /// How many times one message may be requeued before it is dropped.
    pub max_requeues: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_delays_ms: vec![1000, 2000, 5000],
            timeout_ms: 5000,
            queue_capacity: 10,
            max_concurrent: 3,
            requeue_delay_ms: 1500,
            max_requeues: 3,
        }
    }
}

/// Per-platform tuning of the reconciliation engine.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformProfile {
    pub platform: Platform,
    /// Candidate observer roots, most specific first.
    pub target_selectors: Vec<String>,
    /// Attribute names on a video whose change triggers reconciliation.
    pub attribute_filter: Vec<String>,
    /// Debounce window for mutation bursts (ms).
    pub debounce_ms: u64,
    /// Observer targets deeper than this are walked up to an ancestor.
    #[serde(default)]
    pub max_observer_depth: Option<usize>,
    /// Observer depth above which a warning is logged.
    #[serde(default = "default_depth_warning")]
    pub depth_warning_threshold: usize,
    /// A rate change this soon after user input is treated as manual (ms).
    #[serde(default = "default_interaction_window")]
    pub interaction_window_ms: u64,
    /// Delay before reapplying after an in-page navigation (ms).
    #[serde(default = "default_navigation_delay")]
    pub navigation_reapply_ms: u64,
    /// Element whose appearance marks the player as ready. When set, the
    /// engine polls for it after start and reapplies once it shows up.
    #[serde(default)]
    pub ready_selector: Option<String>,
    #[serde(default = "default_ready_delay")]
    pub ready_poll_delay_ms: u64,
    #[serde(default = "default_ready_interval")]
    pub ready_poll_interval_ms: u64,
    /// Checks made before giving up on the player.
    #[serde(default = "default_ready_attempts")]
    pub ready_poll_attempts: u32,
    pub default_speed: f64,
    #[serde(default = "default_enabled")]
    pub default_enabled: bool,
}

fn default_depth_warning() -> usize {
    5
}

fn default_interaction_window() -> u64 {
    1500
}

fn default_navigation_delay() -> u64 {
    1000
}

fn default_ready_delay() -> u64 {
    1000
}

fn default_ready_interval() -> u64 {
    500
}

fn default_ready_attempts() -> u32 {
    20
}

fn default_enabled() -> bool {
    DEFAULT_ENABLED
}

impl PlatformProfile {
    pub fn bilibili() -> Self {
        Self {
            platform: Platform::Bilibili,
            target_selectors: vec![
                ".bpx-player-video-area".into(),
                ".player-container".into(),
                "#player_module".into(),
                ".video-container".into(),
                "#bilibili-player".into(),
            ],
            attribute_filter: vec![
                "src".into(),
                "class".into(),
                "style".into(),
                "data-loaded".into(),
            ],
            debounce_ms: 500,
            max_observer_depth: Some(6),
            depth_warning_threshold: 9,
            interaction_window_ms: default_interaction_window(),
            navigation_reapply_ms: default_navigation_delay(),
            ready_selector: None,
            ready_poll_delay_ms: default_ready_delay(),
            ready_poll_interval_ms: default_ready_interval(),
            ready_poll_attempts: default_ready_attempts(),
            default_speed: Platform::Bilibili.default_speed(),
            default_enabled: DEFAULT_ENABLED,
        }
    }

    pub fn youtube() -> Self {
        Self {
            platform: Platform::Youtube,
            target_selectors: vec![
                "#movie_player".into(),
                ".html5-video-player".into(),
                "ytd-player".into(),
                "#player-container".into(),
                ".ytd-video-player".into(),
            ],
            attribute_filter: vec![
                "src".into(),
                "class".into(),
                "video-id".into(),
                "data-loaded".into(),
            ],
            debounce_ms: 300,
            max_observer_depth: None,
            depth_warning_threshold: default_depth_warning(),
            interaction_window_ms: default_interaction_window(),
            navigation_reapply_ms: default_navigation_delay(),
            ready_selector: Some("#movie_player".into()),
            ready_poll_delay_ms: default_ready_delay(),
            ready_poll_interval_ms: default_ready_interval(),
            ready_poll_attempts: default_ready_attempts(),
            default_speed: Platform::Youtube.default_speed(),
            default_enabled: DEFAULT_ENABLED,
        }
    }

    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Bilibili => Self::bilibili(),
            Platform::Youtube => Self::youtube(),
        }
    }
}

/// Top-level configuration for the controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub delivery: DeliveryConfig,
    pub bilibili: PlatformProfile,
    pub youtube: PlatformProfile,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryConfig::default(),
            bilibili: PlatformProfile::bilibili(),
            youtube: PlatformProfile::youtube(),
        }
    }
}

impl ControllerConfig {
    /// Parse a JSON document; omitted sections keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid controller config")
    }

    pub fn profile(&self, platform: Platform) -> &PlatformProfile {
        match platform {
            Platform::Bilibili => &self.bilibili,
            Platform::Youtube => &self.youtube,
        }
    }
}
