// Wire shapes exchanged between the coordinator and page engines.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delivery::error::DeliveryError;
use crate::detect::platform::Platform;
use crate::engine::controller::EngineState;

/// Addressable page (a browser tab). Negative ids are never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i32);

impl TabId {
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settings pushed to a page. `speed` is `None` when the sender had no
/// usable number; the page then keeps its current speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettingsPayload {
    pub enabled: bool,
    #[serde(default)]
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    ApplySettings { settings: SettingsPayload },
    SpeedChanged { speed: f64 },
    GetStatus,
}

impl Message {
    pub fn apply_settings(enabled: bool, speed: f64) -> Self {
        Message::ApplySettings {
            settings: SettingsPayload {
                enabled,
                speed: Some(speed),
            },
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ApplySettings { .. } => "applySettings",
            Message::SpeedChanged { .. } => "speedChanged",
            Message::GetStatus => "getStatus",
        }
    }
}

/// Decode a raw message, rejecting unknown types and missing fields.
pub fn parse_message(raw: &Value) -> Result<Message, DeliveryError> {
    serde_json::from_value(raw.clone())
        .map_err(|e| DeliveryError::InvalidInput(format!("malformed message: {}", e)))
}

/// Where an inbound message came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderInfo {
    pub tab_id: Option<TabId>,
    pub url: Option<String>,
    pub frame_id: Option<u32>,
}

impl SenderInfo {
    pub fn from_tab(tab_id: TabId, url: impl Into<String>) -> Self {
        Self {
            tab_id: Some(tab_id),
            url: Some(url.into()),
            frame_id: Some(0),
        }
    }
}

/// Coordinator-level status, answered to `getStatus` from the popup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub enabled: bool,
    pub bilibili_speed: f64,
    pub youtube_speed: f64,
    pub tab_id: Option<TabId>,
    pub url: Option<String>,
}

/// Engine-level status, answered to `getStatus` by a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStatus {
    pub platform: Platform,
    pub state: EngineState,
    pub enabled: bool,
    pub current_speed: f64,
    pub video_count: usize,
    pub override_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageStatus>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}
