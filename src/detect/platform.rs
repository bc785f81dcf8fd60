use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the supported video sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Bilibili,
    Youtube,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Bilibili, Platform::Youtube];

    pub fn name(self) -> &'static str {
        match self {
            Platform::Bilibili => "bilibili",
            Platform::Youtube => "youtube",
        }
    }

    /// Settings store key holding this platform's target speed.
    pub fn speed_key(self) -> &'static str {
        match self {
            Platform::Bilibili => "bilibiliSpeed",
            Platform::Youtube => "youtubeSpeed",
        }
    }

    /// Speed used until the user picks one.
    pub fn default_speed(self) -> f64 {
        match self {
            Platform::Bilibili => 1.25,
            Platform::Youtube => 1.5,
        }
    }

    fn host_marker(self) -> &'static str {
        match self {
            Platform::Bilibili => "bilibili.com",
            Platform::Youtube => "youtube.com",
        }
    }

    fn video_path_marker(self) -> &'static str {
        match self {
            Platform::Bilibili => "bilibili.com/video/",
            Platform::Youtube => "youtube.com/watch",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Detect which platform a URL belongs to, by host substring.
pub fn detect_platform(url: &str) -> Option<Platform> {
    Platform::ALL
        .into_iter()
        .find(|p| url.contains(p.host_marker()))
}

/// Platform of a playback page; `None` for listing pages and foreign sites.
pub fn video_platform(url: &str) -> Option<Platform> {
    Platform::ALL
        .into_iter()
        .find(|p| url.contains(p.video_path_marker()))
}
