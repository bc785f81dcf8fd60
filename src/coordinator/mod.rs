// Background side: lifecycle handling, settings fan-out and the toolbar badge.

pub mod background;
pub mod badge;
pub mod tabs;

pub use background::{Coordinator, LifecycleEvent, TabStatus, TOGGLE_COMMAND};
pub use badge::{render_badge, Badge, MemoryIndicator, StatusIndicator};
pub use tabs::{MemoryTabs, TabDirectory, TabInfo};
