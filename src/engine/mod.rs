// Reconciliation engine: keeps a page's videos at the configured rate.

pub mod controller;
pub mod observer;
pub mod runner;

pub use controller::{EngineState, ManualOverride, VideoSpeedController};
pub use runner::{spawn_engine, EngineHandle, EngineOptions};
