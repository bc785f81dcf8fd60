// Playback-rate controller core: settings delivery from a background
// coordinator to page engines that keep videos at the configured rate.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod detect;
pub mod dom;
pub mod engine;
pub mod protocol;
pub mod settings;
