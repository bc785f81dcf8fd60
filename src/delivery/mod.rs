// Coordinator-to-page delivery: keyed dedup, bounded queues, retries and timeouts.

pub mod error;
pub mod key;
pub mod manager;
pub mod transport;
