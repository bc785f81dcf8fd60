// Per-destination message manager: dedup, bounded queueing, retry with backoff.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{DeliveryError, TransportError};
use super::key::message_key;
use super::transport::Transport;
use crate::config::DeliveryConfig;
use crate::protocol::{Message, Response, TabId};

/// Per-call delivery options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Per-attempt timeout; `None` uses the configured default.
    pub timeout: Option<Duration>,
    /// Send even if an identical message is already in flight.
    pub skip_queue: bool,
}

/// What happened to a message handed to [`MessageManager::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The destination acknowledged the message.
    Delivered(Response),
    /// An identical message is in flight; this one waits in the queue.
    Queued,
    /// Delivery failed transiently; the message was put back at the head of
    /// the queue and will be retried later.
    Requeued,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    key: String,
    message: Message,
    enqueued_at: Instant,
    requeues: u32,
}

struct DestinationState {
    generation: u64,
    /// Attempt sequences in flight per key. A `skip_queue` duplicate runs
    /// beside the original, so a key can count more than one.
    pending: HashMap<String, usize>,
    queue: VecDeque<QueuedMessage>,
}

impl DestinationState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            pending: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    fn in_flight(&self) -> usize {
        self.pending.values().sum()
    }

    fn mark_pending(&mut self, key: &str) {
        *self.pending.entry(key.to_string()).or_insert(0) += 1;
    }

    fn unmark_pending(&mut self, key: &str) {
        if let Some(count) = self.pending.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(key);
            }
        }
    }

    /// Drop the oldest entries beyond `capacity`, sparing requeued ones
    /// while any fresh entry is left to drop.
    fn trim(&mut self, capacity: usize) -> usize {
        let mut dropped = 0;
        while self.queue.len() > capacity {
            match self.queue.iter().position(|m| m.requeues == 0) {
                Some(pos) => {
                    self.queue.remove(pos);
                }
                None => {
                    self.queue.pop_front();
                }
            }
            dropped += 1;
        }
        dropped
    }
}

pub struct MessageManager {
    transport: Arc<dyn Transport>,
    config: DeliveryConfig,
    destinations: Mutex<HashMap<TabId, DestinationState>>,
    next_generation: AtomicU64,
}

impl MessageManager {
    pub fn new(transport: Arc<dyn Transport>, config: DeliveryConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            destinations: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Deliver `message` to `id`.
    ///
    /// At most one attempt sequence per (destination, message key) runs at a
    /// time; duplicates are queued unless `skip_queue` is set.
    pub async fn send(
        self: &Arc<Self>,
        id: TabId,
        message: Message,
        options: SendOptions,
    ) -> Result<Delivery, DeliveryError> {
        self.send_inner(id, message, options, 0).await
    }

    async fn send_inner(
        self: &Arc<Self>,
        id: TabId,
        message: Message,
        options: SendOptions,
        requeues: u32,
    ) -> Result<Delivery, DeliveryError> {
        if !id.is_valid() {
            warn!("rejecting {} for invalid tab id {}", message.type_name(), id);
            return Err(DeliveryError::InvalidInput(format!("invalid tab id {}", id)));
        }

        let key = message_key(&message);
        let generation = {
            let mut destinations = self.destinations.lock();
            let state = destinations
                .entry(id)
                .or_insert_with(|| DestinationState::new(self.next_generation.fetch_add(1, Ordering::Relaxed)));

            if state.is_pending(&key) && !options.skip_queue {
                state.queue.push_back(QueuedMessage {
                    key: key.clone(),
                    message,
                    enqueued_at: Instant::now(),
                    requeues,
                });
                let dropped = state.trim(self.config.queue_capacity);
                debug!(
                    "tab {} key={} already in flight, queued (len={} dropped={})",
                    id,
                    key,
                    state.queue.len(),
                    dropped
                );
                return Ok(Delivery::Queued);
            }

            state.mark_pending(&key);
            state.generation
        };

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.config.timeout_ms));
        let result = self
            .deliver_with_retry(id, generation, &key, &message, timeout)
            .await;

        match result {
            Ok(response) => {
                self.clear_pending(id, generation, &key);
                debug!("tab {} key={} delivered", id, key);
                self.drain_one(id);
                Ok(Delivery::Delivered(response))
            }
            Err(DeliveryError::Exhausted { attempts, source }) if source.is_retryable() => {
                if !self.clear_pending(id, generation, &key) {
                    return Err(DeliveryError::DestinationClosed(id.to_string()));
                }
                if requeues >= self.config.max_requeues {
                    warn!(
                        "tab {} key={} dropped after {} requeue(s): {}",
                        id, key, requeues, source
                    );
                    self.drain_one(id);
                    return Err(DeliveryError::Exhausted { attempts, source });
                }
                self.requeue_front(id, key, message, requeues + 1);
                self.schedule_drain(id, Duration::from_millis(self.config.requeue_delay_ms));
                Ok(Delivery::Requeued)
            }
            Err(e) => {
                self.clear_pending(id, generation, &key);
                warn!("tab {} key={} delivery failed: {}", id, key, e);
                self.drain_one(id);
                Err(e)
            }
        }
    }

    async fn deliver_with_retry(
        &self,
        id: TabId,
        generation: u64,
        key: &str,
        message: &Message,
        timeout: Duration,
    ) -> Result<Response, DeliveryError> {
        let total_attempts = 1 + self.config.retry_delays_ms.len() as u32;
        let mut last_error = TransportError::Other("no attempt made".into());

        for attempt in 0..total_attempts {
            if attempt > 0 {
                let delay = self.config.retry_delays_ms[attempt as usize - 1];
                tokio::time::sleep(Duration::from_millis(delay)).await;
                // Cleanup while we slept turns the retry into a no-op.
                if !self.is_current(id, generation, key) {
                    debug!("tab {} key={} retry abandoned, destination cleaned up", id, key);
                    return Err(DeliveryError::DestinationClosed(id.to_string()));
                }
            }

            let outcome = tokio::time::timeout(
                timeout,
                self.transport.send_to_destination(id, message.clone()),
            )
            .await;
            let error = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout(timeout.as_millis() as u64),
            };

            if !error.is_retryable() {
                return Err(DeliveryError::Exhausted {
                    attempts: attempt + 1,
                    source: error,
                });
            }
            if attempt + 1 < total_attempts {
                warn!(
                    "tab {} key={} attempt {} failed, retrying: {}",
                    id,
                    key,
                    attempt + 1,
                    error
                );
            }
            last_error = error;
        }

        Err(DeliveryError::Exhausted {
            attempts: total_attempts,
            source: last_error,
        })
    }

    fn is_current(&self, id: TabId, generation: u64, key: &str) -> bool {
        self.destinations
            .lock()
            .get(&id)
            .map(|s| s.generation == generation && s.is_pending(key))
            .unwrap_or(false)
    }

    /// Returns false when the destination was cleaned up meanwhile.
    fn clear_pending(&self, id: TabId, generation: u64, key: &str) -> bool {
        let mut destinations = self.destinations.lock();
        match destinations.get_mut(&id) {
            Some(state) if state.generation == generation => {
                state.unmark_pending(key);
                true
            }
            _ => false,
        }
    }

    fn requeue_front(&self, id: TabId, key: String, message: Message, requeues: u32) {
        let mut destinations = self.destinations.lock();
        if let Some(state) = destinations.get_mut(&id) {
            state.queue.push_front(QueuedMessage {
                key: key.clone(),
                message,
                enqueued_at: Instant::now(),
                requeues,
            });
            state.trim(self.config.queue_capacity);
            info!("tab {} key={} requeued (requeue #{})", id, key, requeues);
        }
    }

    fn schedule_drain(self: &Arc<Self>, id: TabId, delay: Duration) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.drain_one(id);
        });
    }

    /// Send the next queued message whose key is not already in flight, if
    /// the destination has spare capacity.
    fn drain_one(self: &Arc<Self>, id: TabId) {
        let next = {
            let mut destinations = self.destinations.lock();
            let Some(state) = destinations.get_mut(&id) else {
                return;
            };
            if state.in_flight() >= self.config.max_concurrent {
                return;
            }
            let pending = &state.pending;
            let Some(pos) = state.queue.iter().position(|m| !pending.contains_key(&m.key)) else {
                return;
            };
            state.queue.remove(pos)
        };
        let Some(next) = next else {
            return;
        };

        debug!(
            "tab {} draining key={} after {} ms in queue",
            id,
            next.key,
            next.enqueued_at.elapsed().as_millis()
        );
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let key = next.key.clone();
            if let Err(e) = manager
                .send_inner(id, next.message, SendOptions::default(), next.requeues)
                .await
            {
                warn!("tab {} queued key={} failed: {}", id, key, e);
            }
        });
    }

    /// Append a message to the destination queue without sending it.
    pub fn enqueue(&self, id: TabId, message: Message) {
        let key = message_key(&message);
        let mut destinations = self.destinations.lock();
        let state = destinations
            .entry(id)
            .or_insert_with(|| DestinationState::new(self.next_generation.fetch_add(1, Ordering::Relaxed)));
        state.queue.push_back(QueuedMessage {
            key,
            message,
            enqueued_at: Instant::now(),
            requeues: 0,
        });
        state.trim(self.config.queue_capacity);
    }

    /// Forget everything about a destination. Late retries for it become no-ops.
    pub fn cleanup(&self, id: TabId) {
        if let Some(state) = self.destinations.lock().remove(&id) {
            info!(
                "tab {} cleaned up ({} pending, {} queued discarded)",
                id,
                state.in_flight(),
                state.queue.len()
            );
        }
    }

    pub fn queued_len(&self, id: TabId) -> usize {
        self.destinations
            .lock()
            .get(&id)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }

    /// Keys of queued messages, head first.
    pub fn queued_keys(&self, id: TabId) -> Vec<String> {
        self.destinations
            .lock()
            .get(&id)
            .map(|s| s.queue.iter().map(|m| m.key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, id: TabId) -> usize {
        self.destinations
            .lock()
            .get(&id)
            .map(DestinationState::in_flight)
            .unwrap_or(0)
    }

    pub fn is_tracking(&self, id: TabId) -> bool {
        self.destinations.lock().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::transport::LocalRouter;

    fn manager() -> Arc<MessageManager> {
        MessageManager::new(Arc::new(LocalRouter::new()), DeliveryConfig::default())
    }

    #[test]
    fn test_trim_spares_requeued_head() {
        let mut state = DestinationState::new(1);
        let entry = |key: &str, requeues| QueuedMessage {
            key: key.to_string(),
            message: Message::GetStatus,
            enqueued_at: Instant::now(),
            requeues,
        };
        state.queue.push_back(entry("retry", 1));
        state.queue.push_back(entry("a", 0));
        state.queue.push_back(entry("b", 0));
        assert_eq!(state.trim(2), 1);
        let keys: Vec<_> = state.queue.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["retry", "b"]);

        // Only requeued entries left: the oldest goes, the newest stays.
        let mut state = DestinationState::new(1);
        for key in ["r1", "r2", "r3"] {
            state.queue.push_back(entry(key, 1));
        }
        assert_eq!(state.trim(2), 1);
        let keys: Vec<_> = state.queue.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["r2", "r3"]);
    }

    #[test]
    fn test_pending_counts_parallel_sequences() {
        let mut state = DestinationState::new(1);
        state.mark_pending("k");
        state.mark_pending("k");
        state.unmark_pending("k");
        assert!(state.is_pending("k"));
        assert_eq!(state.in_flight(), 1);
        state.unmark_pending("k");
        assert!(!state.is_pending("k"));
        assert_eq!(state.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_tab_rejected() {
        let err = manager()
            .send(TabId(-1), Message::GetStatus, SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cleanup_forgets_queue() {
        let manager = manager();
        manager.enqueue(TabId(4), Message::apply_settings(true, 2.0));
        assert_eq!(manager.queued_len(TabId(4)), 1);
        manager.cleanup(TabId(4));
        assert_eq!(manager.queued_len(TabId(4)), 0);
        assert!(!manager.is_tracking(TabId(4)));
    }
}
