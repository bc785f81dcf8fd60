// Reconciliation state machine for one page: keeps every controllable video
// at the configured rate while respecting manual overrides.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::observer::{batch_needs_reconcile, observe_filter, select_observer_target};
use crate::config::{PlatformProfile, ENABLED_KEY, NEUTRAL_SPEED, RATE_TOLERANCE};
use crate::dom::traits::{
    Mutation, PageDom, PageEvent, PageEventSink, Subscription, VideoEvent, VideoRef,
};
use crate::protocol::{PageStatus, SettingsPayload};
use crate::settings::model::{Namespace, Settings, StorageChange};
use crate::settings::sanitize::{parse_speed, sanitize_f64};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Active,
    Disabled,
    /// Terminal.
    Destroyed,
}

/// A rate the user picked for one video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualOverride {
    pub speed: f64,
    pub timestamp: Instant,
}

/// Pending poll for the platform's player element.
#[derive(Debug, Clone, Copy)]
struct ReadyCheck {
    at: Instant,
    remaining: u32,
}

fn rates_differ(a: f64, b: f64) -> bool {
    (a - b).abs() > RATE_TOLERANCE
}

pub struct VideoSpeedController {
    dom: Arc<dyn PageDom>,
    profile: PlatformProfile,
    events: PageEventSink,
    state: EngineState,
    enabled: bool,
    current_speed: f64,
    observer: Option<Subscription>,
    /// The observer sits on the document root because no container resolved.
    observing_root: bool,
    interactions: Option<Subscription>,
    navigation: Option<Subscription>,
    listeners: HashMap<VideoRef, Subscription>,
    overrides: HashMap<VideoRef, ManualOverride>,
    sources: HashMap<VideoRef, Option<String>>,
    /// Rates this controller set and whose `ratechange` has not been seen yet.
    self_set: HashMap<VideoRef, f64>,
    last_interaction: Option<Instant>,
    debounce_deadline: Option<Instant>,
    ready_check: Option<ReadyCheck>,
    last_reported: Option<f64>,
    pending_report: Option<f64>,
}

impl VideoSpeedController {
    /// Page events from listeners this controller registers go to `events`.
    pub fn new(dom: Arc<dyn PageDom>, profile: PlatformProfile, events: PageEventSink) -> Self {
        let current_speed = profile.default_speed;
        let enabled = profile.default_enabled;
        Self {
            dom,
            profile,
            events,
            state: EngineState::Uninitialized,
            enabled,
            current_speed,
            observer: None,
            observing_root: false,
            interactions: None,
            navigation: None,
            listeners: HashMap::new(),
            overrides: HashMap::new(),
            sources: HashMap::new(),
            self_set: HashMap::new(),
            last_interaction: None,
            debounce_deadline: None,
            ready_check: None,
            last_reported: None,
            pending_report: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current_speed(&self) -> f64 {
        self.current_speed
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    pub fn manual_override(&self, video: VideoRef) -> Option<ManualOverride> {
        self.overrides.get(&video).copied()
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_observing(&self) -> bool {
        self.observer.as_ref().map_or(false, Subscription::is_active)
    }

    /// Mark the start of settings loading.
    pub fn begin_initialize(&mut self) {
        if self.state == EngineState::Uninitialized {
            self.state = EngineState::Initializing;
        }
    }

    /// Finish initialization with loaded settings.
    pub fn initialize(&mut self, settings: &Settings) {
        if self.state == EngineState::Destroyed {
            return;
        }
        self.enabled = settings.enabled;
        self.current_speed = settings.speed_for(self.profile.platform);
        self.interactions = Some(self.dom.listen_interactions(self.events.clone()));
        self.navigation = Some(self.dom.listen_navigation(self.events.clone()));

        if self.enabled {
            self.state = EngineState::Active;
            self.arm_observer();
            let count = self.apply_video_speed();
            self.queue_report();
            info!(
                "{} engine active at {}x ({} video(s) adjusted)",
                self.profile.platform, self.current_speed, count
            );
        } else {
            self.state = EngineState::Disabled;
            let count = self.reset_video_speed();
            info!(
                "{} engine initialized disabled ({} video(s) reset)",
                self.profile.platform, count
            );
        }
        self.start_ready_check(Instant::now());
    }

    /// Set every controllable video without a manual override to the
    /// current speed. Returns how many rates were changed.
    pub fn apply_video_speed(&mut self) -> usize {
        if self.state == EngineState::Destroyed {
            return 0;
        }
        self.prune_vanished();

        let mut changed = 0;
        for video in self.dom.videos() {
            let Some(snapshot) = self.dom.video(video) else {
                continue;
            };
            if snapshot.ignored {
                continue;
            }
            self.track(video, snapshot.source.clone());
            if !snapshot.is_controllable() || self.overrides.contains_key(&video) {
                continue;
            }
            if rates_differ(snapshot.playback_rate, self.current_speed)
                && self.set_rate(video, self.current_speed)
            {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(
                "{}: set {} video(s) to {}x",
                self.profile.platform, changed, self.current_speed
            );
        }
        changed
    }

    /// Force every controllable video back to normal speed.
    pub fn reset_video_speed(&mut self) -> usize {
        let mut changed = 0;
        for video in self.dom.videos() {
            let Some(snapshot) = self.dom.video(video) else {
                continue;
            };
            if !snapshot.is_controllable() {
                continue;
            }
            if rates_differ(snapshot.playback_rate, NEUTRAL_SPEED) && self.set_rate(video, NEUTRAL_SPEED) {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!("{}: reset {} video(s) to {}x", self.profile.platform, changed, NEUTRAL_SPEED);
        }
        changed
    }

    /// Apply settings pushed by the coordinator. Returns false once destroyed.
    pub fn handle_settings_message(&mut self, settings: SettingsPayload) -> bool {
        if self.state == EngineState::Destroyed {
            return false;
        }
        if let Some(speed) = settings.speed {
            self.current_speed = sanitize_f64(speed, self.current_speed);
        }
        self.overrides.clear();
        if settings.enabled {
            self.enable();
        } else {
            self.disable();
        }
        true
    }

    /// React to a settings store change.
    pub fn on_storage_change(&mut self, change: &StorageChange, now: Instant) {
        if change.namespace != Namespace::Sync || self.state == EngineState::Destroyed {
            return;
        }
        let mut relevant = false;

        let speed_key = self.profile.platform.speed_key();
        if change.touches(speed_key) {
            relevant = true;
            if let Some(speed) = change.new_value(speed_key).and_then(parse_speed) {
                self.current_speed = sanitize_f64(speed, self.current_speed);
            }
        }

        let mut toggled = None;
        if change.touches(ENABLED_KEY) {
            relevant = true;
            let enabled = change
                .new_value(ENABLED_KEY)
                .and_then(|v| v.as_bool())
                .unwrap_or(self.enabled);
            if enabled != self.enabled {
                toggled = Some(enabled);
            }
        }

        if !relevant {
            return;
        }
        self.overrides.clear();
        match toggled {
            Some(false) => self.disable(),
            Some(true) => {
                self.enabled = true;
                self.state = EngineState::Active;
                self.arm_observer();
                self.schedule(now + Duration::from_millis(self.profile.debounce_ms));
            }
            None if self.state == EngineState::Active => {
                self.schedule(now + Duration::from_millis(self.profile.debounce_ms));
            }
            None => {}
        }
    }

    /// Route one event from the page.
    pub fn handle_page_event(&mut self, event: PageEvent, now: Instant) {
        if self.state == EngineState::Destroyed {
            return;
        }
        match event {
            PageEvent::Mutations(mutations) => self.on_mutations(&mutations, now),
            PageEvent::Video { video, event } => match event {
                VideoEvent::RateChange { rate } => self.on_rate_change(video, rate, now),
                VideoEvent::LoadedMetadata { source } => self.on_loaded_metadata(video, source),
            },
            PageEvent::Interaction(_) => self.last_interaction = Some(now),
            PageEvent::Navigated { url } => {
                debug!(
                    "{}: navigated to {}",
                    self.profile.platform,
                    url.as_deref().unwrap_or("<unknown>")
                );
                self.prepare_for_navigation();
                if self.state == EngineState::Active {
                    self.schedule(now + Duration::from_millis(self.profile.navigation_reapply_ms));
                }
            }
        }
    }

    fn on_mutations(&mut self, mutations: &[Mutation], now: Instant) {
        if self.state != EngineState::Active {
            return;
        }
        if batch_needs_reconcile(self.dom.as_ref(), mutations, &self.profile) {
            self.schedule(now + Duration::from_millis(self.profile.debounce_ms));
        }
    }

    fn on_rate_change(&mut self, video: VideoRef, rate: f64, now: Instant) {
        if let Some(expected) = self.self_set.remove(&video) {
            if !rates_differ(expected, rate) {
                return;
            }
        }
        if self.state != EngineState::Active {
            return;
        }

        let window = Duration::from_millis(self.profile.interaction_window_ms);
        let user_initiated = self
            .last_interaction
            .map_or(false, |at| now.saturating_duration_since(at) <= window);

        if user_initiated {
            info!("{}: manual override to {}x on {}", self.profile.platform, rate, video);
            self.overrides.insert(
                video,
                ManualOverride {
                    speed: rate,
                    timestamp: now,
                },
            );
        } else if !self.overrides.contains_key(&video) && rates_differ(rate, self.current_speed) {
            debug!(
                "{}: {} drifted to {}x, restoring {}x",
                self.profile.platform, video, rate, self.current_speed
            );
            self.apply_to(video);
        }
    }

    fn on_loaded_metadata(&mut self, video: VideoRef, source: Option<String>) {
        let known = self.sources.get(&video).cloned();
        let changed = matches!(&known, Some(previous) if *previous != source);
        self.sources.insert(video, source.clone());
        if changed && self.overrides.remove(&video).is_some() {
            info!(
                "{}: new source on {}, manual override cleared",
                self.profile.platform, video
            );
        }
        if self.state == EngineState::Active && (changed || known.is_none()) {
            self.apply_to(video);
        }
    }

    /// Cancel-and-replace the pending reconciliation.
    fn schedule(&mut self, deadline: Instant) {
        self.debounce_deadline = Some(deadline);
    }

    /// Earliest pending timer: the debounce deadline or the next player check.
    pub fn next_deadline(&self) -> Option<Instant> {
        let ready = self.ready_check.map(|check| check.at);
        match (self.debounce_deadline, ready) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run the timers due at `now`. Returns how many rates were changed.
    pub fn on_timer(&mut self, now: Instant) -> usize {
        let mut changed = 0;
        if self.debounce_deadline.is_some_and(|at| at <= now) {
            changed += self.on_debounce_elapsed();
        }
        if self.ready_check.is_some_and(|check| check.at <= now) {
            changed += self.check_player_ready(now);
        }
        changed
    }

    fn start_ready_check(&mut self, now: Instant) {
        let Some(selector) = self.profile.ready_selector.as_deref() else {
            return;
        };
        if self.profile.ready_poll_attempts == 0 || self.dom.query_selector(selector).is_some() {
            return;
        }
        self.ready_check = Some(ReadyCheck {
            at: now + Duration::from_millis(self.profile.ready_poll_delay_ms),
            remaining: self.profile.ready_poll_attempts,
        });
    }

    fn check_player_ready(&mut self, now: Instant) -> usize {
        let Some(check) = self.ready_check.take() else {
            return 0;
        };
        let Some(selector) = self.profile.ready_selector.clone() else {
            return 0;
        };
        if self.dom.query_selector(&selector).is_none() {
            if check.remaining > 1 {
                self.ready_check = Some(ReadyCheck {
                    at: now + Duration::from_millis(self.profile.ready_poll_interval_ms),
                    remaining: check.remaining - 1,
                });
            } else {
                debug!("{}: {} never appeared", self.profile.platform, selector);
            }
            return 0;
        }
        if self.state != EngineState::Active {
            return 0;
        }
        if self.observing_root {
            self.observer = None;
            self.arm_observer();
        }
        let count = self.apply_video_speed();
        self.queue_report();
        info!(
            "{}: player ready, {} video(s) adjusted",
            self.profile.platform, count
        );
        count
    }

    /// The debounce deadline passed; reconcile against current state.
    pub fn on_debounce_elapsed(&mut self) -> usize {
        self.debounce_deadline = None;
        if self.state != EngineState::Active {
            return 0;
        }
        let count = self.apply_video_speed();
        self.queue_report();
        count
    }

    /// Forget per-video history ahead of an in-page route change.
    pub fn prepare_for_navigation(&mut self) {
        self.overrides.clear();
        self.sources.clear();
        self.last_interaction = None;
    }

    /// Tear everything down. Idempotent.
    pub fn destroy(&mut self) {
        if self.state == EngineState::Destroyed {
            return;
        }
        self.observer = None;
        self.interactions = None;
        self.navigation = None;
        self.listeners.clear();
        self.overrides.clear();
        self.sources.clear();
        self.self_set.clear();
        self.debounce_deadline = None;
        self.ready_check = None;
        self.pending_report = None;
        self.state = EngineState::Destroyed;
        info!("{} engine destroyed", self.profile.platform);
    }

    pub fn status(&self) -> PageStatus {
        PageStatus {
            platform: self.profile.platform,
            state: self.state,
            enabled: self.enabled,
            current_speed: self.current_speed,
            video_count: self.dom.videos().len(),
            override_count: self.overrides.len(),
        }
    }

    /// Speed to announce to the coordinator, if it changed since last time.
    pub fn take_report(&mut self) -> Option<f64> {
        self.pending_report.take()
    }

    fn queue_report(&mut self) {
        if self.enabled && self.last_reported != Some(self.current_speed) {
            self.last_reported = Some(self.current_speed);
            self.pending_report = Some(self.current_speed);
        }
    }

    fn enable(&mut self) {
        self.enabled = true;
        self.state = EngineState::Active;
        self.arm_observer();
        self.apply_video_speed();
        self.queue_report();
    }

    fn disable(&mut self) {
        self.enabled = false;
        self.state = EngineState::Disabled;
        self.overrides.clear();
        self.observer = None;
        self.observing_root = false;
        self.debounce_deadline = None;
        self.reset_video_speed();
        info!("{} engine disabled", self.profile.platform);
    }

    fn arm_observer(&mut self) {
        if self.is_observing() {
            return;
        }
        let target = select_observer_target(self.dom.as_ref(), &self.profile);
        match self
            .dom
            .observe_changes(target.node, observe_filter(&self.profile), self.events.clone())
        {
            Ok(subscription) => {
                debug!(
                    "{}: observing {} at depth {}",
                    self.profile.platform,
                    self.dom.describe(target.node),
                    target.depth
                );
                self.observer = Some(subscription);
                self.observing_root = target.selector.is_none();
            }
            Err(e) => warn!(
                "{}: mutation observer unavailable, relying on explicit triggers: {}",
                self.profile.platform, e
            ),
        }
    }

    /// Start listening to a video and remember its first known source.
    fn track(&mut self, video: VideoRef, source: Option<String>) {
        self.sources.entry(video).or_insert(source);
        if self.listeners.contains_key(&video) {
            return;
        }
        match self.dom.listen_video(video, self.events.clone()) {
            Ok(subscription) => {
                self.listeners.insert(video, subscription);
            }
            Err(e) => debug!("{}: cannot listen to {}: {}", self.profile.platform, video, e),
        }
    }

    fn apply_to(&mut self, video: VideoRef) {
        if self.overrides.contains_key(&video) {
            return;
        }
        let Some(snapshot) = self.dom.video(video) else {
            return;
        };
        if snapshot.is_controllable() && rates_differ(snapshot.playback_rate, self.current_speed) {
            self.set_rate(video, self.current_speed);
        }
    }

    fn set_rate(&mut self, video: VideoRef, rate: f64) -> bool {
        self.self_set.insert(video, rate);
        match self.dom.set_playback_rate(video, rate) {
            Ok(()) => true,
            Err(e) => {
                self.self_set.remove(&video);
                warn!("{}: failed to set {} to {}x: {}", self.profile.platform, video, rate, e);
                false
            }
        }
    }

    fn prune_vanished(&mut self) {
        let dom = Arc::clone(&self.dom);
        self.listeners.retain(|v, _| dom.is_connected(*v));
        self.overrides.retain(|v, _| dom.is_connected(*v));
        self.sources.retain(|v, _| dom.is_connected(*v));
        self.self_set.retain(|v, _| dom.is_connected(*v));
    }
}

impl Drop for VideoSpeedController {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::platform::Platform;
    use crate::dom::memory::{ElementSpec, MemoryPage};
    use crate::dom::traits::InteractionKind;
    use tokio::sync::mpsc;

    struct Fixture {
        page: Arc<MemoryPage>,
        controller: VideoSpeedController,
        events: mpsc::UnboundedReceiver<PageEvent>,
    }

    impl Fixture {
        fn new(platform: Platform) -> Self {
            let page = Arc::new(MemoryPage::new());
            let (tx, events) = mpsc::unbounded_channel();
            let controller = VideoSpeedController::new(
                page.clone(),
                PlatformProfile::for_platform(platform),
                tx,
            );
            Self {
                page,
                controller,
                events,
            }
        }

        /// Feed queued page events to the controller.
        fn pump(&mut self, now: Instant) {
            while let Ok(event) = self.events.try_recv() {
                self.controller.handle_page_event(event, now);
            }
        }
    }

    #[tokio::test]
    async fn test_initialize_applies_and_observes() {
        let mut f = Fixture::new(Platform::Bilibili);
        let container = f
            .page
            .append(f.page.root(), ElementSpec::new("div").class("bpx-player-video-area"));
        let video = f.page.append_video(container, "a.mp4");

        f.controller.begin_initialize();
        assert_eq!(f.controller.state(), EngineState::Initializing);
        f.controller.initialize(&Settings::default());

        assert_eq!(f.controller.state(), EngineState::Active);
        assert_eq!(f.page.playback_rate(video), Some(1.25));
        assert_eq!(f.page.observed_target(), Some(container));
        assert_eq!(f.controller.take_report(), Some(1.25));
        assert_eq!(f.controller.take_report(), None);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let mut f = Fixture::new(Platform::Youtube);
        f.page.append_video(f.page.root(), "a.mp4");
        f.page.append_video(f.page.root(), "b.mp4");
        f.controller.initialize(&Settings::default());
        f.pump(Instant::now());

        assert_eq!(f.controller.apply_video_speed(), 0);
        assert_eq!(f.controller.apply_video_speed(), 0);
    }

    #[tokio::test]
    async fn test_uncontrollable_videos_are_skipped() {
        let mut f = Fixture::new(Platform::Youtube);
        let hidden = f.page.append_video(f.page.root(), "a.mp4");
        f.page.set_size(hidden, 0, 0);
        let unloaded = f.page.append_video(f.page.root(), "b.mp4");
        f.page.set_ready_state(unloaded, 0);
        let ignored = f.page.append_video(f.page.root(), "ad.mp4");
        f.page.set_attribute(ignored, "class", "speed-controller-ignored");

        f.controller.initialize(&Settings::default());
        assert_eq!(f.page.playback_rate(hidden), Some(1.0));
        assert_eq!(f.page.playback_rate(unloaded), Some(1.0));
        assert_eq!(f.page.playback_rate(ignored), Some(1.0));
    }

    #[tokio::test]
    async fn test_interaction_then_ratechange_is_override() {
        let mut f = Fixture::new(Platform::Youtube);
        let video = f.page.append_video(f.page.root(), "a.mp4");
        f.controller.initialize(&Settings::default());
        let now = Instant::now();
        f.pump(now);

        f.page.interact(InteractionKind::Pointer);
        f.page.user_set_rate(video, 2.0);
        f.pump(now + Duration::from_millis(200));

        let o = f.controller.manual_override(video).expect("override recorded");
        assert_eq!(o.speed, 2.0);
        assert_eq!(f.controller.apply_video_speed(), 0);
        assert_eq!(f.page.playback_rate(video), Some(2.0));
    }

    #[tokio::test]
    async fn test_ratechange_without_interaction_is_restored() {
        let mut f = Fixture::new(Platform::Youtube);
        let video = f.page.append_video(f.page.root(), "a.mp4");
        f.controller.initialize(&Settings::default());
        let now = Instant::now();
        f.pump(now);

        f.page.interact(InteractionKind::Key);
        f.pump(now);
        // Outside the interaction window.
        f.page.user_set_rate(video, 0.5);
        f.pump(now + Duration::from_secs(5));

        assert_eq!(f.controller.override_count(), 0);
        assert_eq!(f.page.playback_rate(video), Some(1.5));
    }

    #[tokio::test]
    async fn test_new_source_clears_override() {
        let mut f = Fixture::new(Platform::Bilibili);
        let video = f.page.append_video(f.page.root(), "a.mp4");
        f.controller.initialize(&Settings::default());
        let now = Instant::now();
        f.pump(now);

        f.page.interact(InteractionKind::Pointer);
        f.page.user_set_rate(video, 3.0);
        f.pump(now);
        assert!(f.controller.manual_override(video).is_some());

        f.page.load_source(video, "b.mp4");
        f.pump(now);
        assert!(f.controller.manual_override(video).is_none());
        assert_eq!(f.page.playback_rate(video), Some(1.25));
    }

    #[tokio::test]
    async fn test_disable_resets_and_clears_overrides() {
        let mut f = Fixture::new(Platform::Youtube);
        let video = f.page.append_video(f.page.root(), "a.mp4");
        f.controller.initialize(&Settings::default());
        let now = Instant::now();
        f.page.interact(InteractionKind::Touch);
        f.page.user_set_rate(video, 2.5);
        f.pump(now);
        assert_eq!(f.controller.override_count(), 1);

        assert!(f.controller.handle_settings_message(SettingsPayload {
            enabled: false,
            speed: None,
        }));
        assert_eq!(f.controller.state(), EngineState::Disabled);
        assert_eq!(f.controller.override_count(), 0);
        assert_eq!(f.page.playback_rate(video), Some(1.0));
        assert!(!f.controller.is_observing());
    }

    #[tokio::test]
    async fn test_settings_message_sanitizes_speed() {
        let mut f = Fixture::new(Platform::Youtube);
        let video = f.page.append_video(f.page.root(), "a.mp4");
        f.controller.initialize(&Settings::default());

        f.controller.handle_settings_message(SettingsPayload {
            enabled: true,
            speed: Some(40.0),
        });
        assert_eq!(f.controller.current_speed(), 16.0);
        assert_eq!(f.page.playback_rate(video), Some(16.0));

        f.controller.handle_settings_message(SettingsPayload {
            enabled: true,
            speed: Some(f64::NAN),
        });
        assert_eq!(f.controller.current_speed(), 16.0);
    }

    #[tokio::test]
    async fn test_mutation_burst_debounces_to_one_deadline() {
        let mut f = Fixture::new(Platform::Youtube);
        let player = f.page.append(f.page.root(), ElementSpec::new("div").id("movie_player"));
        f.controller.initialize(&Settings::default());
        let start = Instant::now();
        f.pump(start);
        assert_eq!(f.controller.next_deadline(), None);

        f.page.append_video(player, "a.mp4");
        f.pump(start);
        f.page.append_video(player, "b.mp4");
        f.pump(start + Duration::from_millis(100));
        assert_eq!(
            f.controller.next_deadline(),
            Some(start + Duration::from_millis(400))
        );

        assert_eq!(f.controller.on_debounce_elapsed(), 2);
        assert_eq!(f.controller.next_deadline(), None);
    }

    #[tokio::test]
    async fn test_large_batch_with_late_video_schedules_reapply() {
        let mut f = Fixture::new(Platform::Youtube);
        let player = f.page.append(f.page.root(), ElementSpec::new("div").id("movie_player"));
        let plain = f.page.append(player, ElementSpec::new("span"));
        f.controller.initialize(&Settings::default());
        let now = Instant::now();
        f.pump(now);
        assert_eq!(f.controller.next_deadline(), None);

        let video = f.page.append_video(player, "late.mp4");
        while f.events.try_recv().is_ok() {}
        let mut batch: Vec<Mutation> = (0..60)
            .map(|_| Mutation::ChildList {
                target: player,
                added: vec![plain],
            })
            .collect();
        batch.push(Mutation::ChildList {
            target: player,
            added: vec![video],
        });
        f.controller.handle_page_event(PageEvent::Mutations(batch), now);

        assert_eq!(
            f.controller.next_deadline(),
            Some(now + Duration::from_millis(300))
        );
        assert_eq!(f.controller.on_timer(now + Duration::from_millis(300)), 1);
        assert_eq!(f.page.playback_rate(video), Some(1.5));
    }

    #[tokio::test]
    async fn test_player_ready_check_moves_observer_and_reapplies() {
        let mut f = Fixture::new(Platform::Youtube);
        f.controller.initialize(&Settings::default());
        assert_eq!(f.page.observed_target(), Some(f.page.root()));
        let first = f.controller.next_deadline().expect("ready check scheduled");

        assert_eq!(f.controller.on_timer(first), 0);
        let second = f.controller.next_deadline().expect("ready check rescheduled");
        assert_eq!(second, first + Duration::from_millis(500));

        let player = f.page.append(f.page.root(), ElementSpec::new("div").id("movie_player"));
        let video = f.page.append_video(player, "a.mp4");
        while f.events.try_recv().is_ok() {}

        assert_eq!(f.controller.on_timer(second), 1);
        assert_eq!(f.page.playback_rate(video), Some(1.5));
        assert_eq!(f.page.observed_target(), Some(player));
        assert_eq!(f.controller.next_deadline(), None);
    }

    #[tokio::test]
    async fn test_player_ready_check_is_bounded() {
        let mut f = Fixture::new(Platform::Youtube);
        f.controller.initialize(&Settings::default());
        let mut checks = 0;
        while let Some(at) = f.controller.next_deadline() {
            f.controller.on_timer(at);
            checks += 1;
        }
        assert_eq!(checks, 20);

        let mut b = Fixture::new(Platform::Bilibili);
        b.controller.initialize(&Settings::default());
        assert_eq!(b.controller.next_deadline(), None);
    }

    #[tokio::test]
    async fn test_vanished_videos_are_pruned() {
        let mut f = Fixture::new(Platform::Youtube);
        let video = f.page.append_video(f.page.root(), "a.mp4");
        f.controller.initialize(&Settings::default());
        f.page.interact(InteractionKind::Pointer);
        f.page.user_set_rate(video, 2.0);
        f.pump(Instant::now());
        assert_eq!(f.controller.override_count(), 1);

        f.page.remove(video);
        f.controller.apply_video_speed();
        assert_eq!(f.controller.override_count(), 0);
        assert_eq!(f.page.active_video_listeners(), 0);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let mut f = Fixture::new(Platform::Bilibili);
        f.page.append_video(f.page.root(), "a.mp4");
        f.controller.initialize(&Settings::default());
        assert_eq!(f.page.active_observers(), 1);

        f.controller.destroy();
        f.controller.destroy();
        assert_eq!(f.controller.state(), EngineState::Destroyed);
        assert_eq!(f.page.active_observers(), 0);
        assert_eq!(f.page.active_video_listeners(), 0);
        assert!(!f.controller.handle_settings_message(SettingsPayload {
            enabled: true,
            speed: Some(2.0),
        }));
    }

    #[tokio::test]
    async fn test_observer_failure_is_not_fatal() {
        let mut f = Fixture::new(Platform::Youtube);
        let video = f.page.append_video(f.page.root(), "a.mp4");
        f.page.set_observers_unavailable(true);
        f.controller.initialize(&Settings::default());
        assert!(!f.controller.is_observing());
        assert_eq!(f.controller.state(), EngineState::Active);
        assert_eq!(f.page.playback_rate(video), Some(1.5));
    }
}
