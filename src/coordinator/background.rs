// Background coordinator: reacts to browser lifecycle events and settings
// changes, pushes effective settings to video pages and keeps the badge current.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::badge::{render_badge, Badge, StatusIndicator};
use super::tabs::{TabDirectory, TabInfo};
use crate::config::{BADGE_ERROR_THRESHOLD, ENABLED_KEY};
use crate::delivery::error::DeliveryError;
use crate::delivery::manager::{Delivery, MessageManager, SendOptions};
use crate::delivery::transport::InboundRequest;
use crate::detect::platform::{video_platform, Platform};
use crate::protocol::{parse_message, Message, Response, SenderInfo, StatusReport, TabId};
use crate::settings::model::{Namespace, Settings, StorageChange, StorageMap};
use crate::settings::sanitize::is_valid_speed;
use crate::settings::store::SettingsStore;
use crate::settings::{load_settings, read_with_retry, write_with_retry};

/// Keyboard command that flips the global switch.
pub const TOGGLE_COMMAND: &str = "toggle-speed-control";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabStatus {
    Loading,
    Complete,
}

/// Browser events the coordinator reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Installed,
    Startup,
    TabActivated {
        tab_id: TabId,
    },
    TabUpdated {
        tab_id: TabId,
        status: Option<TabStatus>,
        url: Option<String>,
    },
    /// History API navigation inside a page.
    HistoryStateUpdated {
        tab_id: TabId,
        frame_id: u32,
        url: String,
    },
    Command(String),
    TabRemoved {
        tab_id: TabId,
    },
}

pub struct Coordinator {
    store: Arc<dyn SettingsStore>,
    tabs: Arc<dyn TabDirectory>,
    delivery: Arc<MessageManager>,
    indicator: Arc<dyn StatusIndicator>,
    consecutive_failures: AtomicU32,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        tabs: Arc<dyn TabDirectory>,
        delivery: Arc<MessageManager>,
        indicator: Arc<dyn StatusIndicator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tabs,
            delivery,
            indicator,
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn delivery(&self) -> &Arc<MessageManager> {
        &self.delivery
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub async fn handle_event(self: &Arc<Self>, event: LifecycleEvent) -> Result<()> {
        debug!("lifecycle event {:?}", event);
        match event {
            LifecycleEvent::Installed => {
                self.install_defaults().await?;
                self.refresh_badge().await?;
            }
            LifecycleEvent::Startup => {
                self.refresh_badge().await?;
                self.push_to_video_tabs().await?;
            }
            LifecycleEvent::TabActivated { tab_id } => {
                self.refresh_badge().await?;
                if let Some(tab) = self.tabs.get(tab_id).await? {
                    self.push_to_tab(&tab).await;
                }
            }
            LifecycleEvent::TabUpdated {
                tab_id,
                status,
                url,
            } => {
                if status != Some(TabStatus::Complete) && url.is_none() {
                    return Ok(());
                }
                if let Some(tab) = self.tabs.get(tab_id).await? {
                    self.push_to_tab(&tab).await;
                    if tab.active {
                        self.refresh_badge().await?;
                    }
                }
            }
            LifecycleEvent::HistoryStateUpdated {
                tab_id,
                frame_id,
                url,
            } => {
                if frame_id != 0 {
                    return Ok(());
                }
                let tab = match self.tabs.get(tab_id).await? {
                    Some(tab) => tab,
                    None => TabInfo {
                        id: tab_id,
                        url: Some(url),
                        active: false,
                    },
                };
                self.push_to_tab(&tab).await;
            }
            LifecycleEvent::Command(command) => {
                if command == TOGGLE_COMMAND {
                    self.toggle_enabled().await?;
                } else {
                    debug!("ignoring unknown command '{}'", command);
                }
            }
            LifecycleEvent::TabRemoved { tab_id } => self.delivery.cleanup(tab_id),
        }
        Ok(())
    }

    /// Write defaults for keys the store does not hold yet.
    async fn install_defaults(&self) -> Result<()> {
        let wanted: StorageMap = Settings::defaults_map()
            .into_keys()
            .map(|k| (k, Value::Null))
            .collect();
        let current = read_with_retry(self.store.as_ref(), &wanted).await?;
        let defaults = Settings::defaults_map();
        let missing: StorageMap = defaults
            .into_iter()
            .filter(|(k, _)| current.get(k).map_or(true, Value::is_null))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        info!("installing {} default setting(s)", missing.len());
        write_with_retry(self.store.as_ref(), missing).await
    }

    async fn toggle_enabled(&self) -> Result<()> {
        let settings = load_settings(self.store.as_ref()).await;
        let enabled = !settings.enabled;
        info!("speed control toggled {}", if enabled { "on" } else { "off" });
        let mut values = StorageMap::new();
        values.insert(ENABLED_KEY.to_string(), Value::Bool(enabled));
        write_with_retry(self.store.as_ref(), values).await
    }

    /// React to a store change: badge first, then every open video page.
    pub async fn on_storage_change(self: &Arc<Self>, change: &StorageChange) -> Result<()> {
        if change.namespace != Namespace::Sync || !change.touches_settings() {
            return Ok(());
        }
        self.refresh_badge().await?;
        self.push_to_video_tabs().await
    }

    async fn push_to_video_tabs(self: &Arc<Self>) -> Result<()> {
        for tab in self.tabs.all_tabs().await? {
            self.push_to_tab(&tab).await;
        }
        Ok(())
    }

    /// Send effective settings to `tab` if it is a video page. Delivery runs
    /// in the background so a slow page does not stall the coordinator.
    async fn push_to_tab(self: &Arc<Self>, tab: &TabInfo) {
        let Some(platform) = tab.url.as_deref().and_then(video_platform) else {
            return;
        };
        let settings = load_settings(self.store.as_ref()).await;
        let payload = settings.effective_for(platform);
        let message = Message::ApplySettings { settings: payload };
        let coordinator = Arc::clone(self);
        let id = tab.id;
        tokio::spawn(async move {
            let result = coordinator
                .delivery
                .send(id, message, SendOptions::default())
                .await;
            if coordinator.record_delivery(id, result) {
                if let Err(e) = coordinator.refresh_badge().await {
                    warn!("badge refresh failed: {:#}", e);
                }
            }
        });
    }

    /// Returns true when this delivery cleared the error badge.
    fn record_delivery(&self, id: TabId, result: Result<Delivery, DeliveryError>) -> bool {
        match result {
            Ok(Delivery::Delivered(response)) if response.success => return self.record_success(),
            Ok(Delivery::Delivered(response)) => {
                warn!(
                    "tab {} refused settings: {}",
                    id,
                    response.error.as_deref().unwrap_or("no reason given")
                );
                self.record_failure();
            }
            Ok(Delivery::Requeued) => {
                debug!("tab {} unreachable, settings requeued", id);
                self.record_failure();
            }
            Ok(Delivery::Queued) => {}
            Err(DeliveryError::DestinationClosed(_)) => {
                debug!("tab {} closed during delivery", id);
            }
            Err(e) => {
                warn!("settings delivery to tab {} failed: {}", id, e);
                self.record_failure();
            }
        }
        false
    }

    fn record_success(&self) -> bool {
        let recovered = self.consecutive_failures.swap(0, Ordering::SeqCst) >= BADGE_ERROR_THRESHOLD;
        if recovered {
            info!("delivery recovered");
        }
        recovered
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == BADGE_ERROR_THRESHOLD {
            error!("{} consecutive delivery failures", failures);
            self.indicator.render(&Badge::error());
        }
    }

    fn in_error(&self) -> bool {
        self.consecutive_failures() >= BADGE_ERROR_THRESHOLD
    }

    fn show(&self, badge: Badge) {
        if self.in_error() {
            self.indicator.render(&Badge::error());
        } else {
            self.indicator.render(&badge);
        }
    }

    /// Redraw the badge for the active tab.
    pub async fn refresh_badge(&self) -> Result<()> {
        let settings = load_settings(self.store.as_ref()).await;
        let speed = self
            .tabs
            .active_tab()
            .await?
            .and_then(|tab| tab.url)
            .and_then(|url| video_platform(&url))
            .map(|platform| settings.speed_for(platform));
        self.show(render_badge(settings.enabled, speed));
        Ok(())
    }

    /// Handle a runtime message from a page or the popup.
    pub async fn handle_message(&self, message: Message, sender: &SenderInfo) -> Response {
        match message {
            Message::SpeedChanged { speed } => {
                if sender.tab_id.is_none() {
                    return Response::error("speedChanged must come from a page");
                }
                if !is_valid_speed(speed) {
                    return Response::error(format!("invalid speed {}", speed));
                }
                let settings = load_settings(self.store.as_ref()).await;
                self.show(render_badge(settings.enabled, Some(speed)));
                Response::ok()
            }
            Message::GetStatus => {
                let settings = load_settings(self.store.as_ref()).await;
                let active = match self.tabs.active_tab().await {
                    Ok(tab) => tab,
                    Err(e) => {
                        warn!("active tab lookup failed: {}", e);
                        None
                    }
                };
                let (tab_id, url) = match active {
                    Some(tab) => (Some(tab.id), tab.url),
                    None => (None, None),
                };
                Response {
                    success: true,
                    status: Some(StatusReport {
                        enabled: settings.enabled,
                        bilibili_speed: settings.speed_for(Platform::Bilibili),
                        youtube_speed: settings.speed_for(Platform::Youtube),
                        tab_id,
                        url,
                    }),
                    ..Response::default()
                }
            }
            Message::ApplySettings { .. } => Response::error("applySettings is only sent to pages"),
        }
    }

    /// Decode and handle a raw JSON message.
    pub async fn handle_raw_message(&self, raw: &Value, sender: &SenderInfo) -> Response {
        match parse_message(raw) {
            Ok(message) => self.handle_message(message, sender).await,
            Err(e) => {
                warn!("rejecting runtime message: {}", e);
                Response::error(e.to_string())
            }
        }
    }

    /// Event loop: lifecycle events, store changes and runtime messages,
    /// one at a time, until `shutdown` fires or every input closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<LifecycleEvent>,
        mut runtime: mpsc::Receiver<InboundRequest>,
        shutdown: CancellationToken,
    ) {
        let mut changes = self.store.subscribe();
        let mut events_open = true;
        let mut runtime_open = true;
        info!("coordinator started");

        while events_open || runtime_open {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => {
                        if let Err(e) = self.on_storage_change(&change).await {
                            error!("settings change handling failed: {:#}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("coordinator missed {} settings change(s), resyncing", missed);
                        if let Err(e) = self.push_to_video_tabs().await {
                            error!("resync failed: {:#}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!("lifecycle event failed: {:#}", e);
                        }
                    }
                    None => events_open = false,
                },
                request = runtime.recv(), if runtime_open => match request {
                    Some(request) => {
                        let response = self.handle_message(request.message.clone(), &request.sender).await;
                        request.reply(response);
                    }
                    None => runtime_open = false,
                },
            }
        }
        info!("coordinator stopped");
    }
}
