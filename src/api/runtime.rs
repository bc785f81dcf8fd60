// Public entry point: wires store, router, coordinator and page engines
// into one running extension.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::coordinator::{Coordinator, LifecycleEvent, MemoryIndicator, MemoryTabs, TabStatus};
use crate::delivery::manager::MessageManager;
use crate::delivery::transport::{InboundRequest, LocalRouter};
use crate::detect::platform::detect_platform;
use crate::dom::traits::PageDom;
use crate::engine::{spawn_engine, EngineHandle, EngineOptions};
use crate::protocol::{SenderInfo, TabId};
use crate::settings::store::SettingsStore;

const LIFECYCLE_CAPACITY: usize = 64;
const RUNTIME_CAPACITY: usize = 64;

/// A running extension: the background coordinator plus the pages opened
/// through it.
pub struct ExtensionRuntime {
    config: ControllerConfig,
    store: Arc<dyn SettingsStore>,
    router: Arc<LocalRouter>,
    tabs: Arc<MemoryTabs>,
    indicator: Arc<MemoryIndicator>,
    coordinator: Arc<Coordinator>,
    lifecycle: mpsc::Sender<LifecycleEvent>,
    runtime: mpsc::Sender<InboundRequest>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ExtensionRuntime {
    /// Start the coordinator loop. Must be called inside a tokio runtime.
    pub fn start(config: ControllerConfig, store: Arc<dyn SettingsStore>) -> Self {
        let router = Arc::new(LocalRouter::new());
        let tabs = Arc::new(MemoryTabs::new());
        let indicator = Arc::new(MemoryIndicator::new());
        let delivery = MessageManager::new(router.clone(), config.delivery.clone());
        let coordinator = Coordinator::new(store.clone(), tabs.clone(), delivery, indicator.clone());

        let (lifecycle, lifecycle_rx) = mpsc::channel(LIFECYCLE_CAPACITY);
        let (runtime, runtime_rx) = mpsc::channel(RUNTIME_CAPACITY);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&coordinator).run(lifecycle_rx, runtime_rx, shutdown.clone()));
        info!("extension runtime started");

        Self {
            config,
            store,
            router,
            tabs,
            indicator,
            coordinator,
            lifecycle,
            runtime,
            shutdown,
            task,
        }
    }

    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }

    pub fn tabs(&self) -> &Arc<MemoryTabs> {
        &self.tabs
    }

    pub fn indicator(&self) -> &Arc<MemoryIndicator> {
        &self.indicator
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Channel pages and the popup use to reach the coordinator.
    pub fn runtime_sender(&self) -> mpsc::Sender<InboundRequest> {
        self.runtime.clone()
    }

    /// Queue a lifecycle event for the coordinator.
    pub async fn dispatch(&self, event: LifecycleEvent) -> Result<()> {
        self.lifecycle
            .send(event)
            .await
            .map_err(|_| anyhow!("coordinator has stopped"))
    }

    /// Open a tab showing `url` with document `dom`. Supported sites get an
    /// engine; other pages only exist as tabs.
    pub async fn open_page(&self, id: TabId, url: &str, dom: Arc<dyn PageDom>) -> Result<Option<EngineHandle>> {
        self.tabs.open(id, url);
        let engine = match detect_platform(url) {
            Some(platform) => {
                let mut options = EngineOptions::new(self.config.profile(platform).clone());
                options.inbox = Some(self.router.register(id));
                options.runtime = Some(self.runtime.clone());
                options.sender = SenderInfo::from_tab(id, url);
                Some(spawn_engine(dom, self.store.clone(), options))
            }
            None => {
                debug!("tab {} ({}) has no engine", id, url);
                None
            }
        };
        self.dispatch(LifecycleEvent::TabUpdated {
            tab_id: id,
            status: Some(TabStatus::Complete),
            url: Some(url.to_string()),
        })
        .await?;
        Ok(engine)
    }

    /// Focus a tab.
    pub async fn activate(&self, id: TabId) -> Result<()> {
        self.tabs.activate(id);
        self.dispatch(LifecycleEvent::TabActivated { tab_id: id }).await
    }

    /// Close a tab and forget its delivery state.
    pub async fn close_page(&self, id: TabId) -> Result<()> {
        self.tabs.close(id);
        self.router.unregister(id);
        self.dispatch(LifecycleEvent::TabRemoved { tab_id: id }).await
    }

    /// Stop the coordinator loop and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| anyhow!("coordinator task failed: {}", e))
    }
}
