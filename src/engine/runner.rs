// Engine task: owns a controller and feeds it page, storage, inbox and
// command events one at a time.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::controller::VideoSpeedController;
use crate::config::PlatformProfile;
use crate::delivery::transport::InboundRequest;
use crate::dom::traits::{PageDom, PageEvent};
use crate::protocol::{Message, PageStatus, Response, SenderInfo, SettingsPayload};
use crate::settings::load_settings;
use crate::settings::model::StorageChange;
use crate::settings::store::SettingsStore;

const COMMAND_CAPACITY: usize = 16;

/// Wiring for one engine.
pub struct EngineOptions {
    pub profile: PlatformProfile,
    /// Messages from the coordinator addressed to this page.
    pub inbox: Option<mpsc::Receiver<InboundRequest>>,
    /// Channel to the coordinator for `speedChanged` reports.
    pub runtime: Option<mpsc::Sender<InboundRequest>>,
    /// How this page identifies itself on reports.
    pub sender: SenderInfo,
}

impl EngineOptions {
    pub fn new(profile: PlatformProfile) -> Self {
        Self {
            profile,
            inbox: None,
            runtime: None,
            sender: SenderInfo::default(),
        }
    }
}

enum Command {
    Apply(oneshot::Sender<usize>),
    Reset(oneshot::Sender<usize>),
    Settings(SettingsPayload, oneshot::Sender<bool>),
    PrepareNavigation(oneshot::Sender<()>),
    Status(oneshot::Sender<PageStatus>),
    Destroy(oneshot::Sender<()>),
}

/// Handle to a running engine task.
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Spawn an engine for `dom`. Settings are loaded inside the task; commands
/// sent before loading finishes wait for it.
pub fn spawn_engine(
    dom: Arc<dyn PageDom>,
    store: Arc<dyn SettingsStore>,
    options: EngineOptions,
) -> EngineHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let task = tokio::spawn(run_engine(dom, store, options, command_rx));
    EngineHandle { commands, task }
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("engine task has stopped"))?;
        rx.await.map_err(|_| anyhow!("engine task dropped the request"))
    }

    pub async fn apply_video_speed(&self) -> Result<usize> {
        self.request(Command::Apply).await
    }

    pub async fn reset_video_speed(&self) -> Result<usize> {
        self.request(Command::Reset).await
    }

    /// Returns false if the engine was already destroyed.
    pub async fn handle_settings_message(&self, settings: SettingsPayload) -> Result<bool> {
        self.request(|tx| Command::Settings(settings, tx)).await
    }

    pub async fn prepare_for_navigation(&self) -> Result<()> {
        self.request(Command::PrepareNavigation).await
    }

    pub async fn status(&self) -> Result<PageStatus> {
        self.request(Command::Status).await
    }

    /// Tear down the engine and wait for its task to end. Idempotent.
    pub async fn destroy(&self) -> Result<()> {
        // A stopped task has nothing left to tear down.
        let _ = self.request(Command::Destroy).await;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit after [`EngineHandle::destroy`].
    pub async fn join(self) -> Result<()> {
        drop(self.commands);
        self.task.await.map_err(|e| anyhow!("engine task failed: {}", e))
    }
}

async fn next_change(
    rx: &mut Option<broadcast::Receiver<StorageChange>>,
) -> Result<StorageChange, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_request(rx: &mut Option<mpsc::Receiver<InboundRequest>>) -> Option<InboundRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_engine(
    dom: Arc<dyn PageDom>,
    store: Arc<dyn SettingsStore>,
    options: EngineOptions,
    mut commands: mpsc::Receiver<Command>,
) {
    let EngineOptions {
        profile,
        mut inbox,
        runtime,
        sender,
    } = options;
    let platform = profile.platform;

    let (events_tx, mut events) = mpsc::unbounded_channel::<PageEvent>();
    let mut controller = VideoSpeedController::new(dom, profile, events_tx);
    controller.begin_initialize();

    // Subscribe before loading so no change slips between read and listen.
    let mut storage = Some(store.subscribe());
    let settings = load_settings(store.as_ref()).await;
    controller.initialize(&settings);
    report_speed(&mut controller, runtime.as_ref(), &sender);

    loop {
        let deadline = controller.next_deadline();
        tokio::select! {
            biased;

            Some(event) = events.recv() => {
                controller.handle_page_event(event, Instant::now());
            }
            change = next_change(&mut storage) => match change {
                Ok(change) => controller.on_storage_change(&change, Instant::now()),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("{} engine missed {} settings change(s), reloading", platform, missed);
                    let settings = load_settings(store.as_ref()).await;
                    controller.handle_settings_message(settings.effective_for(platform));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("{} engine: settings store closed", platform);
                    storage = None;
                }
            },
            request = next_request(&mut inbox) => match request {
                Some(request) => answer(&mut controller, request),
                None => {
                    debug!("{} engine: inbox closed", platform);
                    inbox = None;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Destroy(done)) => {
                    controller.destroy();
                    let _ = done.send(());
                    break;
                }
                Some(command) => run_command(&mut controller, command),
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let count = controller.on_timer(Instant::now());
                debug!("{} engine reconciled, {} video(s) adjusted", platform, count);
            }
        }
        report_speed(&mut controller, runtime.as_ref(), &sender);
    }

    controller.destroy();
    info!("{} engine task finished", platform);
}

fn run_command(controller: &mut VideoSpeedController, command: Command) {
    match command {
        Command::Apply(done) => {
            let _ = done.send(controller.apply_video_speed());
        }
        Command::Reset(done) => {
            let _ = done.send(controller.reset_video_speed());
        }
        Command::Settings(settings, done) => {
            let _ = done.send(controller.handle_settings_message(settings));
        }
        Command::PrepareNavigation(done) => {
            controller.prepare_for_navigation();
            let _ = done.send(());
        }
        Command::Status(done) => {
            let _ = done.send(controller.status());
        }
        Command::Destroy(done) => {
            controller.destroy();
            let _ = done.send(());
        }
    }
}

fn answer(controller: &mut VideoSpeedController, request: InboundRequest) {
    let response = match &request.message {
        Message::ApplySettings { settings } => {
            if controller.handle_settings_message(*settings) {
                Response::ok()
            } else {
                Response::error("engine destroyed")
            }
        }
        Message::GetStatus => Response {
            success: true,
            page: Some(controller.status()),
            ..Response::default()
        },
        other => Response::error(format!("unsupported message for page: {}", other.type_name())),
    };
    request.reply(response);
}

/// Tell the coordinator about a newly applied speed. Best effort.
fn report_speed(
    controller: &mut VideoSpeedController,
    runtime: Option<&mpsc::Sender<InboundRequest>>,
    sender: &SenderInfo,
) {
    let Some(speed) = controller.take_report() else {
        return;
    };
    let Some(runtime) = runtime else {
        return;
    };
    // Fire-and-forget: the coordinator's reply is not awaited.
    let (respond, _) = oneshot::channel();
    let request = InboundRequest {
        message: Message::SpeedChanged { speed },
        sender: sender.clone(),
        respond,
    };
    if let Err(e) = runtime.try_send(request) {
        debug!("speedChanged report dropped: {}", e);
    }
}
