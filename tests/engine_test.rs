// Integration tests for the reconciliation engine task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use ma_speed_control::config::PlatformProfile;
use ma_speed_control::delivery::transport::InboundRequest;
use ma_speed_control::dom::{ElementSpec, InteractionKind, MemoryPage, NodeId, PageDom};
use ma_speed_control::engine::{spawn_engine, EngineHandle, EngineOptions, EngineState};
use ma_speed_control::protocol::{Message, SenderInfo, SettingsPayload, TabId};
use ma_speed_control::settings::model::{Namespace, StorageMap};
use ma_speed_control::settings::store::{MemoryStore, SettingsStore};

fn values(pairs: &[(&str, serde_json::Value)]) -> StorageMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn bilibili_page() -> (Arc<MemoryPage>, NodeId) {
    let page = Arc::new(MemoryPage::new());
    let area = page.append(page.root(), ElementSpec::new("div").class("bpx-player-video-area"));
    let video = page.append_video(area, "https://upos.example/v1.m4s");
    (page, video)
}

fn start(page: &Arc<MemoryPage>, store: &Arc<MemoryStore>, profile: PlatformProfile) -> EngineHandle {
    spawn_engine(page.clone(), store.clone(), EngineOptions::new(profile))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_store_change_reaches_video_within_one_debounce() {
    let store = Arc::new(MemoryStore::with_values(values(&[
        ("enabled", json!(true)),
        ("bilibiliSpeed", json!(1.25)),
    ])));
    let (page, video) = bilibili_page();
    let engine = start(&page, &store, PlatformProfile::bilibili());

    let status = engine.status().await.unwrap();
    assert_eq!(status.state, EngineState::Active);
    assert_eq!(page.playback_rate(video), Some(1.25));

    store
        .set(values(&[("bilibiliSpeed", json!(2.0))]))
        .await
        .unwrap();

    // Debounced: nothing happens before the 500ms window closes.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(page.playback_rate(video), Some(1.25));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(page.playback_rate(video), Some(2.0));
    assert_eq!(engine.status().await.unwrap().current_speed, 2.0);

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disabled_page_resets_and_ignores_new_videos() {
    let store = Arc::new(MemoryStore::with_values(values(&[("enabled", json!(false))])));
    let page = Arc::new(MemoryPage::new());
    let player = page.append(page.root(), ElementSpec::new("div").id("movie_player"));
    let video = page.append_video(player, "a.mp4");
    page.user_set_rate(video, 1.75);

    let engine = start(&page, &store, PlatformProfile::youtube());
    let status = engine.status().await.unwrap();
    assert_eq!(status.state, EngineState::Disabled);
    assert_eq!(page.playback_rate(video), Some(1.0));

    let late = page.append_video(player, "b.mp4");
    page.user_set_rate(late, 2.5);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(page.playback_rate(late), Some(2.5));
    assert_eq!(page.active_observers(), 0);

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_toggle_clears_overrides_and_reapplies() {
    let store = Arc::new(MemoryStore::new());
    let page = Arc::new(MemoryPage::new());
    let first = page.append_video(page.root(), "a.mp4");
    let second = page.append_video(page.root(), "b.mp4");
    let engine = start(&page, &store, PlatformProfile::youtube());
    engine.status().await.unwrap();

    page.interact(InteractionKind::Pointer);
    page.user_set_rate(first, 3.0);
    let status = engine.status().await.unwrap();
    assert_eq!(status.override_count, 1);
    assert_eq!(engine.apply_video_speed().await.unwrap(), 0);
    assert_eq!(page.playback_rate(first), Some(3.0));

    let off = SettingsPayload {
        enabled: false,
        speed: Some(1.5),
    };
    let on = SettingsPayload {
        enabled: true,
        speed: Some(1.5),
    };
    assert!(engine.handle_settings_message(off).await.unwrap());
    assert_eq!(page.playback_rate(second), Some(1.0));
    assert!(engine.handle_settings_message(on).await.unwrap());

    let status = engine.status().await.unwrap();
    assert_eq!(status.override_count, 0);
    assert_eq!(page.playback_rate(first), Some(1.5));
    assert_eq!(page.playback_rate(second), Some(1.5));

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_override_survives_until_new_source() {
    let store = Arc::new(MemoryStore::new());
    let (page, video) = bilibili_page();
    let engine = start(&page, &store, PlatformProfile::bilibili());
    engine.status().await.unwrap();

    page.interact(InteractionKind::Key);
    page.user_set_rate(video, 0.5);
    assert_eq!(engine.apply_video_speed().await.unwrap(), 0);
    assert_eq!(page.playback_rate(video), Some(0.5));

    page.load_source(video, "https://upos.example/v2.m4s");
    settle().await;
    assert_eq!(page.playback_rate(video), Some(1.25));
    assert_eq!(engine.status().await.unwrap().override_count, 0);

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_player_fighting_back_is_corrected() {
    let store = Arc::new(MemoryStore::new());
    let page = Arc::new(MemoryPage::new());
    let video = page.append_video(page.root(), "a.mp4");
    let engine = start(&page, &store, PlatformProfile::youtube());
    engine.status().await.unwrap();

    // No user input: the page reset the rate on its own.
    page.user_set_rate(video, 1.0);
    settle().await;
    assert_eq!(page.playback_rate(video), Some(1.5));
    assert_eq!(engine.status().await.unwrap().override_count, 0);

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_late_video_is_picked_up_after_debounce() {
    let store = Arc::new(MemoryStore::new());
    let page = Arc::new(MemoryPage::new());
    let player = page.append(page.root(), ElementSpec::new("div").id("movie_player"));
    let engine = start(&page, &store, PlatformProfile::youtube());
    engine.status().await.unwrap();

    let video = page.append_video(player, "a.mp4");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(page.playback_rate(video), Some(1.0));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(page.playback_rate(video), Some(1.5));

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_navigation_forgets_overrides_and_reapplies() {
    let store = Arc::new(MemoryStore::new());
    let page = Arc::new(MemoryPage::new());
    let video = page.append_video(page.root(), "a.mp4");
    let engine = start(&page, &store, PlatformProfile::youtube());
    engine.status().await.unwrap();

    page.interact(InteractionKind::Wheel);
    page.user_set_rate(video, 2.0);
    assert_eq!(engine.status().await.unwrap().override_count, 1);

    page.navigate("https://www.youtube.com/watch?v=next");
    assert_eq!(engine.status().await.unwrap().override_count, 0);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(page.playback_rate(video), Some(1.5));

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_degrades_to_disabled() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next(3);
    let page = Arc::new(MemoryPage::new());
    let video = page.append_video(page.root(), "a.mp4");

    let engine = start(&page, &store, PlatformProfile::youtube());
    let status = engine.status().await.unwrap();
    assert_eq!(status.state, EngineState::Disabled);
    assert!(!status.enabled);
    assert_eq!(page.playback_rate(video), Some(1.0));

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_foreign_namespace_is_ignored() {
    let store = Arc::new(MemoryStore::new());
    let page = Arc::new(MemoryPage::new());
    let video = page.append_video(page.root(), "a.mp4");
    let engine = start(&page, &store, PlatformProfile::youtube());
    engine.status().await.unwrap();

    store.notify_foreign(Namespace::Local, values(&[("youtubeSpeed", json!(3.0))]));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(page.playback_rate(video), Some(1.5));

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_inbox_answers_apply_and_status() {
    let store = Arc::new(MemoryStore::new());
    let page = Arc::new(MemoryPage::new());
    let video = page.append_video(page.root(), "a.mp4");
    let (inbox_tx, inbox_rx) = mpsc::channel(8);
    let mut options = EngineOptions::new(PlatformProfile::youtube());
    options.inbox = Some(inbox_rx);
    let engine = spawn_engine(page.clone(), store.clone(), options);

    let ask = |message: Message| {
        let (respond, reply) = oneshot::channel();
        let request = InboundRequest {
            message,
            sender: SenderInfo::default(),
            respond,
        };
        (request, reply)
    };

    let (request, reply) = ask(Message::apply_settings(true, 2.25));
    inbox_tx.send(request).await.unwrap();
    assert!(reply.await.unwrap().success);
    assert_eq!(page.playback_rate(video), Some(2.25));

    let (request, reply) = ask(Message::GetStatus);
    inbox_tx.send(request).await.unwrap();
    let page_status = reply.await.unwrap().page.expect("page status");
    assert_eq!(page_status.current_speed, 2.25);
    assert_eq!(page_status.video_count, 1);

    let (request, reply) = ask(Message::SpeedChanged { speed: 1.0 });
    inbox_tx.send(request).await.unwrap();
    assert!(!reply.await.unwrap().success);

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_speed_reported_to_coordinator() {
    let store = Arc::new(MemoryStore::new());
    let page = Arc::new(MemoryPage::new());
    page.append_video(page.root(), "a.mp4");
    let (runtime_tx, mut runtime_rx) = mpsc::channel(8);
    let mut options = EngineOptions::new(PlatformProfile::bilibili());
    options.runtime = Some(runtime_tx);
    options.sender = SenderInfo::from_tab(TabId(4), "https://www.bilibili.com/video/BV1");
    let engine = spawn_engine(page.clone(), store.clone(), options);

    let report = runtime_rx.recv().await.unwrap();
    assert_eq!(report.message, Message::SpeedChanged { speed: 1.25 });
    assert_eq!(report.sender.tab_id, Some(TabId(4)));

    engine.destroy().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_destroy_is_idempotent_and_releases_page() {
    let store = Arc::new(MemoryStore::new());
    let (page, _) = bilibili_page();
    let engine = start(&page, &store, PlatformProfile::bilibili());
    engine.status().await.unwrap();
    assert_eq!(page.active_observers(), 1);

    engine.destroy().await.unwrap();
    engine.destroy().await.unwrap();
    assert!(engine.status().await.is_err());
    assert_eq!(page.active_observers(), 0);
    assert_eq!(page.active_video_listeners(), 0);
    engine.join().await.unwrap();
}
