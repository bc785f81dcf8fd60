use ma_speed_control::detect::platform::{detect_platform, video_platform, Platform};

#[test]
fn test_detect_bilibili_video() {
    let url = "https://www.bilibili.com/video/BV1xx411c7mD?p=2";
    assert_eq!(detect_platform(url), Some(Platform::Bilibili));
    assert_eq!(video_platform(url), Some(Platform::Bilibili));
}

#[test]
fn test_detect_youtube_watch() {
    let url = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
    assert_eq!(detect_platform(url), Some(Platform::Youtube));
    assert_eq!(video_platform(url), Some(Platform::Youtube));
}

#[test]
fn test_listing_page_is_not_video_page() {
    // Home page is on the platform but has no player to drive.
    let url = "https://www.youtube.com/feed/subscriptions";
    assert_eq!(detect_platform(url), Some(Platform::Youtube));
    assert_eq!(video_platform(url), None);
}

#[test]
fn test_foreign_site() {
    assert_eq!(detect_platform("https://example.org/watch"), None);
    assert_eq!(video_platform(""), None);
}

#[test]
fn test_speed_keys() {
    assert_eq!(Platform::Bilibili.speed_key(), "bilibiliSpeed");
    assert_eq!(Platform::Youtube.speed_key(), "youtubeSpeed");
    assert_eq!(Platform::Youtube.to_string(), "youtube");
}
