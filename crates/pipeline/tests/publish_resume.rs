mod common;

use common::write_rendition;
use hls_forge::encode::{verify_rendition, VerifyPolicy};
use hls_forge::{
    AssetPathPolicy, MemoryStore, ObjectStore, PublishError, PublishSettings, Publisher,
    RenditionOutput, RetryConfig,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn settings() -> PublishSettings {
    PublishSettings {
        batch_size: 25,
        batch_delay: Duration::ZERO,
        retry: RetryConfig::new("upload")
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(4)),
        upload_timeout: Duration::from_secs(5),
        segment_cache_control: "public, max-age=31536000, immutable".into(),
        playlist_cache_control: "public, max-age=60".into(),
    }
}

async fn rendition(root: &Path, name: &str, count: usize) -> RenditionOutput {
    let dir = root.join(name);
    write_rendition(&dir, count);
    verify_rendition(name, &dir, count as f64 * 6.0, 6, &VerifyPolicy::default())
        .await
        .unwrap()
}

fn master(root: &Path) -> std::path::PathBuf {
    let path = root.join("master.m3u8");
    std::fs::write(&path, "#EXTM3U\n#EXT-X-VERSION:3\n").unwrap();
    path
}

#[tokio::test]
async fn second_publish_uploads_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let renditions = vec![
        rendition(tmp.path(), "480p", 40).await,
        rendition(tmp.path(), "original-1080p", 40).await,
    ];
    let master = master(tmp.path());
    let store = Arc::new(MemoryStore::with_page_size(7));
    let publisher = Publisher::new(store.clone(), AssetPathPolicy::new("videos"), settings());

    let first = publisher.publish("movie", &renditions, &master).await.unwrap();
    assert_eq!(first.uploaded, 83);
    let keys_after_first = store.keys();

    store.reset_counters();
    let second = publisher.publish("movie", &renditions, &master).await.unwrap();
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.bytes_uploaded, 0);
    assert_eq!(second.already_present, 83);
    assert!(!second.master_uploaded);
    assert_eq!(store.put_attempts(), 0);
    assert_eq!(store.keys(), keys_after_first);
}

#[tokio::test]
async fn interrupted_publish_resumes_with_remaining_segments() {
    let tmp = tempfile::tempdir().unwrap();
    let renditions = vec![rendition(tmp.path(), "original-1080p", 1000).await];
    let master = master(tmp.path());
    let store = Arc::new(MemoryStore::with_page_size(100));
    let paths = AssetPathPolicy::new("videos");

    // the first run died after 600 segments
    for i in 0..600 {
        let key = paths
            .segment_key("movie", "original-1080p", &format!("segment_{:03}.ts", i))
            .unwrap();
        store.insert(key, format!("ts-{}", i).into_bytes());
    }

    let publisher = Publisher::new(store.clone(), paths.clone(), settings());
    let report = publisher.publish("movie", &renditions, &master).await.unwrap();

    assert_eq!(report.segments_uploaded, 400);
    assert_eq!(report.already_present, 600);
    assert!(report.master_uploaded);
    // 400 segments, the rendition playlist and the master
    assert_eq!(store.put_count(), 402);
    assert!(store.contains("videos/movie/hls/original-1080p/segment_999.ts"));
    assert!(store.contains("videos/movie/hls/master.m3u8"));
    assert_eq!(store.len(), 1002);
}

#[tokio::test]
async fn partial_resume_of_one_rendition_leaves_the_other_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let renditions = vec![
        rendition(tmp.path(), "480p", 12).await,
        rendition(tmp.path(), "original-1080p", 12).await,
    ];
    let master = master(tmp.path());
    let store = Arc::new(MemoryStore::new());
    let publisher = Publisher::new(store.clone(), AssetPathPolicy::new("videos"), settings());

    // one segment of 480p is unreachable on the first run
    store.fail_put_always("videos/movie/hls/480p/segment_005.ts");
    let err = publisher.publish("movie", &renditions, &master).await.unwrap_err();
    assert!(matches!(err, PublishError::Incomplete { ref missing } if missing.len() == 1));
    assert!(!store.contains("videos/movie/hls/master.m3u8"));

    store.clear_failures();
    store.reset_counters();
    let report = publisher.publish("movie", &renditions, &master).await.unwrap();
    assert_eq!(report.segments_uploaded, 1);
    assert_eq!(report.uploaded, 2);
    assert!(report.master_uploaded);
}

#[tokio::test]
async fn remote_listing_is_paginated() {
    let tmp = tempfile::tempdir().unwrap();
    let renditions = vec![rendition(tmp.path(), "480p", 30).await];
    let master = master(tmp.path());
    let store = Arc::new(MemoryStore::with_page_size(4));
    let publisher = Publisher::new(store.clone(), AssetPathPolicy::new("videos"), settings());
    publisher.publish("movie", &renditions, &master).await.unwrap();

    store.reset_counters();
    let listed = store.list_all("videos/movie/hls/").await.unwrap();
    assert_eq!(listed.len(), 32);
    assert_eq!(store.list_calls(), 8);
}
