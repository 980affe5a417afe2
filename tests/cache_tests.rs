//! Input-cache behavior: hits stay off the network, expiry evicts, and
//! disabled caching hands out self-cleaning temp files.


use std::time::Duration;

use edgelink::agent::cache::InputCache;

use test_harness::StubObjectStore;

async fn cache_fixture(ttl: Duration) -> (StubObjectStore, InputCache, tempfile::TempDir, String) {
    let object_store = StubObjectStore::start().await;
    object_store.put_object("b/in/asset.jpg", b"img").await;
    let dir = tempfile::tempdir().expect("cache dir");
    let cache = InputCache::new(dir.path().to_path_buf(), ttl, reqwest::Client::new());
    let url = format!("{}/b/in/asset.jpg?expires=12345", object_store.base_url());
    (object_store, cache, dir, url)
}

#[tokio::test]
async fn cache_hit_within_ttl_stays_off_the_network() {
    let (object_store, cache, _dir, url) = cache_fixture(Duration::from_secs(300)).await;

    let (first_path, _g1) = cache.get(&url, "in/asset.jpg").await.expect("first get");
    let (second_path, _g2) = cache.get(&url, "in/asset.jpg").await.expect("second get");

    assert_eq!(first_path, second_path);
    assert_eq!(object_store.fetch_count("b/in/asset.jpg").await, 1);
    assert_eq!(tokio::fs::read(&first_path).await.unwrap(), b"img");
    // Extension carried over from the input key.
    assert!(first_path.to_string_lossy().ends_with(".jpg"));
}

#[tokio::test]
async fn expired_entries_are_evicted_and_refetched() {
    let (object_store, cache, _dir, url) = cache_fixture(Duration::from_millis(50)).await;

    let (first_path, _g1) = cache.get(&url, "in/asset.jpg").await.expect("first get");
    assert_eq!(object_store.fetch_count("b/in/asset.jpg").await, 1);

    tokio::time::sleep(Duration::from_millis(80)).await;

    let (second_path, _g2) = cache.get(&url, "in/asset.jpg").await.expect("second get");
    assert_eq!(object_store.fetch_count("b/in/asset.jpg").await, 2);
    // Same deterministic path, freshly downloaded.
    assert_eq!(first_path, second_path);
    assert_eq!(tokio::fs::read(&second_path).await.unwrap(), b"img");
}

#[tokio::test]
async fn disabled_cache_downloads_one_shot_files() {
    let (object_store, cache, _dir, url) = cache_fixture(Duration::ZERO).await;

    let (first_path, guard) = cache.get(&url, "in/asset.jpg").await.expect("first get");
    assert!(first_path.exists());
    assert_eq!(tokio::fs::read(&first_path).await.unwrap(), b"img");

    // Release deletes the one-shot file.
    drop(guard);
    assert!(!first_path.exists());

    let (second_path, _guard) = cache.get(&url, "in/asset.jpg").await.expect("second get");
    assert_ne!(first_path, second_path, "one-shot files are distinct");
    assert_eq!(object_store.fetch_count("b/in/asset.jpg").await, 2);
}

#[tokio::test]
async fn distinct_urls_get_distinct_entries() {
    let (object_store, cache, _dir, url) = cache_fixture(Duration::from_secs(300)).await;
    object_store.put_object("b/in/other.png", b"other").await;
    let other_url = format!("{}/b/in/other.png?expires=12345", object_store.base_url());

    let (path_a, _g1) = cache.get(&url, "in/asset.jpg").await.unwrap();
    let (path_b, _g2) = cache.get(&other_url, "in/other.png").await.unwrap();
    assert_ne!(path_a, path_b);
    assert_eq!(tokio::fs::read(&path_b).await.unwrap(), b"other");
}

#[tokio::test]
async fn missing_objects_surface_transfer_errors() {
    let (_object_store, cache, _dir, url) = cache_fixture(Duration::from_secs(300)).await;
    let bad_url = url.replace("asset.jpg", "missing.jpg");
    let err = cache.get(&bad_url, "in/missing.jpg").await.unwrap_err();
    assert!(err.to_string().contains("404"), "got: {err}");
}
