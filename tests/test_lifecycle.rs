//! Integration tests for generation install, activation and restart

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use washcache::{
    CacheStore, DiskCacheStore, EventOutcome, HttpFetcher, InterceptedRequest, LifecycleManager,
    LifecycleState, MemoryCacheStore, OfflineConfig, OfflineError, OfflineMetrics, OfflineRuntime,
    ResponseSource, SyncQueue, WorkerEvent,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(origin: &str, generation: &str) -> OfflineConfig {
    OfflineConfig {
        origin: origin.to_string(),
        generation: generation.to_string(),
        precache_urls: vec![
            "/".to_string(),
            "/ordini/cassa/mobile/".to_string(),
            "/static/manifest.json".to_string(),
        ],
        ..OfflineConfig::default()
    }
}

fn runtime(config: &OfflineConfig, store: Arc<dyn CacheStore>) -> OfflineRuntime {
    let metrics = OfflineMetrics::new().unwrap();
    let fetcher = Arc::new(HttpFetcher::with_timeout(Duration::from_secs(5)).unwrap());
    let queue = Arc::new(SyncQueue::in_memory(
        fetcher.clone(),
        config.origin_url().unwrap(),
        config.sync.tag.clone(),
        metrics.clone(),
    ));
    OfflineRuntime::new(store, fetcher, queue, metrics)
}

async fn mount_page(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn mount_site(server: &MockServer) {
    mount_page(server, "/", "home").await;
    mount_page(server, "/ordini/cassa/mobile/", "cassa").await;
    mount_page(server, "/static/manifest.json", "{\"name\":\"Autolavaggio\"}").await;
    mount_page(server, "/offline.html", "offline").await;
}

#[tokio::test]
async fn test_install_seeds_primary_and_offline_partitions() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let config = config(&server.uri(), "v1");
    let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
    let runtime = runtime(&config, store.clone());

    let outcome = runtime.dispatch(WorkerEvent::Install(config.clone())).await.unwrap();
    match outcome {
        EventOutcome::Installed { report, state } => {
            assert_eq!(report.primary, "autolavaggio-cache-v1");
            assert_eq!(report.offline, "autolavaggio-offline-v1");
            assert_eq!(report.seeded, 3);
            // Promoted right away: nothing else was active
            assert_eq!(state, LifecycleState::Active);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let home = format!("{}/", server.uri());
    let cached = store.get("autolavaggio-cache-v1", &home).await.unwrap().unwrap();
    assert_eq!(cached.body, "home");
    let offline_key = format!("{}/offline.html", server.uri());
    assert!(store
        .get("autolavaggio-offline-v1", &offline_key)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_seeding_twice_gives_same_keys() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let config = config(&server.uri(), "v1");
    let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
    let manager = LifecycleManager::new(
        store.clone(),
        Arc::new(HttpFetcher::new().unwrap()),
        OfflineMetrics::new().unwrap(),
    );

    manager.install(&config).await.unwrap();
    let first = store.keys("autolavaggio-cache-v1").await.unwrap();
    manager.install(&config).await.unwrap();
    let second = store.keys("autolavaggio-cache-v1").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

#[tokio::test]
async fn test_failed_install_leaves_active_generation_serving() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let v1 = config(&server.uri(), "v1");
    let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
    let runtime = runtime(&v1, store.clone());
    runtime.dispatch(WorkerEvent::Install(v1.clone())).await.unwrap();
    let v1_keys = store.keys("autolavaggio-cache-v1").await.unwrap();

    // v2 adds a page the origin does not have
    let mut v2 = config(&server.uri(), "v2");
    v2.precache_urls.push("/static/js/missing.js".to_string());

    let err = runtime.dispatch(WorkerEvent::Install(v2)).await.unwrap_err();
    assert!(matches!(err, OfflineError::SeedingFailed { .. }));

    assert!(!store.has_partition("autolavaggio-cache-v2").await.unwrap());
    assert_eq!(store.keys("autolavaggio-cache-v1").await.unwrap(), v1_keys);
    assert!(runtime.waiting_worker().await.is_none());

    let active = runtime.active_worker().await.unwrap();
    assert_eq!(active.name(), "autolavaggio-cache-v1");
    assert_eq!(active.state(), LifecycleState::Active);

    // Requests are still answered from v1's partition
    let manifest = InterceptedRequest::get(&format!("{}/static/manifest.json", server.uri())).unwrap();
    let served = runtime.intercept(&manifest).await;
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, "{\"name\":\"Autolavaggio\"}");
}

#[tokio::test]
async fn test_activation_removes_stale_partitions() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
    store
        .put(
            "autolavaggio-cache-v0",
            "http://old/",
            washcache::ResponseSnapshot::new(200, "old"),
        )
        .await
        .unwrap();
    store.open("unrelated-partition").await.unwrap();

    let v1 = config(&server.uri(), "v1");
    let runtime = runtime(&v1, store.clone());
    runtime.dispatch(WorkerEvent::Install(v1.clone())).await.unwrap();

    let mut partitions = store.partitions().await.unwrap();
    partitions.sort();
    assert_eq!(
        partitions,
        vec!["autolavaggio-cache-v1", "autolavaggio-offline-v1"]
    );
}

#[tokio::test]
async fn test_waiting_generation_promoted_when_last_client_leaves() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
    let v1 = config(&server.uri(), "v1");
    let runtime = runtime(&v1, store.clone());
    runtime.dispatch(WorkerEvent::Install(v1.clone())).await.unwrap();
    let client = runtime.connect_client().await.unwrap();

    let mut v2 = config(&server.uri(), "v2");
    v2.skip_waiting_on_install = false;
    runtime.dispatch(WorkerEvent::Install(v2)).await.unwrap();

    let waiting = runtime.waiting_worker().await.unwrap();
    assert_eq!(waiting.name(), "autolavaggio-cache-v2");
    assert_eq!(waiting.state(), LifecycleState::Waiting);
    assert_eq!(runtime.active_worker().await.unwrap().name(), "autolavaggio-cache-v1");

    assert!(runtime.disconnect_client(client).await.unwrap());
    assert_eq!(runtime.active_worker().await.unwrap().name(), "autolavaggio-cache-v2");
    assert!(!store.has_partition("autolavaggio-cache-v1").await.unwrap());
}

#[tokio::test]
async fn test_disk_store_survives_restart() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    let temp_dir = TempDir::new().unwrap();
    let config = config(&server.uri(), "v1");

    {
        let store: Arc<dyn CacheStore> = Arc::new(DiskCacheStore::new(temp_dir.path()).await.unwrap());
        let runtime = runtime(&config, store);
        runtime.dispatch(WorkerEvent::Install(config.clone())).await.unwrap();
    }

    // Second process: the origin is gone, the cache on disk is not
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let store: Arc<dyn CacheStore> = Arc::new(DiskCacheStore::new(temp_dir.path()).await.unwrap());
    let metrics = OfflineMetrics::new().unwrap();
    let fetcher = Arc::new(HttpFetcher::with_timeout(Duration::from_secs(1)).unwrap());
    let queue = Arc::new(SyncQueue::in_memory(
        fetcher.clone(),
        config.origin_url().unwrap(),
        config.sync.tag.clone(),
        metrics.clone(),
    ));
    let runtime = OfflineRuntime::new(store, fetcher, queue, metrics);

    assert!(runtime.dispatch(WorkerEvent::Install(config.clone())).await.is_err());
    runtime.resume(config.clone()).await.unwrap();

    let url = format!("{}/ordini/cassa/mobile/", server.uri());
    let served = runtime
        .intercept(&InterceptedRequest::get(&url).unwrap().accepting("text/html"))
        .await;
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, "cassa");
}

#[tokio::test]
async fn test_resume_without_cache_fails() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
    let config = config("http://127.0.0.1:8000", "v1");
    let runtime = runtime(&config, store);

    let err = runtime.resume(config).await.unwrap_err();
    assert!(matches!(err, OfflineError::NotInstalled));
    assert!(runtime.active_worker().await.is_none());
}
