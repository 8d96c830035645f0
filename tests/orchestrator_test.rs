use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use acquire_engine::lyrics::{LyricsFetcher, LyricsLine, LyricsQuery, LyricsResponse, SyncType};
use acquire_engine::orchestrator::{CoverLyricsRequest, Orchestrator, PreWarmRequest, TrackResolver};
use acquire_engine::track_cache::{CatalogId, Service, TrackIdCache};
use acquire_engine::transport::Transport;

const COVER: &[u8] = b"\xFF\xD8\xFF\xE0fake-jpeg";

async fn start_server() -> SocketAddr {
    let app = Router::new()
        .route("/cover.jpg", get(|| async { COVER.to_vec() }))
        .route("/missing.jpg", get(|| async { StatusCode::NOT_FOUND }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct FailingLyrics;

#[async_trait]
impl LyricsFetcher for FailingLyrics {
    async fn fetch_all_sources(&self, _query: &LyricsQuery) -> anyhow::Result<LyricsResponse> {
        anyhow::bail!("lyrics provider timed out")
    }
}

struct StaticLyrics;

#[async_trait]
impl LyricsFetcher for StaticLyrics {
    async fn fetch_all_sources(&self, query: &LyricsQuery) -> anyhow::Result<LyricsResponse> {
        assert_eq!(query.duration_secs, 215.5);
        Ok(LyricsResponse {
            lines: vec![LyricsLine {
                start_time_ms: 12_340,
                words: "hello".into(),
            }],
            sync_type: SyncType::LineSynced,
            source: "static".into(),
        })
    }
}

/// Resolver that counts calls and tracks how many run at once.
struct CountingResolver {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CountingResolver {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TrackResolver for CountingResolver {
    async fn search_by_identifier(&self, request: &PreWarmRequest) -> anyhow::Result<Option<CatalogId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if request.isrc.starts_with("FAIL") {
            anyhow::bail!("catalog unavailable");
        }
        Ok(Some(CatalogId::Numeric(request.isrc.len() as i64)))
    }
}

fn orchestrator(lyrics: Arc<dyn LyricsFetcher>) -> Orchestrator {
    Orchestrator::new(
        Arc::new(Transport::with_clients(reqwest::Client::new(), None)),
        Arc::new(TrackIdCache::default()),
        lyrics,
        3,
    )
}

fn requests(prefix: &str, n: usize) -> Vec<PreWarmRequest> {
    (0..n)
        .map(|i| PreWarmRequest {
            isrc: format!("{}{:04}", prefix, i),
            service: "tidal".into(),
            ..Default::default()
        })
        .collect()
}

#[tokio::test]
async fn cover_succeeds_when_lyrics_fail() {
    let addr = start_server().await;
    let orch = orchestrator(Arc::new(FailingLyrics));

    let result = orch
        .fetch_cover_and_lyrics(&CoverLyricsRequest {
            cover_url: format!("http://{}/cover.jpg", addr),
            embed_lyrics: true,
            track_name: "Song".into(),
            artist_name: "Artist".into(),
            ..Default::default()
        })
        .await;

    assert!(result.success());
    assert_eq!(result.cover_data.as_deref(), Some(COVER));
    assert!(result.lyrics.is_none());
    assert!(result.lyrics_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn lyrics_survive_cover_failure() {
    let addr = start_server().await;
    let orch = orchestrator(Arc::new(StaticLyrics));

    let result = orch
        .fetch_cover_and_lyrics(&CoverLyricsRequest {
            cover_url: format!("http://{}/missing.jpg", addr),
            embed_lyrics: true,
            track_name: "Song".into(),
            artist_name: "Artist".into(),
            duration_ms: 215_500,
            ..Default::default()
        })
        .await;

    assert!(!result.success());
    assert!(result.cover_error.unwrap().contains("404"));
    let lrc = result.lyrics_lrc.unwrap();
    assert!(lrc.contains("[ti:Song]"));
    assert!(lrc.contains("[00:12.34]hello"));
}

#[tokio::test]
async fn skipped_tasks_leave_no_errors() {
    let orch = orchestrator(Arc::new(FailingLyrics));
    let result = orch.fetch_cover_and_lyrics(&CoverLyricsRequest::default()).await;
    assert!(result.success());
    assert!(result.cover_data.is_none());
    assert!(result.lyrics_error.is_none());
}

#[tokio::test]
async fn second_pre_warm_makes_no_remote_calls() {
    let resolver = Arc::new(CountingResolver::new(Duration::from_millis(30)));
    let orch = orchestrator(Arc::new(FailingLyrics)).with_resolver(Service::Tidal, resolver.clone());

    let first = orch.pre_warm(requests("USPW1", 10)).await;
    assert_eq!(first.dispatched, 10);
    assert_eq!(first.resolved, 10);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 10);
    let peak = resolver.max_in_flight.load(Ordering::SeqCst);
    assert!(peak >= 2, "lookups ran serially (peak {})", peak);
    assert!(peak <= 3, "more than 3 lookups in flight (peak {})", peak);
    assert_eq!(orch.cache().size(), 10);

    let second = orch.pre_warm(requests("USPW1", 10)).await;
    assert_eq!(second.skipped, 10);
    assert_eq!(second.dispatched, 0);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn pre_warm_swallows_failures() {
    let resolver = Arc::new(CountingResolver::new(Duration::from_millis(30)));
    let orch = orchestrator(Arc::new(FailingLyrics)).with_resolver(Service::Tidal, resolver.clone());

    let mut batch = requests("FAIL", 2);
    batch.extend(requests("USOK", 2));
    batch.push(PreWarmRequest {
        isrc: "USNOSERVICE1".into(),
        service: "napster".into(),
        ..Default::default()
    });

    let stats = orch.pre_warm(batch).await;
    assert_eq!(stats.requested, 5);
    assert_eq!(stats.resolved, 2);
    assert_eq!(stats.failed, 3);
    assert_eq!(orch.cache().size(), 2);
    assert!(orch.cache().get("usok0000").is_some());
}

#[tokio::test]
async fn spawned_pre_warm_can_be_awaited() {
    let resolver = Arc::new(CountingResolver::new(Duration::from_millis(30)));
    let orch = Arc::new(
        orchestrator(Arc::new(FailingLyrics)).with_resolver(Service::Tidal, resolver.clone()),
    );

    let handle = orch.spawn_pre_warm(requests("USBG", 4));
    let stats = handle.wait().await.unwrap();
    assert_eq!(stats.resolved, 4);

    let handle = orch.spawn_pre_warm(requests("USAB", 50));
    handle.abort();
    assert!(handle.wait().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_cancels_lookups_in_flight() {
    let resolver = Arc::new(CountingResolver::new(Duration::from_millis(200)));
    let orch = Arc::new(
        orchestrator(Arc::new(FailingLyrics)).with_resolver(Service::Tidal, resolver.clone()),
    );

    let handle = orch.spawn_pre_warm(requests("USCX", 30));
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.abort();
    assert!(handle.wait().await.is_none());

    let calls_at_abort = resolver.calls.load(Ordering::SeqCst);
    assert!(calls_at_abort <= 3);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(resolver.calls.load(Ordering::SeqCst), calls_at_abort);
    assert_eq!(resolver.in_flight.load(Ordering::SeqCst), calls_at_abort);
    assert_eq!(orch.cache().size(), 0);
}

#[tokio::test]
async fn blank_identifiers_are_not_dispatched() {
    let resolver = Arc::new(CountingResolver::new(Duration::from_millis(1)));
    let orch = orchestrator(Arc::new(FailingLyrics)).with_resolver(Service::Tidal, resolver.clone());

    let mut batch = requests("USOK", 1);
    batch.push(PreWarmRequest {
        isrc: "  ".into(),
        service: "tidal".into(),
        ..Default::default()
    });

    let stats = orch.pre_warm(batch).await;
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(orch.cache().size(), 1);
}
