//! Concurrent cover/lyrics fetching and track id cache pre-warming.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{Error, Result};
use crate::lyrics::{to_lrc, LyricsFetcher, LyricsQuery, LyricsResponse};
use crate::track_cache::{CatalogId, Service, TrackIdCache};
use crate::transport::Transport;

pub const DEFAULT_PREWARM_CONCURRENCY: usize = 3;

/// Size tokens used by the Spotify image CDN, smallest first.
const COVER_SIZE_TOKENS: &[&str] = &["ab67616d00004851", "ab67616d00001e02", "ab67616d0000b273"];
const COVER_MAX_TOKEN: &str = "ab67616d000082c1";

/// Rewrite a known CDN cover URL to its largest rendition.
pub fn upgrade_cover_url(url: &str) -> String {
    for token in COVER_SIZE_TOKENS {
        if url.contains(token) {
            return url.replace(token, COVER_MAX_TOKEN);
        }
    }
    url.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CoverLyricsRequest {
    pub cover_url: String,
    pub max_quality_cover: bool,
    pub spotify_id: String,
    pub track_name: String,
    pub artist_name: String,
    pub embed_lyrics: bool,
    pub duration_ms: u64,
}

/// Each half succeeds or fails on its own.
#[derive(Debug, Clone, Default)]
pub struct CoverLyricsResult {
    pub cover_data: Option<Vec<u8>>,
    pub lyrics: Option<LyricsResponse>,
    pub lyrics_lrc: Option<String>,
    pub cover_error: Option<String>,
    pub lyrics_error: Option<String>,
}

impl CoverLyricsResult {
    /// Lyrics are optional: only a failed cover fails the whole fetch.
    pub fn success(&self) -> bool {
        self.cover_error.is_none()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": self.success(),
            "cover_data": self
                .cover_data
                .as_ref()
                .map(|d| base64::engine::general_purpose::STANDARD.encode(d)),
            "lyrics": self.lyrics,
            "lyrics_lrc": self.lyrics_lrc,
            "cover_error": self.cover_error,
            "lyrics_error": self.lyrics_error,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PreWarmRequest {
    #[serde(alias = "identifier")]
    pub isrc: String,
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub artist_name: String,
    #[serde(default, alias = "external_id")]
    pub spotify_id: String,
    #[serde(default)]
    pub service: String,
}

/// Looks a recording up in one remote catalog.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn search_by_identifier(&self, request: &PreWarmRequest) -> anyhow::Result<Option<CatalogId>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreWarmStats {
    pub requested: usize,
    pub skipped: usize,
    pub dispatched: usize,
    pub resolved: usize,
    pub failed: usize,
}

/// A spawned pre-warm batch.
pub struct PreWarmHandle {
    handle: JoinHandle<PreWarmStats>,
}

impl PreWarmHandle {
    /// `None` when the batch was aborted.
    pub async fn wait(self) -> Option<PreWarmStats> {
        self.handle.await.ok()
    }

    /// Cancel the batch, including resolver lookups already in flight.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub struct Orchestrator {
    transport: Arc<Transport>,
    cache: Arc<TrackIdCache>,
    lyrics: Arc<dyn LyricsFetcher>,
    resolvers: HashMap<Service, Arc<dyn TrackResolver>>,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<Transport>,
        cache: Arc<TrackIdCache>,
        lyrics: Arc<dyn LyricsFetcher>,
        concurrency: usize,
    ) -> Self {
        Self {
            transport,
            cache,
            lyrics,
            resolvers: HashMap::new(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_resolver(mut self, service: Service, resolver: Arc<dyn TrackResolver>) -> Self {
        self.resolvers.insert(service, resolver);
        self
    }

    pub fn cache(&self) -> &Arc<TrackIdCache> {
        &self.cache
    }

    pub async fn download_cover(&self, url: &str, max_quality: bool) -> Result<Vec<u8>> {
        let url = if max_quality {
            upgrade_cover_url(url)
        } else {
            url.to_string()
        };
        let response = self.transport.get(&url, &HashMap::new()).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::network(format!(
                "cover download failed: HTTP {}",
                status.as_u16()
            )));
        }
        let data = response.bytes().await?;
        if data.is_empty() {
            return Err(Error::network("cover download returned no data"));
        }
        Ok(data.to_vec())
    }

    /// Fetch the cover and lyrics concurrently. Either task is skipped when
    /// not asked for.
    pub async fn fetch_cover_and_lyrics(&self, request: &CoverLyricsRequest) -> CoverLyricsResult {
        let cover = async {
            if request.cover_url.is_empty() {
                return None;
            }
            Some(
                self.download_cover(&request.cover_url, request.max_quality_cover)
                    .await,
            )
        };

        let lyrics = async {
            if !request.embed_lyrics {
                return None;
            }
            let query = LyricsQuery {
                spotify_id: request.spotify_id.clone(),
                track_name: request.track_name.clone(),
                artist_name: request.artist_name.clone(),
                duration_secs: request.duration_ms as f64 / 1000.0,
            };
            Some(self.lyrics.fetch_all_sources(&query).await)
        };

        let (cover, lyrics) = tokio::join!(cover, lyrics);
        let mut result = CoverLyricsResult::default();

        match cover {
            Some(Ok(data)) => result.cover_data = Some(data),
            Some(Err(e)) => {
                log_warn!("[orchestrator] cover fetch failed: {}", e);
                result.cover_error = Some(e.to_string());
            }
            None => {}
        }

        match lyrics {
            Some(Ok(found)) if !found.lines.is_empty() => {
                result.lyrics_lrc = Some(to_lrc(&found, &request.track_name, &request.artist_name));
                result.lyrics = Some(found);
            }
            Some(Ok(_)) => result.lyrics_error = Some("no lyrics found".to_string()),
            Some(Err(e)) => {
                log_debug!("[orchestrator] lyrics unavailable: {:#}", e);
                result.lyrics_error = Some(format!("{:#}", e));
            }
            None => {}
        }

        result
    }

    /// Resolve catalog ids for requests not yet cached, at most
    /// `concurrency` at a time. Failures only show up in the stats.
    ///
    /// Resolver tasks live in a `JoinSet` owned by this future, so dropping
    /// or aborting it cancels every lookup still pending.
    pub async fn pre_warm(&self, requests: Vec<PreWarmRequest>) -> PreWarmStats {
        let mut stats = PreWarmStats {
            requested: requests.len(),
            ..Default::default()
        };
        if requests.is_empty() {
            return stats;
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for request in requests {
            if request.isrc.trim().is_empty() {
                log_debug!("[prewarm] skipping request without identifier");
                stats.failed += 1;
                continue;
            }
            if self.cache.get(&request.isrc).is_some() {
                stats.skipped += 1;
                continue;
            }
            let resolver = Service::parse(&request.service)
                .and_then(|service| self.resolvers.get(&service).map(|r| (service, Arc::clone(r))));
            let Some((service, resolver)) = resolver else {
                log_debug!(
                    "[prewarm] no resolver for service '{}' ({})",
                    request.service,
                    request.isrc
                );
                stats.failed += 1;
                continue;
            };

            stats.dispatched += 1;
            let semaphore = Arc::clone(&semaphore);
            let cache = Arc::clone(&self.cache);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                match resolver.search_by_identifier(&request).await {
                    Ok(Some(id)) => cache.record(&request.isrc, service, id),
                    Ok(None) => {
                        log_debug!("[prewarm] {} not found on {}", request.isrc, service.as_str());
                        false
                    }
                    Err(e) => {
                        log_debug!(
                            "[prewarm] {} lookup on {} failed: {}",
                            request.isrc,
                            service.as_str(),
                            e
                        );
                        false
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => stats.resolved += 1,
                Ok(false) => {}
                Err(e) => log_debug!("[prewarm] resolver task ended abnormally: {}", e),
            }
        }

        stats.failed += stats.dispatched - stats.resolved;
        log_info!(
            "[prewarm] {} requested, {} cached, {} resolved, {} failed",
            stats.requested,
            stats.skipped,
            stats.resolved,
            stats.failed
        );
        stats
    }

    /// Run [`pre_warm`](Self::pre_warm) in the background.
    pub fn spawn_pre_warm(self: &Arc<Self>, requests: Vec<PreWarmRequest>) -> PreWarmHandle {
        let this = Arc::clone(self);
        PreWarmHandle {
            handle: tokio::spawn(async move { this.pre_warm(requests).await }),
        }
    }
}
