//! Host-facing entry point owning every backend service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::content_index::{ContentIndexRegistry, FileExistence, TrackQuery};
use crate::error::{Error, Result};
use crate::extension::{load_extension, ExtensionRuntime};
use crate::lyrics::{LyricsClient, LyricsFetcher};
use crate::orchestrator::{
    CoverLyricsRequest, CoverLyricsResult, Orchestrator, PreWarmHandle, PreWarmRequest,
    TrackResolver,
};
use crate::sandbox::AllowedDirs;
use crate::tags::{FlacTagReader, TagReader};
use crate::track_cache::{Service, TrackIdCache};
use crate::transport::Transport;

/// Collaborators supplied by the host. Anything left unset falls back to a
/// default: FLAC tag reading, no lyrics sources, no resolvers.
#[derive(Default)]
pub struct Collaborators {
    pub tag_reader: Option<Arc<dyn TagReader>>,
    pub lyrics: Option<Arc<dyn LyricsFetcher>>,
    pub resolvers: Vec<(Service, Arc<dyn TrackResolver>)>,
}

pub struct AcquisitionBackend {
    config: EngineConfig,
    allowed_dirs: Arc<AllowedDirs>,
    transport: Arc<Transport>,
    track_cache: Arc<TrackIdCache>,
    index: Arc<ContentIndexRegistry>,
    orchestrator: Arc<Orchestrator>,
}

impl AcquisitionBackend {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let transport = Arc::new(Transport::new(config.request_timeout())?);
        Self::with_transport(config, collaborators, transport)
    }

    pub fn with_transport(
        config: EngineConfig,
        collaborators: Collaborators,
        transport: Arc<Transport>,
    ) -> Result<Self> {
        config.ensure_directories_exist()?;

        let allowed_dirs = Arc::new(AllowedDirs::new());
        if !config.allowed_download_dirs.is_empty() {
            allowed_dirs.set(&config.allowed_download_dirs);
        }

        let track_cache = Arc::new(TrackIdCache::new(
            config.track_cache_ttl(),
            config.track_cache_sweep_interval(),
        ));
        let tag_reader = collaborators
            .tag_reader
            .unwrap_or_else(|| Arc::new(FlacTagReader) as Arc<dyn TagReader>);
        let index = Arc::new(ContentIndexRegistry::new(tag_reader, config.index_ttl()));

        let lyrics = collaborators
            .lyrics
            .unwrap_or_else(|| Arc::new(LyricsClient::default()) as Arc<dyn LyricsFetcher>);
        let mut orchestrator = Orchestrator::new(
            Arc::clone(&transport),
            Arc::clone(&track_cache),
            lyrics,
            config.prewarm_concurrency,
        );
        for (service, resolver) in collaborators.resolvers {
            orchestrator = orchestrator.with_resolver(service, resolver);
        }

        log_info!(
            "[backend] ready (fingerprint bypass: {})",
            transport.supports_fingerprint_bypass()
        );

        Ok(Self {
            config,
            allowed_dirs,
            transport,
            track_cache,
            index,
            orchestrator: Arc::new(orchestrator),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn track_cache(&self) -> &Arc<TrackIdCache> {
        &self.track_cache
    }

    pub fn content_index(&self) -> &Arc<ContentIndexRegistry> {
        &self.index
    }

    pub fn set_allowed_download_dirs(&self, dirs: &[PathBuf]) {
        self.allowed_dirs.set(dirs);
    }

    pub fn add_allowed_download_dir(&self, dir: &Path) {
        self.allowed_dirs.add(dir);
    }

    pub fn allowed_download_dirs(&self) -> Vec<PathBuf> {
        self.allowed_dirs.snapshot()
    }

    pub fn load_extension(&self, dir: &Path) -> Result<ExtensionRuntime> {
        load_extension(
            dir,
            &self.config,
            Arc::clone(&self.allowed_dirs),
            Arc::clone(&self.transport),
        )
    }

    pub fn clear_track_cache(&self) {
        self.track_cache.clear();
    }

    pub fn cache_size(&self) -> usize {
        self.track_cache.size()
    }

    pub fn pre_warm_cache(&self, tracks: Vec<PreWarmRequest>) -> PreWarmHandle {
        self.orchestrator.spawn_pre_warm(tracks)
    }

    pub fn pre_warm_cache_json(&self, tracks_json: &str) -> Result<PreWarmHandle> {
        let tracks: Vec<PreWarmRequest> = serde_json::from_str(tracks_json)
            .map_err(|e| Error::decode(format!("failed to parse tracks JSON: {}", e)))?;
        Ok(self.pre_warm_cache(tracks))
    }

    pub async fn fetch_cover_and_lyrics(&self, request: &CoverLyricsRequest) -> CoverLyricsResult {
        self.orchestrator.fetch_cover_and_lyrics(request).await
    }

    pub async fn check_files_exist_parallel(
        &self,
        output_dir: &Path,
        tracks: Vec<TrackQuery>,
    ) -> Vec<FileExistence> {
        self.index.check_files_exist_parallel(output_dir, tracks).await
    }

    pub async fn find_existing(&self, output_dir: &Path, isrc: &str) -> Option<PathBuf> {
        self.index.find_existing(output_dir, isrc).await
    }

    pub fn add_to_index(&self, output_dir: &Path, isrc: &str, path: &Path) {
        self.index.add(output_dir, isrc, path);
    }

    pub fn invalidate_index(&self, output_dir: &Path) {
        self.index.invalidate(output_dir);
    }
}
