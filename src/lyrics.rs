//! Lyrics lookup across several providers and LRC rendering.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LyricsLine {
    pub start_time_ms: u64,
    pub words: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    LineSynced,
    Unsynced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LyricsResponse {
    pub lines: Vec<LyricsLine>,
    pub sync_type: SyncType,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub struct LyricsQuery {
    pub spotify_id: String,
    pub track_name: String,
    pub artist_name: String,
    pub duration_secs: f64,
}

/// One lyrics provider. `Ok(None)` means the provider has nothing for the
/// track; errors are reserved for failed requests.
#[async_trait]
pub trait LyricsSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, query: &LyricsQuery) -> anyhow::Result<Option<LyricsResponse>>;
}

#[async_trait]
pub trait LyricsFetcher: Send + Sync {
    async fn fetch_all_sources(&self, query: &LyricsQuery) -> anyhow::Result<LyricsResponse>;
}

/// Tries each source in order and keeps the first result with lines.
#[derive(Clone, Default)]
pub struct LyricsClient {
    sources: Vec<Arc<dyn LyricsSource>>,
}

impl LyricsClient {
    pub fn new(sources: Vec<Arc<dyn LyricsSource>>) -> Self {
        Self { sources }
    }

    pub fn with_source(mut self, source: Arc<dyn LyricsSource>) -> Self {
        self.sources.push(source);
        self
    }
}

#[async_trait]
impl LyricsFetcher for LyricsClient {
    async fn fetch_all_sources(&self, query: &LyricsQuery) -> anyhow::Result<LyricsResponse> {
        let mut last_error = None;
        for source in &self.sources {
            match source.fetch(query).await {
                Ok(Some(mut lyrics)) if !lyrics.lines.is_empty() => {
                    if lyrics.source.is_empty() {
                        lyrics.source = source.name().to_string();
                    }
                    return Ok(lyrics);
                }
                Ok(_) => {
                    log_debug!(
                        "[lyrics] {} has no lyrics for {} - {}",
                        source.name(),
                        query.artist_name,
                        query.track_name
                    );
                }
                Err(e) => {
                    log_debug!("[lyrics] {} failed: {}", source.name(), e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e.context("all lyrics sources failed")),
            None => Err(anyhow::anyhow!("no lyrics found")),
        }
    }
}

/// `[mm:ss.xx]`, hundredths truncated.
pub fn lrc_timestamp(ms: u64) -> String {
    let minutes = ms / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let hundredths = (ms % 1000) / 10;
    format!("[{:02}:{:02}.{:02}]", minutes, seconds, hundredths)
}

/// Render as LRC with title/artist headers. Unsynced lyrics are emitted as
/// plain lines without timestamps.
pub fn to_lrc(lyrics: &LyricsResponse, track_name: &str, artist_name: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("[ti:{}]\n", track_name));
    out.push_str(&format!("[ar:{}]\n", artist_name));
    let by = if lyrics.source.is_empty() {
        "acquire-engine"
    } else {
        lyrics.source.as_str()
    };
    out.push_str(&format!("[by:{}]\n\n", by));

    for line in &lyrics.lines {
        match lyrics.sync_type {
            SyncType::LineSynced => {
                out.push_str(&lrc_timestamp(line.start_time_ms));
                out.push_str(&line.words);
            }
            SyncType::Unsynced => out.push_str(&line.words),
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<LyricsResponse>, bool);

    #[async_trait]
    impl LyricsSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self, _query: &LyricsQuery) -> anyhow::Result<Option<LyricsResponse>> {
            if self.1 {
                anyhow::bail!("upstream 500");
            }
            Ok(self.0.clone())
        }
    }

    fn synced() -> LyricsResponse {
        LyricsResponse {
            lines: vec![
                LyricsLine {
                    start_time_ms: 1_230,
                    words: "first".into(),
                },
                LyricsLine {
                    start_time_ms: 65_432,
                    words: "second".into(),
                },
            ],
            sync_type: SyncType::LineSynced,
            source: String::new(),
        }
    }

    #[test]
    fn timestamps() {
        assert_eq!(lrc_timestamp(0), "[00:00.00]");
        assert_eq!(lrc_timestamp(65_432), "[01:05.43]");
        assert_eq!(lrc_timestamp(600_000), "[10:00.00]");
    }

    #[test]
    fn lrc_has_headers_and_stamps() {
        let lrc = to_lrc(&synced(), "Song", "Artist");
        assert!(lrc.starts_with("[ti:Song]\n[ar:Artist]\n"));
        assert!(lrc.contains("[00:01.23]first\n"));
        assert!(lrc.contains("[01:05.43]second\n"));
    }

    #[tokio::test]
    async fn cascade_skips_failures_and_empty_results() {
        let client = LyricsClient::default()
            .with_source(Arc::new(Fixed(None, true)))
            .with_source(Arc::new(Fixed(None, false)))
            .with_source(Arc::new(Fixed(Some(synced()), false)));
        let lyrics = client.fetch_all_sources(&LyricsQuery::default()).await.unwrap();
        assert_eq!(lyrics.lines.len(), 2);
        assert_eq!(lyrics.source, "fixed");
    }

    #[tokio::test]
    async fn cascade_reports_failure() {
        let client = LyricsClient::new(vec![Arc::new(Fixed(None, true))]);
        assert!(client.fetch_all_sources(&LyricsQuery::default()).await.is_err());
        assert!(LyricsClient::default()
            .fetch_all_sources(&LyricsQuery::default())
            .await
            .is_err());
    }
}
