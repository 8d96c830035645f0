//! Embedded tag access for indexed audio files.

use std::path::Path;

/// The subset of embedded tags the backend cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackTags {
    pub isrc: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
}

/// Reads metadata from a file on disk. Implementations are called from
/// blocking threads.
pub trait TagReader: Send + Sync {
    fn read_metadata(&self, path: &Path) -> anyhow::Result<TrackTags>;

    /// Extensions (lowercase, without dot) this reader handles
    fn extensions(&self) -> &[&'static str] {
        &["flac"]
    }
}

/// Vorbis-comment reader for FLAC files.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlacTagReader;

impl TagReader for FlacTagReader {
    fn read_metadata(&self, path: &Path) -> anyhow::Result<TrackTags> {
        let tag = metaflac::Tag::read_from_path(path)?;
        let first = |key: &str| {
            tag.get_vorbis(key)
                .and_then(|mut it| it.next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Ok(TrackTags {
            isrc: first("isrc"),
            title: first("title"),
            artist: first("artist"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_flac_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.flac");
        std::fs::write(&path, b"not a flac stream").unwrap();
        assert!(FlacTagReader.read_metadata(&path).is_err());
    }
}
