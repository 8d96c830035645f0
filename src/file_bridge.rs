//! Sandboxed file operations for one extension.
//!
//! Every path argument goes through [`Sandbox::validate_path`] before the
//! filesystem is touched. Downloads additionally check the URL against the
//! manifest's domain list before any I/O.

use futures_util::TryStreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

use crate::error::{Error, Result};
use crate::sandbox::Sandbox;
use crate::transport::Transport;

/// Fixed chunk size for streaming downloads to disk.
pub const DOWNLOAD_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub size: u64,
}

pub struct FileBridge {
    sandbox: Sandbox,
    transport: Arc<Transport>,
    user_agent: String,
}

impl FileBridge {
    pub fn new(sandbox: Sandbox, transport: Arc<Transport>, user_agent: impl Into<String>) -> Self {
        Self {
            sandbox,
            transport,
            user_agent: user_agent.into(),
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn validate_path(&self, path: &str) -> Result<PathBuf> {
        self.sandbox.validate_path(path)
    }

    /// Stream `url` into `path`. `on_progress(written, total)` is called after
    /// each chunk, but only when the server announced a content length.
    pub async fn download(
        &self,
        url: &str,
        path: &str,
        headers: &HashMap<String, String>,
        mut on_progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<DownloadOutcome> {
        self.sandbox.validate_domain(url)?;
        let full_path = self.sandbox.validate_path(path)?;

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_context("failed to create directory", e))?;
        }

        let mut headers = headers.clone();
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("user-agent")) {
            headers.insert("User-Agent".to_string(), self.user_agent.clone());
        }

        let response = self.transport.get(url, &headers).await?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(Error::network(format!("HTTP error: {}", status.as_u16())));
        }
        let total = response.content_length().unwrap_or(0);

        let mut file = tokio::fs::File::create(&full_path)
            .await
            .map_err(|e| io_context("failed to create file", e))?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(stream);
        let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        let mut written: u64 = 0;

        loop {
            let read = reader
                .read(&mut buf)
                .await
                .map_err(|e| Error::network(format!("failed to read response: {}", e)))?;
            if read == 0 {
                break;
            }
            let wrote = file
                .write(&buf[..read])
                .await
                .map_err(|e| io_context("failed to write file", e))?;
            written += wrote as u64;
            if wrote != read {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write",
                )));
            }
            if total > 0 {
                if let Some(cb) = on_progress.as_mut() {
                    cb(written, total);
                }
            }
        }
        file.flush()
            .await
            .map_err(|e| io_context("failed to write file", e))?;

        log_info!(
            "[extension:{}] Downloaded {} bytes to {}",
            self.sandbox.extension(),
            written,
            full_path.display()
        );
        Ok(DownloadOutcome {
            path: full_path,
            size: written,
        })
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let full = self.sandbox.validate_path(path)?;
        Ok(full.exists())
    }

    pub fn read(&self, path: &str) -> Result<String> {
        let full = self.sandbox.validate_path(path)?;
        let data = std::fs::read(&full)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub fn write(&self, path: &str, data: &str) -> Result<PathBuf> {
        let full = self.sandbox.validate_path(path)?;
        ensure_parent(&full)?;
        std::fs::write(&full, data.as_bytes())?;
        Ok(full)
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        let full = self.sandbox.validate_path(path)?;
        std::fs::remove_file(&full)?;
        Ok(())
    }

    pub fn copy(&self, src: &str, dst: &str) -> Result<PathBuf> {
        let full_src = self.sandbox.validate_path(src)?;
        let full_dst = self.sandbox.validate_path(dst)?;
        ensure_parent(&full_dst)?;
        std::fs::copy(&full_src, &full_dst).map_err(|e| io_context("failed to copy", e))?;
        Ok(full_dst)
    }

    /// Rename only; a cross-device move fails instead of copying.
    pub fn move_file(&self, src: &str, dst: &str) -> Result<PathBuf> {
        let full_src = self.sandbox.validate_path(src)?;
        let full_dst = self.sandbox.validate_path(dst)?;
        ensure_parent(&full_dst)?;
        std::fs::rename(&full_src, &full_dst).map_err(|e| io_context("failed to move", e))?;
        Ok(full_dst)
    }

    pub fn size(&self, path: &str) -> Result<u64> {
        let full = self.sandbox.validate_path(path)?;
        Ok(std::fs::metadata(&full)?.len())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_context("failed to create directory", e))?;
    }
    Ok(())
}

fn io_context(what: &str, err: std::io::Error) -> Error {
    Error::Io(std::io::Error::new(err.kind(), format!("{}: {}", what, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{AllowedDirs, Permissions};
    use std::time::Duration;

    fn bridge(root: &Path, file: bool) -> FileBridge {
        let permissions = Permissions {
            file,
            network: vec!["example.com".into()],
        };
        let sandbox = Sandbox::new(
            "test-ext",
            permissions,
            &root.join("data"),
            Arc::new(AllowedDirs::new()),
        )
        .unwrap();
        let transport = Arc::new(Transport::with_clients(reqwest::Client::new(), None));
        FileBridge::new(sandbox, transport, "Test/1.0")
    }

    #[test]
    fn write_read_size_delete() {
        let root = tempfile::tempdir().unwrap();
        let bridge = bridge(root.path(), true);

        let written = bridge.write("cache/a.txt", "hello").unwrap();
        assert!(written.starts_with(root.path().join("data")));
        assert_eq!(bridge.read("cache/a.txt").unwrap(), "hello");
        assert_eq!(bridge.size("cache/a.txt").unwrap(), 5);
        assert!(bridge.exists("cache/a.txt").unwrap());
        bridge.delete("cache/a.txt").unwrap();
        assert!(!bridge.exists("cache/a.txt").unwrap());
    }

    #[test]
    fn copy_and_move_validate_both_paths() {
        let root = tempfile::tempdir().unwrap();
        let bridge = bridge(root.path(), true);
        bridge.write("a.txt", "x").unwrap();

        let err = bridge.copy("a.txt", "../escape.txt").unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
        let err = bridge.move_file("../../etc/passwd", "b.txt").unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));

        bridge.copy("a.txt", "nested/dir/b.txt").unwrap();
        bridge.move_file("nested/dir/b.txt", "other/c.txt").unwrap();
        assert!(bridge.exists("other/c.txt").unwrap());
        assert!(!bridge.exists("nested/dir/b.txt").unwrap());
        assert!(bridge.move_file("missing.txt", "d.txt").is_err());
    }

    #[test]
    fn operations_require_file_permission() {
        let root = tempfile::tempdir().unwrap();
        let bridge = bridge(root.path(), false);
        assert!(matches!(
            bridge.write("a.txt", "x").unwrap_err(),
            Error::PermissionDenied(_)
        ));
    }

    #[tokio::test]
    async fn download_checks_domain_before_io() {
        let root = tempfile::tempdir().unwrap();
        let bridge = bridge(root.path(), true);
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            bridge.download("https://evil.test/x.flac", "x.flac", &HashMap::new(), None),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, Error::DomainNotAllowed { .. }));
        assert!(!root.path().join("data").join("x.flac").exists());
    }
}
