//! Capability and path policy for extension scripts.
//!
//! Every extension gets a private data directory. Relative paths resolve
//! inside it and may never climb out; absolute paths are refused unless they
//! fall under one of the download directories the host registered. Network
//! access is limited to the domains listed in the manifest.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Capability flags declared by an extension manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Permissions {
    #[serde(default)]
    pub file: bool,
    /// Allowed network domains; `*.example.com` admits subdomains only
    #[serde(default)]
    pub network: Vec<String>,
}

/// Process-wide set of directories scripts may write to with absolute paths.
/// Read on every path check, written only by the host.
#[derive(Debug, Default)]
pub struct AllowedDirs {
    dirs: RwLock<Vec<PathBuf>>,
}

impl AllowedDirs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list
    pub fn set(&self, dirs: &[PathBuf]) {
        let resolved: Vec<PathBuf> = dirs.iter().filter_map(|d| absolutize(d).ok()).collect();
        log_info!("[sandbox] Allowed download directories set: {:?}", resolved);
        *self.dirs.write() = resolved;
    }

    pub fn add(&self, dir: &Path) {
        match absolutize(dir) {
            Ok(abs) => {
                let mut dirs = self.dirs.write();
                if !dirs.contains(&abs) {
                    log_debug!("[sandbox] Allowed download directory added: {}", abs.display());
                    dirs.push(abs);
                }
            }
            Err(e) => log_warn!("[sandbox] Ignoring download directory {}: {}", dir.display(), e),
        }
    }

    /// Component-wise prefix test against an already absolute, clean path
    pub fn contains(&self, abs_path: &Path) -> bool {
        self.dirs.read().iter().any(|dir| abs_path.starts_with(dir))
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.dirs.read().clone()
    }
}

/// Policy bound to one extension instance.
#[derive(Debug, Clone)]
pub struct Sandbox {
    extension: String,
    permissions: Permissions,
    data_dir: PathBuf,
    allowed_dirs: Arc<AllowedDirs>,
}

impl Sandbox {
    pub fn new(
        extension: impl Into<String>,
        permissions: Permissions,
        data_dir: &Path,
        allowed_dirs: Arc<AllowedDirs>,
    ) -> Result<Self> {
        Ok(Self {
            extension: extension.into(),
            permissions,
            data_dir: absolutize(data_dir)?,
            allowed_dirs,
        })
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// Resolve a script-supplied path to an absolute location it may touch.
    pub fn validate_path(&self, path: &str) -> Result<PathBuf> {
        let result = self.resolve_path(path);
        if let Err(e) = &result {
            log_warn!("[sandbox] [{}] rejected path '{}': {}", self.extension, path, e);
        }
        result
    }

    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        if !self.permissions.file {
            return Err(Error::permission_denied(
                "extension does not have 'file' permission",
            ));
        }
        if path.trim().is_empty() {
            return Err(Error::invalid_input("path is required"));
        }

        let cleaned = clean_path(Path::new(path));

        if cleaned.is_absolute() {
            if self.allowed_dirs.contains(&cleaned) {
                return Ok(cleaned);
            }
            return Err(Error::permission_denied(
                "absolute paths are not allowed. Use relative paths within extension sandbox",
            ));
        }

        let resolved = clean_path(&self.data_dir.join(&cleaned));
        if !resolved.starts_with(&self.data_dir) {
            return Err(Error::PathTraversal {
                path: path.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Fail-closed check of a URL's host against the manifest allow-list.
    pub fn validate_domain(&self, raw_url: &str) -> Result<url::Url> {
        let parsed = url::Url::parse(raw_url)
            .map_err(|e| Error::invalid_input(format!("invalid URL '{}': {}", raw_url, e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::permission_denied(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
            .ok_or_else(|| Error::invalid_input(format!("URL '{}' has no host", raw_url)))?;

        if self
            .permissions
            .network
            .iter()
            .any(|pattern| domain_matches(pattern, &host))
        {
            return Ok(parsed);
        }

        log_warn!("[sandbox] [{}] blocked network access to {}", self.extension, host);
        Err(Error::DomainNotAllowed { domain: host })
    }
}

fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() {
        return false;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.len() > suffix.len() + 1
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.';
    }
    host == pattern
        || (host.ends_with(&pattern)
            && host.as_bytes()[host.len() - pattern.len() - 1] == b'.')
}

/// Lexical normalization: drops `.`, folds `name/..`, keeps leading `..` on
/// relative paths and discards `..` directly under the root.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Absolute, cleaned form of `path` (relative paths join the working directory).
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(clean_path(path));
    }
    let cwd = std::env::current_dir()?;
    Ok(clean_path(&cwd.join(path)))
}
