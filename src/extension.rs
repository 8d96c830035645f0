use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::file_bridge::FileBridge;
use crate::sandbox::{clean_path, AllowedDirs, Permissions, Sandbox};
use crate::script::{EngineState, QuickJsEngine, ScriptEngine, ScriptRunner};
use crate::transport::Transport;

pub const MANIFEST_FILE: &str = "manifest.json";

fn default_entry() -> String {
    "index.js".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct ExtensionRuntimeSpec {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtensionManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_entry")]
    pub entry: String,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub runtime: Option<ExtensionRuntimeSpec>,
}

impl ExtensionManifest {
    pub fn parse(json: &str) -> Result<Self> {
        let manifest: ExtensionManifest = serde_json::from_str(json)
            .map_err(|e| Error::decode(format!("manifest json error: {}", e)))?;
        if manifest.name.trim().is_empty() {
            return Err(Error::invalid_input("manifest name is required"));
        }
        if manifest.entry.trim().is_empty() {
            return Err(Error::invalid_input("manifest entry is required"));
        }
        if !is_contained(&clean_path(Path::new(&manifest.entry))) {
            return Err(Error::invalid_input(format!(
                "manifest entry '{}' must be a relative path inside the extension",
                manifest.entry
            )));
        }
        Ok(manifest)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::parse(&s).map_err(|e| {
            log_warn!("[extension] manifest at {} rejected: {}", path.display(), e);
            e
        })
    }

    /// Location of the entry script under the extension directory `dir`.
    pub fn entry_path(&self, dir: &Path) -> PathBuf {
        dir.join(clean_path(Path::new(&self.entry)))
    }

    /// Directory name for this extension's private data.
    pub fn data_dir_name(&self) -> String {
        sanitize_name(&self.name)
    }

    fn timeout(&self) -> Duration {
        self.runtime
            .as_ref()
            .and_then(|r| r.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO)
    }
}

/// True for a cleaned relative path that stays below its base directory.
fn is_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
        && path.components().next().is_some()
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "extension".to_string()
    } else {
        cleaned
    }
}

/// One loaded extension: manifest, sandbox and its script engine.
pub struct ExtensionRuntime {
    manifest: ExtensionManifest,
    dir: PathBuf,
    bridge: Arc<FileBridge>,
    runner: ScriptRunner,
    memory_limit_mb: usize,
    handle: Handle,
    engine: parking_lot::Mutex<Arc<QuickJsEngine>>,
    /// Held for a whole evaluation. The engine has one interrupt flag, so a
    /// run's deadline must not start while another run is executing.
    exec: tokio::sync::Mutex<()>,
}

impl ExtensionRuntime {
    pub fn new(
        manifest: ExtensionManifest,
        dir: &Path,
        config: &EngineConfig,
        allowed_dirs: Arc<AllowedDirs>,
        transport: Arc<Transport>,
    ) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("extension runtime needs a tokio runtime: {}", e)))?;

        let data_dir = config.extensions_data_dir.join(manifest.data_dir_name());
        std::fs::create_dir_all(&data_dir)?;

        let sandbox = Sandbox::new(
            manifest.name.clone(),
            manifest.permissions.clone(),
            &data_dir,
            allowed_dirs,
        )?;
        let bridge = Arc::new(FileBridge::new(
            sandbox,
            transport,
            config.extension_user_agent.clone(),
        ));

        let memory_limit_mb = manifest
            .runtime
            .as_ref()
            .and_then(|r| r.memory_limit_mb)
            .unwrap_or(config.script_memory_limit_mb);
        let engine = build_engine(memory_limit_mb, &bridge, &handle)?;

        log_info!(
            "[extension:{}] loaded v{} from {}",
            manifest.name,
            manifest.version,
            dir.display()
        );

        Ok(Self {
            manifest,
            dir: dir.to_path_buf(),
            bridge,
            runner: ScriptRunner::new(config.script_timeout(), config.script_grace()),
            memory_limit_mb,
            handle,
            engine: parking_lot::Mutex::new(engine),
            exec: tokio::sync::Mutex::new(()),
        })
    }

    pub fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    pub fn bridge(&self) -> &Arc<FileBridge> {
        &self.bridge
    }

    pub fn data_dir(&self) -> &Path {
        self.bridge.sandbox().data_dir()
    }

    pub fn state(&self) -> EngineState {
        self.engine.lock().state()
    }

    /// Evaluate the manifest's entry script.
    pub async fn load_entry(&self) -> Result<serde_json::Value> {
        let path = self.manifest.entry_path(&self.dir);
        let source = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read entry {}: {}", path.display(), e),
            ))
        })?;
        self.run_script(&source, Duration::ZERO).await
    }

    /// Evaluate `source`; zero timeout falls back to the manifest's, then
    /// the configured default. Concurrent calls run one at a time and each
    /// timeout counts from the moment its own evaluation starts.
    pub async fn run_script(&self, source: &str, timeout: Duration) -> Result<serde_json::Value> {
        let _running = self.exec.lock().await;
        let engine = self.engine.lock().clone();
        if engine.state() == EngineState::Poisoned {
            return Err(Error::Script(format!(
                "extension '{}' was interrupted and must be reset",
                self.manifest.name
            )));
        }

        let timeout = if timeout.is_zero() {
            self.manifest.timeout()
        } else {
            timeout
        };
        let result = self
            .runner
            .run_with_recover(engine, source.to_string(), timeout)
            .await;
        if let Err(e) = &result {
            log_warn!("[extension:{}] script failed: {}", self.manifest.name, e);
        }
        result
    }

    /// Call a global function with JSON arguments.
    pub async fn invoke(
        &self,
        function: &str,
        args: &[serde_json::Value],
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let name = serde_json::to_string(function)?;
        let args = serde_json::to_string(args)?;
        let source = format!(
            "(function() {{ var f = globalThis[{name}]; \
             if (typeof f !== 'function') throw new Error('function ' + {name} + ' is not defined'); \
             return f.apply(null, {args}); }})()"
        );
        self.run_script(&source, timeout).await
    }

    /// Replace the engine with a fresh one. Globals defined by the entry
    /// script are gone until [`load_entry`](Self::load_entry) runs again.
    pub fn reset(&self) -> Result<()> {
        let engine = build_engine(self.memory_limit_mb, &self.bridge, &self.handle)?;
        *self.engine.lock() = engine;
        log_info!("[extension:{}] engine reset", self.manifest.name);
        Ok(())
    }
}

fn build_engine(
    memory_limit_mb: usize,
    bridge: &Arc<FileBridge>,
    handle: &Handle,
) -> Result<Arc<QuickJsEngine>> {
    let engine = QuickJsEngine::new(memory_limit_mb)?;
    let bridge = Arc::clone(bridge);
    let handle = handle.clone();
    engine
        .with(move |ctx| crate::js_api::install(&ctx, bridge, handle))
        .map_err(|e| Error::Script(format!("failed to install extension API: {}", e)))?;
    Ok(Arc::new(engine))
}

/// Load the extension in `dir` (which must contain `manifest.json`).
pub fn load_extension(
    dir: &Path,
    config: &EngineConfig,
    allowed_dirs: Arc<AllowedDirs>,
    transport: Arc<Transport>,
) -> Result<ExtensionRuntime> {
    let manifest = ExtensionManifest::from_file(&dir.join(MANIFEST_FILE))?;
    let entry = manifest.entry_path(dir);
    if !entry.is_file() {
        return Err(Error::invalid_input(format!(
            "entry script {} not found",
            entry.display()
        )));
    }
    ExtensionRuntime::new(manifest, dir, config, allowed_dirs, transport)
}
