//! Acquisition backend: sandboxed extension scripts, a challenge-aware HTTP
//! transport and the caches that keep repeat downloads cheap.

#[macro_use]
pub mod logging;

pub mod backend;
pub mod config;
pub mod content_index;
pub mod diagnostics;
pub mod error;
pub mod extension;
pub mod file_bridge;
pub mod fingerprint;
mod js_api;
pub mod lyrics;
pub mod orchestrator;
pub mod sandbox;
pub mod script;
pub mod tags;
pub mod track_cache;
pub mod transport;

pub use backend::{AcquisitionBackend, Collaborators};
pub use config::EngineConfig;
pub use error::{Error, Result};
