//! Cross-service track id cache keyed by recording identifier (ISRC).
//!
//! Each entry holds the per-catalog ids found so far and a single expiry that
//! every write pushes forward. Expired entries are never returned: a read that
//! finds one removes it, and writes sweep the whole map at most once per
//! sweep interval.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Catalogs whose track ids are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Tidal,
    Qobuz,
    Amazon,
}

impl Service {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "tidal" => Some(Service::Tidal),
            "qobuz" => Some(Service::Qobuz),
            "amazon" => Some(Service::Amazon),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Tidal => "tidal",
            Service::Qobuz => "qobuz",
            Service::Amazon => "amazon",
        }
    }
}

/// An id as returned by a catalog: numeric for Tidal/Qobuz, text for Amazon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CatalogId {
    Numeric(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackIdEntry {
    pub tidal_track_id: Option<i64>,
    pub qobuz_track_id: Option<i64>,
    pub amazon_track_id: Option<String>,
    pub expires_at: Instant,
}

impl TrackIdEntry {
    fn empty(now: Instant) -> Self {
        Self {
            tidal_track_id: None,
            qobuz_track_id: None,
            amazon_track_id: None,
            expires_at: now,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn id_for(&self, service: Service) -> Option<CatalogId> {
        match service {
            Service::Tidal => self.tidal_track_id.map(CatalogId::Numeric),
            Service::Qobuz => self.qobuz_track_id.map(CatalogId::Numeric),
            Service::Amazon => self.amazon_track_id.clone().map(CatalogId::Text),
        }
    }
}

/// Canonical key form: identifiers compare case-insensitively.
pub fn normalize_id(id: &str) -> String {
    id.trim().to_uppercase()
}

struct CacheState {
    entries: HashMap<String, TrackIdEntry>,
    last_sweep: Option<Instant>,
}

pub struct TrackIdCache {
    state: RwLock<CacheState>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl Default for TrackIdCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_SWEEP_INTERVAL)
    }
}

impl TrackIdCache {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                last_sweep: None,
            }),
            ttl,
            sweep_interval,
        }
    }

    pub fn get(&self, id: &str) -> Option<TrackIdEntry> {
        let key = normalize_id(id);
        {
            let state = self.state.read();
            let entry = state.entries.get(&key)?;
            if !entry.is_expired(Instant::now()) {
                return Some(entry.clone());
            }
        }

        // Expired: re-check under the write lock since a writer may have refreshed it
        let mut state = self.state.write();
        if let Some(entry) = state.entries.get(&key) {
            if !entry.is_expired(Instant::now()) {
                return Some(entry.clone());
            }
            state.entries.remove(&key);
            log_debug!("[cache] expired track ids dropped for {}", key);
        }
        None
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn set_tidal(&self, id: &str, track_id: i64) {
        self.upsert(id, |entry| entry.tidal_track_id = Some(track_id));
    }

    pub fn set_qobuz(&self, id: &str, track_id: i64) {
        self.upsert(id, |entry| entry.qobuz_track_id = Some(track_id));
    }

    pub fn set_amazon(&self, id: &str, track_id: &str) {
        let value = track_id.to_string();
        self.upsert(id, move |entry| entry.amazon_track_id = Some(value));
    }

    /// Store a resolver result in the field belonging to `service`.
    /// Returns false when nothing was stored: a blank id, or an id shape
    /// that does not fit that catalog.
    pub fn record(&self, id: &str, service: Service, catalog_id: CatalogId) -> bool {
        match (service, catalog_id) {
            (Service::Tidal, CatalogId::Numeric(n)) => {
                self.upsert(id, |entry| entry.tidal_track_id = Some(n))
            }
            (Service::Qobuz, CatalogId::Numeric(n)) => {
                self.upsert(id, |entry| entry.qobuz_track_id = Some(n))
            }
            (Service::Amazon, CatalogId::Text(s)) => {
                self.upsert(id, move |entry| entry.amazon_track_id = Some(s))
            }
            (Service::Amazon, CatalogId::Numeric(n)) => {
                self.upsert(id, |entry| entry.amazon_track_id = Some(n.to_string()))
            }
            (Service::Tidal | Service::Qobuz, CatalogId::Text(s)) => match s.trim().parse() {
                Ok(n) => self.record(id, service, CatalogId::Numeric(n)),
                Err(_) => false,
            },
        }
    }

    /// Apply `apply` to the entry for `id` and refresh its expiry. Blank ids
    /// are ignored and reported as not stored.
    fn upsert(&self, id: &str, apply: impl FnOnce(&mut TrackIdEntry)) -> bool {
        let key = normalize_id(id);
        if key.is_empty() {
            return false;
        }
        let now = Instant::now();
        let mut state = self.state.write();

        let entry = state
            .entries
            .entry(key)
            .or_insert_with(|| TrackIdEntry::empty(now));
        apply(entry);
        entry.expires_at = now + self.ttl;

        let due = match state.last_sweep {
            None => true,
            Some(last) => now.duration_since(last) >= self.sweep_interval,
        };
        if due {
            let before = state.entries.len();
            state.entries.retain(|_, e| !e.is_expired(now));
            state.last_sweep = Some(now);
            let removed = before - state.entries.len();
            if removed > 0 {
                log_debug!("[cache] swept {} expired track id entries", removed);
            }
        }
        true
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        log_info!("[cache] track id cache cleared");
    }

    pub fn size(&self) -> usize {
        self.state.read().entries.len()
    }
}
