//! Process-wide configuration.
//!
//! Each subsystem gets its own `*Config` struct with a `Default` impl rather than one monolithic
//! blob. Values can be overridden via environment variables; anything unset falls back to the
//! `Default` impl below.

use std::path::PathBuf;
use std::time::Duration;

/// Paths and network-facing knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub asset_root: PathBuf,
    pub cache_root: PathBuf,
    pub bind_addr: String,
    pub max_sessions: usize,
    pub default_room: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            asset_root: PathBuf::from("./assets"),
            cache_root: PathBuf::from("./cache/lods"),
            bind_addr: "0.0.0.0:8080".to_string(),
            max_sessions: 512,
            default_room: "default".to_string(),
        }
    }
}

impl ServerConfig {
    /// Build a config from the built-in defaults, overridden by `STREAMXR_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("STREAMXR_ASSET_ROOT") {
            cfg.asset_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STREAMXR_CACHE_ROOT") {
            cfg.cache_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STREAMXR_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = std::env::var("STREAMXR_MAX_SESSIONS") {
            if let Ok(n) = v.parse() {
                cfg.max_sessions = n;
            }
        }
        if let Ok(v) = std::env::var("STREAMXR_DEFAULT_ROOM") {
            cfg.default_room = v;
        }
        cfg
    }
}

/// Chunked-transfer and bandwidth-estimation knobs, shared by C2/C3/C7.
#[derive(Debug, Clone, Copy)]
pub struct StreamingConfig {
    pub chunk_size: usize,
    pub high_threshold_bps: f64,
    pub low_threshold_bps: f64,
    pub smoothing_factor: f64,
    pub min_samples: u32,
    pub nerf_throttle_every: usize,
    pub nerf_throttle_pause: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16_384,
            high_threshold_bps: 500_000.0,
            low_threshold_bps: 100_000.0,
            smoothing_factor: 0.3,
            min_samples: 2,
            nerf_throttle_every: 10,
            nerf_throttle_pause: Duration::from_millis(1),
        }
    }
}

/// Shared-object ownership knobs (C6).
#[derive(Debug, Clone, Copy)]
pub struct ObjectRegistryConfig {
    pub ownership_timeout: Duration,
}

impl Default for ObjectRegistryConfig {
    fn default() -> Self {
        Self {
            ownership_timeout: Duration::from_secs(5),
        }
    }
}

// LOD generation ratios (C1) live in `lod::LodGeneratorConfig`, next to the generator itself.
