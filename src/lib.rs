//! StreamXR session/streaming core: a real-time server that delivers 3D assets to many
//! concurrently connected XR clients and mediates a shared multi-user scene for them.
//!
//! The crate is split so the components (C1-C8) are independently testable with fakes: every
//! module below takes its dependencies as constructor arguments rather than reaching for global
//! state.

pub mod asset;
pub mod bandwidth;
pub mod config;
pub mod error;
pub mod foveation;
pub mod http;
pub mod hub;
pub mod lod;
pub mod objects;
pub mod protocol;
pub mod rooms;
pub mod session;

pub use error::{Error, Result};

use std::sync::Arc;

use crate::config::{ObjectRegistryConfig, ServerConfig, StreamingConfig};

/// Builds the Hub (C2-C6 singletons) from a `ServerConfig`, failing fast on the two init-fatal
/// conditions: a missing asset root, or an unwritable LOD cache directory.
pub fn build_hub(server_config: &ServerConfig) -> Result<Arc<hub::Hub>> {
    let generator = lod::LodGenerator::new(server_config.cache_root.clone(), lod::LodGeneratorConfig::default())?;
    let assets = asset::AssetManager::new(server_config.asset_root.clone(), generator)?;
    Ok(hub::Hub::new(assets, server_config, ObjectRegistryConfig::default()))
}

/// Assembles the HTTP router (admin endpoints + `/ws` upgrade) for a built Hub.
pub fn app(hub: Arc<hub::Hub>, streaming: StreamingConfig) -> axum::Router {
    http::router(http::AppState { hub, streaming })
}
