//! Asset Manager (C2).
//!
//! Discovers assets on disk (one sub-directory per asset, `high.*`/`medium.*`/`low.*`/
//! `nerf.{splat,ply,ksplat}` by convention), ensures all mesh LODs exist by calling the LOD
//! generator (C1) cache-first, and serves bytes by `(assetId, lod)` with a fallback order when
//! the exact LOD requested isn't available.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::lod::{validate_mesh_container, LodGenerator};
use crate::protocol::Lod;

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AssetError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NerfFormat {
    Splat,
    Ply,
    Ksplat,
}

impl NerfFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "splat" => Some(Self::Splat),
            "ply" => Some(Self::Ply),
            "ksplat" => Some(Self::Ksplat),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Splat => "splat",
            Self::Ply => "ply",
            Self::Ksplat => "ksplat",
        }
    }
}

#[derive(Debug, Clone)]
struct AssetRecord {
    paths: HashMap<Lod, PathBuf>,
    nerf: Option<(NerfFormat, PathBuf)>,
}

/// Distinguishes the mesh-LOD cache slots from the NeRF slot so a mesh HIGH fetch and a NeRF
/// fetch for the same asset id never alias the same cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheSlot {
    Mesh(Lod),
    Nerf,
}

/// Cache key for the bounded in-memory byte cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey(String, CacheSlot);

pub struct AssetManager {
    root: PathBuf,
    generator: LodGenerator,
    records: RwLock<HashMap<String, AssetRecord>>,
    cache: Mutex<lru::LruCache<CacheKey, Arc<Vec<u8>>>>,
    /// Serializes (and signals) in-flight generation per asset id so a `Get` arriving mid
    /// generation blocks until it finishes, so a caller never observes a half-written variant.
    generation_locks: dashmap::DashMap<String, Arc<Mutex<()>>>,
}

impl AssetManager {
    /// Scans `root` for assets. A missing asset root is fatal at init.
    pub fn new(root: PathBuf, generator: LodGenerator) -> crate::Result<Self> {
        if !root.is_dir() {
            return Err(crate::Error::AssetRootMissing(root));
        }
        let manager = Self {
            root,
            generator,
            records: RwLock::new(HashMap::new()),
            cache: Mutex::new(lru::LruCache::new(std::num::NonZeroUsize::new(256).unwrap())),
            generation_locks: dashmap::DashMap::new(),
        };
        manager.scan();
        Ok(manager)
    }

    fn lock_for(&self, asset_id: &str) -> Arc<Mutex<()>> {
        self.generation_locks
            .entry(asset_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Discovers every sub-directory of the asset root as one asset.
    fn scan(&self) {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                log::error!("failed to scan asset root {:?}: {e}", self.root);
                return;
            }
        };

        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let asset_id = entry.file_name().to_string_lossy().to_string();
            if let Some(record) = self.discover_one(&asset_id, &entry.path()) {
                self.records.write().insert(asset_id, record);
            }
        }
    }

    fn discover_one(&self, asset_id: &str, dir: &Path) -> Option<AssetRecord> {
        let mut paths = HashMap::new();
        let mut nerf = None;

        for entry in fs::read_dir(dir).ok()?.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            let ext = path.extension().map(|e| e.to_string_lossy().to_string());

            match stem.as_str() {
                "high" => {
                    paths.insert(Lod::High, path.clone());
                }
                "medium" => {
                    paths.insert(Lod::Medium, path.clone());
                }
                "low" => {
                    paths.insert(Lod::Low, path.clone());
                }
                "nerf" => {
                    if let Some(format) = ext.and_then(|e| NerfFormat::from_extension(&e)) {
                        nerf = Some((format, path.clone()));
                    }
                }
                _ => {}
            }
        }

        if paths.is_empty() {
            return None;
        }

        self.ensure_mesh_lods(asset_id, dir, &mut paths);
        Some(AssetRecord { paths, nerf })
    }

    /// If `high` exists but `medium` or `low` is missing, generates them via C1 (cache-first),
    /// writing the bytes both into the LOD cache and back into the asset directory.
    fn ensure_mesh_lods(&self, asset_id: &str, dir: &Path, paths: &mut HashMap<Lod, PathBuf>) {
        let Some(high_path) = paths.get(&Lod::High).cloned() else {
            return;
        };
        if paths.contains_key(&Lod::Medium) && paths.contains_key(&Lod::Low) {
            return;
        }

        let lock = self.lock_for(asset_id);
        let _guard = lock.lock();

        let Ok(source) = fs::read(&high_path) else {
            return;
        };
        let generated = self.generator.generate(asset_id, &source);

        for lod in [Lod::Medium, Lod::Low] {
            if paths.contains_key(&lod) {
                continue;
            }
            if let Some(bytes) = generated.get(&lod) {
                let out_path = dir.join(format!("{}.glb", lod.as_str()));
                if fs::write(&out_path, bytes).is_ok() {
                    paths.insert(lod, out_path);
                }
            }
        }
    }

    pub fn list(&self) -> Vec<(String, Vec<Lod>, bool)> {
        self.records
            .read()
            .iter()
            .map(|(id, rec)| {
                let mut lods: Vec<Lod> = rec.paths.keys().copied().collect();
                lods.sort_by_key(|l| l.as_str());
                (id.clone(), lods, rec.nerf.is_some())
            })
            .collect()
    }

    /// Fallback order: LOW -> MEDIUM -> HIGH; MEDIUM -> HIGH -> LOW; HIGH -> MEDIUM -> LOW.
    /// `Get` never fails once init has discovered the asset.
    fn fallback_order(requested: Lod) -> [Lod; 3] {
        match requested {
            Lod::Low => [Lod::Low, Lod::Medium, Lod::High],
            Lod::Medium => [Lod::Medium, Lod::High, Lod::Low],
            Lod::High => [Lod::High, Lod::Medium, Lod::Low],
        }
    }

    /// Returns bytes for the best available LOD given `requested`, and which LOD was actually
    /// served. Blocks on any in-flight generation for this asset id (Open Question resolution).
    pub fn get(&self, asset_id: &str, requested: Lod) -> Result<(Arc<Vec<u8>>, Lod)> {
        if let Some(lock) = self.generation_locks.get(asset_id) {
            let lock = lock.clone();
            let _guard = lock.lock();
        }

        let record = {
            let records = self.records.read();
            records
                .get(asset_id)
                .ok_or_else(|| AssetError::NotFound(asset_id.to_string()))?
                .clone()
        };

        for lod in Self::fallback_order(requested) {
            let Some(path) = record.paths.get(&lod) else {
                continue;
            };
            let key = CacheKey(asset_id.to_string(), CacheSlot::Mesh(lod));
            if let Some(bytes) = self.cache.lock().get(&key).cloned() {
                return Ok((bytes, lod));
            }
            let bytes = Arc::new(fs::read(path)?);
            self.cache.lock().put(key, bytes.clone());
            return Ok((bytes, lod));
        }

        Err(AssetError::NotFound(asset_id.to_string()))
    }

    pub fn get_nerf(&self, asset_id: &str) -> Result<Option<(NerfFormat, Arc<Vec<u8>>)>> {
        let record = {
            let records = self.records.read();
            records
                .get(asset_id)
                .ok_or_else(|| AssetError::NotFound(asset_id.to_string()))?
                .clone()
        };
        let Some((format, path)) = record.nerf else {
            return Ok(None);
        };
        // NeRF assets have no LOD tiers; a dedicated slot keeps this from aliasing the mesh HIGH
        // cache entry for the same asset id.
        let key = CacheKey(asset_id.to_string(), CacheSlot::Nerf);
        if let Some(bytes) = self.cache.lock().get(&key).cloned() {
            return Ok(Some((format, bytes)));
        }
        let bytes = Arc::new(fs::read(&path)?);
        self.cache.lock().put(key, bytes.clone());
        Ok(Some((format, bytes)))
    }

    /// Persists `bytes` as the `high` source for `asset_id`, triggers generation, and atomically
    /// replaces any prior entry. Performs blocking file I/O and mesh decimation — callers MUST
    /// run this off the async executor's worker threads, since it shares the generator with the
    /// session-facing streaming path.
    pub fn upload(&self, asset_id: &str, bytes: &[u8]) -> Result<Vec<Lod>> {
        let dir = self.root.join(asset_id);
        fs::create_dir_all(&dir)?;
        let high_path = dir.join("high.glb");
        fs::write(&high_path, bytes)?;

        let lock = self.lock_for(asset_id);
        let _guard = lock.lock();

        let mut paths = HashMap::new();
        paths.insert(Lod::High, high_path);
        if validate_mesh_container(bytes) {
            let generated = self.generator.generate(asset_id, bytes);
            for (lod, tier_bytes) in &generated {
                let out_path = dir.join(format!("{}.glb", lod.as_str()));
                if fs::write(&out_path, tier_bytes).is_ok() {
                    paths.insert(*lod, out_path);
                }
            }
        } else {
            log::warn!(
                "uploaded asset {asset_id:?} did not parse as a mesh container; storing HIGH only"
            );
        }

        let mut lods: Vec<Lod> = paths.keys().copied().collect();
        lods.sort_by_key(|l| l.as_str());

        let existing_nerf = self
            .records
            .read()
            .get(asset_id)
            .and_then(|r| r.nerf.clone());
        self.records.write().insert(
            asset_id.to_string(),
            AssetRecord {
                paths,
                nerf: existing_nerf,
            },
        );
        self.invalidate(asset_id);
        Ok(lods)
    }

    /// Drops the in-memory entry and clears its cached bytes. Source files on disk are left
    /// untouched — uploads after init never re-scan the directory, so there is nothing else to
    /// reconcile.
    pub fn remove(&self, asset_id: &str) -> bool {
        let removed = self.records.write().remove(asset_id).is_some();
        if removed {
            self.invalidate(asset_id);
        }
        removed
    }

    fn invalidate(&self, asset_id: &str) {
        let mut cache = self.cache.lock();
        for lod in [Lod::High, Lod::Medium, Lod::Low] {
            cache.pop(&CacheKey(asset_id.to_string(), CacheSlot::Mesh(lod)));
        }
        cache.pop(&CacheKey(asset_id.to_string(), CacheSlot::Nerf));
    }

    pub fn exists(&self, asset_id: &str) -> bool {
        self.records.read().contains_key(asset_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lod::LodGeneratorConfig;

    fn tiny_glb() -> Vec<u8> {
        let json = r#"{"asset":{"version":"2.0"}}"#.as_bytes().to_vec();
        let glb = gltf::binary::Glb {
            header: gltf::binary::Header {
                magic: *b"glTF",
                version: 2,
                length: 0,
            },
            json: std::borrow::Cow::Owned(json),
            bin: None,
        };
        glb.to_vec().unwrap()
    }

    fn setup() -> (tempfile::TempDir, AssetManager) {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let asset_dir = root.path().join("cube");
        fs::create_dir_all(&asset_dir).unwrap();
        fs::write(asset_dir.join("high.glb"), tiny_glb()).unwrap();

        let generator =
            LodGenerator::new(cache.path().to_path_buf(), LodGeneratorConfig::default()).unwrap();
        let manager = AssetManager::new(root.path().to_path_buf(), generator).unwrap();
        (root, manager)
    }

    #[test]
    fn scan_generates_missing_tiers() {
        let (_root, manager) = setup();
        let (_bytes, lod) = manager.get("cube", Lod::Low).unwrap();
        assert_eq!(lod, Lod::Low);
        let list = manager.list();
        assert_eq!(list.len(), 1);
        assert!(list[0].1.contains(&Lod::Medium));
        assert!(list[0].1.contains(&Lod::Low));
    }

    #[test]
    fn get_never_fails_for_a_discovered_asset() {
        let (_root, manager) = setup();
        for requested in [Lod::High, Lod::Medium, Lod::Low] {
            assert!(manager.get("cube", requested).is_ok());
        }
    }

    #[test]
    fn get_unknown_asset_errors() {
        let (_root, manager) = setup();
        assert!(manager.get("does-not-exist", Lod::High).is_err());
    }

    #[test]
    fn mesh_high_and_nerf_bytes_do_not_alias_in_cache() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let asset_dir = root.path().join("hybrid");
        fs::create_dir_all(&asset_dir).unwrap();
        let mesh_bytes = tiny_glb();
        let nerf_bytes = b"splat-bytes-not-a-mesh".to_vec();
        fs::write(asset_dir.join("high.glb"), &mesh_bytes).unwrap();
        fs::write(asset_dir.join("nerf.splat"), &nerf_bytes).unwrap();

        let generator =
            LodGenerator::new(cache.path().to_path_buf(), LodGeneratorConfig::default()).unwrap();
        let manager = AssetManager::new(root.path().to_path_buf(), generator).unwrap();

        // Fetch the NeRF buffer first so its bytes would land in a shared cache slot, then fetch
        // mesh HIGH and confirm it gets mesh bytes, not the cached splat buffer (and vice versa).
        let (_format, nerf_first) = manager.get_nerf("hybrid").unwrap().unwrap();
        assert_eq!(*nerf_first, nerf_bytes);
        let (mesh_bytes_got, lod) = manager.get("hybrid", Lod::High).unwrap();
        assert_eq!(lod, Lod::High);
        assert_eq!(*mesh_bytes_got, mesh_bytes);

        let (_format, nerf_second) = manager.get_nerf("hybrid").unwrap().unwrap();
        assert_eq!(*nerf_second, nerf_bytes);
    }

    #[test]
    fn upload_then_remove_round_trips() {
        let (_root, manager) = setup();
        let lods = manager.upload("new-asset", &tiny_glb()).unwrap();
        assert!(lods.contains(&Lod::High));
        assert!(manager.exists("new-asset"));

        assert!(manager.remove("new-asset"));
        assert!(!manager.exists("new-asset"));
    }

    #[test]
    fn fallback_order_matches_spec() {
        assert_eq!(
            AssetManager::fallback_order(Lod::Low),
            [Lod::Low, Lod::Medium, Lod::High]
        );
        assert_eq!(
            AssetManager::fallback_order(Lod::Medium),
            [Lod::Medium, Lod::High, Lod::Low]
        );
        assert_eq!(
            AssetManager::fallback_order(Lod::High),
            [Lod::High, Lod::Medium, Lod::Low]
        );
    }
}
