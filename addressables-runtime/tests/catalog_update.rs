//! Catalog provider tests: hash-token versioning, local cache persistence,
//! the single retry after a stale cache, and terminal failure.

use addressables_core::{address_hash, AddressablesError};
use anyhow::Result;
use addressables_runtime::{
    CatalogProvider, FetchProvider, FileFetcher, OperationEngine, RuntimeConfig,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct CountingFetcher {
    inner: FileFetcher,
    counts: Mutex<HashMap<String, u32>>,
}

impl CountingFetcher {
    fn new() -> Self {
        Self {
            inner: FileFetcher,
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn count(&self, path: &str) -> u32 {
        self.counts
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl FetchProvider for CountingFetcher {
    async fn fetch(&self, path: &str) -> addressables_core::Result<Bytes> {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert(0) += 1;
        self.inner.fetch(path).await
    }
}

fn catalog_json(version: &str) -> String {
    serde_json::json!({
        "version": version,
        "entries": [
            { "key": "B0", "internal_id": "bundles/b0.json", "type": "asset_bundle" },
            { "key": "hero", "internal_id": "hero", "type": "asset", "dependencies": [0] }
        ]
    })
    .to_string()
}

struct Fixture {
    _dir: TempDir,
    engine: OperationEngine,
    provider: CatalogProvider,
    config: RuntimeConfig,
    catalog_path: String,
    hash_path: String,
}

impl Fixture {
    fn new(fetcher: Arc<dyn FetchProvider>) -> Self {
        let dir = TempDir::new().unwrap();
        let catalog_path = dir.path().join("catalog.json").to_string_lossy().into_owned();
        let hash_path = dir.path().join("catalog.hash").to_string_lossy().into_owned();
        let config = RuntimeConfig::with_cache_dir(dir.path().join("cache"));
        let engine = OperationEngine::new();
        let provider = CatalogProvider::new(engine.clone(), fetcher, config.clone());
        Self {
            _dir: dir,
            engine,
            provider,
            config,
            catalog_path,
            hash_path,
        }
    }

    fn write_remote(&self, catalog: &str, token: Option<&str>) {
        std::fs::write(&self.catalog_path, catalog).unwrap();
        if let Some(token) = token {
            std::fs::write(&self.hash_path, token).unwrap();
        }
    }

    /// Where the provider caches the catalog and its hash token
    fn cache_paths(&self) -> (PathBuf, PathBuf) {
        let stem = format!("{:016x}", address_hash(&self.hash_path));
        let hash = self.config.cache_dir.join(format!("{stem}.hash"));
        let catalog = self.config.cache_dir.join(format!("{stem}.json"));
        (catalog, hash)
    }

    async fn load(&self) -> addressables_core::Result<Arc<addressables_core::ContentCatalogData>> {
        let location = CatalogProvider::catalog_location_with_hash_dependencies(
            &self.catalog_path,
            &self.config,
        );
        let handle = self.provider.load_catalog(location);
        let result = handle.wait_for_completion().await;
        self.engine.release(handle);
        result
    }
}

#[tokio::test]
async fn test_fresh_load_persists_cache() -> Result<()> {
    let fx = Fixture::new(Arc::new(FileFetcher));
    fx.write_remote(&catalog_json("v1"), Some("h1"));

    let catalog = fx.load().await?;
    assert_eq!(catalog.version(), "v1");

    let (cache_catalog, cache_hash) = fx.cache_paths();
    assert_eq!(std::fs::read_to_string(&cache_hash)?, "h1");
    assert!(cache_catalog.exists());
    Ok(())
}

#[tokio::test]
async fn test_matching_token_prefers_cached_copy() -> Result<()> {
    let fx = Fixture::new(Arc::new(FileFetcher));
    fx.write_remote(&catalog_json("v1"), Some("h1"));
    fx.load().await?;

    // source changed but its hash token did not: keep serving the cache
    fx.write_remote(&catalog_json("v2"), None);
    let catalog = fx.load().await?;
    assert_eq!(catalog.version(), "v1");

    // token rolls over: the new source wins and the cache follows
    std::fs::write(&fx.hash_path, "h2")?;
    let catalog = fx.load().await?;
    assert_eq!(catalog.version(), "v2");
    let (_, cache_hash) = fx.cache_paths();
    assert_eq!(std::fs::read_to_string(&cache_hash)?, "h2");
    Ok(())
}

#[tokio::test]
async fn test_stale_cache_is_deleted_and_load_retried_once() -> Result<()> {
    let fx = Fixture::new(Arc::new(FileFetcher));
    fx.write_remote(&catalog_json("v1"), Some("h1"));
    fx.load().await?;

    // corrupt the cached catalog; the token still matches, so the next load
    // goes to the cache first and fails there
    let (cache_catalog, cache_hash) = fx.cache_paths();
    std::fs::write(&cache_catalog, "{ not json")?;

    let catalog = fx.load().await?;
    assert_eq!(catalog.version(), "v1");

    // the retry re-downloaded and re-cached a good copy
    assert!(cache_hash.exists());
    let recached = std::fs::read_to_string(&cache_catalog)?;
    assert!(recached.contains("\"version\""));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_catalog_fails_after_exactly_two_attempts() {
    let fetcher = Arc::new(CountingFetcher::new());
    let fx = Fixture::new(fetcher.clone());
    // no remote files at all

    let err = fx.load().await.unwrap_err();
    assert!(matches!(err, AddressablesError::CatalogLoadFailure { .. }));
    assert_eq!(fetcher.count(&fx.catalog_path), 2);
}

#[tokio::test]
async fn test_plain_location_without_hash_dependencies() -> Result<()> {
    let fx = Fixture::new(Arc::new(FileFetcher));
    fx.write_remote(&catalog_json("v1"), None);

    // a bare location, no versioning probes, still loads
    let location = Arc::new(addressables_core::ResourceLocation::new(
        &fx.catalog_path,
        &fx.catalog_path,
        addressables_core::ResourceType::Catalog,
    ));
    let handle = fx.provider.load_catalog(location);
    let catalog = handle.wait_for_completion().await?;
    assert_eq!(catalog.version(), "v1");
    fx.engine.release(handle);

    // nothing was cached for an unversioned load
    let (cache_catalog, _) = fx.cache_paths();
    assert!(!cache_catalog.exists());
    Ok(())
}

#[tokio::test]
async fn test_missing_hash_token_falls_back_to_source() -> Result<()> {
    let fx = Fixture::new(Arc::new(FileFetcher));
    // catalog exists but no hash file anywhere: the hash probes are
    // ignorable and the source is loaded directly
    fx.write_remote(&catalog_json("v1"), None);

    let catalog = fx.load().await?;
    assert_eq!(catalog.version(), "v1");
    Ok(())
}
