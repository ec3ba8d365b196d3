//! Content catalog provider
//!
//! Loads catalog documents with hash-based versioning. A catalog location
//! carries two dependency locations: the remote hash (authoritative version
//! token fetched from the source) and the cache hash (version token of the
//! local copy). The provider loads whichever side the tokens select; when a
//! load sourced from the local cache fails, the stale cache is deleted and
//! the full load re-issued exactly once. A second failure is terminal.

use addressables_core::{
    address_hash, AddressablesError, ContentCatalogData, LoadOptions, ResourceLocation,
    ResourceType,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{swap_extension, RuntimeConfig};
use crate::engine::{Handle, OperationEngine};
use crate::fetch::{fetch_text, FetchProvider};

/// Index of the remote hash entry in a catalog location's dependencies
pub const DEPENDENCY_HASH_REMOTE: usize = 0;
/// Index of the cache hash entry in a catalog location's dependencies
pub const DEPENDENCY_HASH_CACHE: usize = 1;

/// Provider for content catalogs
#[derive(Clone)]
pub struct CatalogProvider {
    engine: OperationEngine,
    fetcher: Arc<dyn FetchProvider>,
    config: RuntimeConfig,
}

/// Outcome of one load attempt; remembers whether the failing load was
/// sourced from the local cache so the retry can invalidate it.
type AttemptResult = std::result::Result<ContentCatalogData, (AddressablesError, bool)>;

impl CatalogProvider {
    pub fn new(
        engine: OperationEngine,
        fetcher: Arc<dyn FetchProvider>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            engine,
            fetcher,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Build a catalog location whose dependencies are the remote hash and
    /// the cache hash, both ignorable text probes. The cache file stem is a
    /// hash of the remote hash path.
    pub fn catalog_location_with_hash_dependencies(
        catalog_path: &str,
        config: &RuntimeConfig,
    ) -> Arc<ResourceLocation> {
        let hash_path = swap_extension(catalog_path, "hash");
        let cache_stem = format!("{:016x}", address_hash(&hash_path));
        let cache_hash_path = config
            .cache_dir
            .join(format!("{cache_stem}.hash"))
            .to_string_lossy()
            .into_owned();

        let probe_options = LoadOptions {
            ignore_failures: true,
        };
        let remote = Arc::new(
            ResourceLocation::new(&hash_path, &hash_path, ResourceType::RawText)
                .with_options(probe_options),
        );
        let cache = Arc::new(
            ResourceLocation::new(&cache_hash_path, &cache_hash_path, ResourceType::RawText)
                .with_options(probe_options),
        );
        Arc::new(
            ResourceLocation::new(catalog_path, catalog_path, ResourceType::Catalog)
                .with_dependencies(vec![remote, cache])
                .with_options(LoadOptions {
                    ignore_failures: false,
                }),
        )
    }

    /// Load the catalog behind a location built by
    /// [`catalog_location_with_hash_dependencies`](Self::catalog_location_with_hash_dependencies).
    pub fn load_catalog(&self, location: Arc<ResourceLocation>) -> Handle<ContentCatalogData> {
        let provider = self.clone();
        self.engine.spawn(async move {
            match provider.load_attempt(&location).await {
                Ok(catalog) => Ok(catalog),
                Err((error, from_cache)) => {
                    warn!(
                        catalog = location.internal_id(),
                        from_cache,
                        "catalog load failed ({error}); attempting to retry"
                    );
                    if from_cache {
                        provider.delete_cache_files(&location).await;
                    }
                    match provider.load_attempt(&location).await {
                        Ok(catalog) => Ok(catalog),
                        Err((second_error, _)) => {
                            warn!(
                                catalog = location.internal_id(),
                                "catalog load failed on second attempt: {second_error}"
                            );
                            Err(AddressablesError::CatalogLoadFailure {
                                location: location.internal_id().to_string(),
                            })
                        }
                    }
                }
            }
        })
    }

    /// One full pass of the versioned-load state machine
    async fn load_attempt(&self, location: &Arc<ResourceLocation>) -> AttemptResult {
        let deps = location.dependencies();
        let remote_hash_loc = deps.get(DEPENDENCY_HASH_REMOTE);
        let cache_hash_loc = deps.get(DEPENDENCY_HASH_CACHE);
        let (Some(remote_hash_loc), Some(cache_hash_loc)) = (remote_hash_loc, cache_hash_loc)
        else {
            // no hash dependencies: plain load from the source location
            return self.load_document(location.internal_id(), false).await;
        };

        let remote_token = fetch_text(&self.fetcher, remote_hash_loc)
            .await
            .unwrap_or(None);
        let cache_token = fetch_text(&self.fetcher, cache_hash_loc)
            .await
            .unwrap_or(None);
        let cache_catalog_path =
            swap_extension(cache_hash_loc.internal_id(), &self.config.catalog_extension);

        match (&remote_token, &cache_token) {
            (Some(remote), cached) if cached.as_deref() != Some(remote.as_str()) => {
                info!(
                    catalog = location.internal_id(),
                    "using content catalog from source"
                );
                let catalog = self.load_document(location.internal_id(), false).await?;
                self.persist_cache(&cache_catalog_path, cache_hash_loc.internal_id(), &catalog, remote)
                    .await;
                Ok(catalog)
            }
            (_, Some(_)) => {
                info!(catalog = %cache_catalog_path, "using cached content catalog");
                self.load_document(&cache_catalog_path, true).await
            }
            _ => {
                debug!(
                    catalog = location.internal_id(),
                    "no hash tokens available; loading source directly"
                );
                self.load_document(location.internal_id(), false).await
            }
        }
    }

    async fn load_document(&self, path: &str, from_cache: bool) -> AttemptResult {
        let bytes = self
            .fetcher
            .fetch(path)
            .await
            .map_err(|e| {
                (
                    AddressablesError::ProviderFailure {
                        location: path.to_string(),
                        message: e.to_string(),
                        ignorable: false,
                    },
                    from_cache,
                )
            })?;
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|e| (AddressablesError::Parse(format!("{path}: {e}")), from_cache))?;
        ContentCatalogData::from_json(&text).map_err(|e| (e, from_cache))
    }

    /// Best-effort persistence of a freshly downloaded catalog and its hash
    /// token into the local cache
    async fn persist_cache(
        &self,
        cache_catalog_path: &str,
        cache_hash_path: &str,
        catalog: &ContentCatalogData,
        token: &str,
    ) {
        let text = match catalog.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("could not serialize catalog for caching: {e}");
                return;
            }
        };
        if let Some(parent) = Path::new(cache_catalog_path).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("could not create catalog cache directory: {e}");
                return;
            }
        }
        if let Err(e) = tokio::fs::write(cache_catalog_path, text).await {
            warn!(path = %cache_catalog_path, "could not cache catalog: {e}");
            return;
        }
        if let Err(e) = tokio::fs::write(cache_hash_path, token).await {
            warn!(path = %cache_hash_path, "could not cache catalog hash token: {e}");
        }
        debug!(path = %cache_catalog_path, "cached downloaded catalog");
    }

    /// Delete the suspect local cache before the single retry
    async fn delete_cache_files(&self, location: &Arc<ResourceLocation>) {
        let Some(cache_hash_loc) = location.dependencies().get(DEPENDENCY_HASH_CACHE) else {
            return;
        };
        let cache_hash_path = cache_hash_loc.internal_id().to_string();
        let cache_catalog_path =
            swap_extension(&cache_hash_path, &self.config.catalog_extension);
        for path in [cache_catalog_path, cache_hash_path] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path, "deleted stale catalog cache file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path, "could not delete stale cache file: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_location_shape() {
        let config = RuntimeConfig::with_cache_dir("/tmp/aa-cache");
        let location = CatalogProvider::catalog_location_with_hash_dependencies(
            "https://cdn.example.com/catalog.json",
            &config,
        );
        assert_eq!(location.resource_type(), ResourceType::Catalog);
        assert_eq!(location.dependencies().len(), 2);

        let remote = &location.dependencies()[DEPENDENCY_HASH_REMOTE];
        assert_eq!(remote.internal_id(), "https://cdn.example.com/catalog.hash");
        assert!(remote.options().map(|o| o.ignore_failures).unwrap_or(false));

        let cache = &location.dependencies()[DEPENDENCY_HASH_CACHE];
        assert!(cache.internal_id().starts_with("/tmp/aa-cache/"));
        assert!(cache.internal_id().ends_with(".hash"));
    }

    #[test]
    fn test_cache_paths_keyed_by_remote_path() {
        let config = RuntimeConfig::with_cache_dir("/tmp/aa-cache");
        let a = CatalogProvider::catalog_location_with_hash_dependencies(
            "https://cdn.example.com/a/catalog.json",
            &config,
        );
        let b = CatalogProvider::catalog_location_with_hash_dependencies(
            "https://cdn.example.com/b/catalog.json",
            &config,
        );
        let cache_a = a.dependencies()[DEPENDENCY_HASH_CACHE].internal_id();
        let cache_b = b.dependencies()[DEPENDENCY_HASH_CACHE].internal_id();
        assert_ne!(cache_a, cache_b);
    }
}
