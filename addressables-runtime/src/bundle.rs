//! Asset bundle loading
//!
//! Resolves a bundle location into a loaded bundle, loading missing
//! dependency bundles first. Resolved bundles are cached and reference
//! counted; concurrent requests for the same unresolved bundle share the one
//! in-flight load instead of issuing duplicates. Dependencies are always
//! fully resolved before their dependent is marked loaded, so object lookups
//! inside a bundle never race its own dependency set.

use addressables_core::{address_hash, AddressablesError, ResourceLocation, ResourceType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::engine::{Handle, OperationEngine};
use crate::fetch::FetchProvider;

/// Serialized bundle document: the bundle's own id, the ids of bundles it
/// depends on, and its content entries addressed by logical address string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub entries: Vec<BundleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    pub address: String,
    pub data: String,
}

/// A resolved bundle: content indexed by address hash, original string not
/// needed at lookup time.
#[derive(Debug)]
pub struct LoadedBundle {
    id: String,
    assets: HashMap<u64, Bytes>,
}

impl LoadedBundle {
    pub fn from_manifest(manifest: BundleManifest) -> Self {
        let assets = manifest
            .entries
            .into_iter()
            .map(|e| (address_hash(&e.address), Bytes::from(e.data.into_bytes())))
            .collect();
        Self {
            id: manifest.id,
            assets,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Content for an address hash, if this bundle contains it
    pub fn asset(&self, address_hash: u64) -> Option<Bytes> {
        self.assets.get(&address_hash).cloned()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }
}

enum BundleState {
    Loading(Handle<LoadedBundle>),
    Resolved(Arc<LoadedBundle>),
    Failed,
}

struct BundleCacheEntry {
    state: BundleState,
    /// Outstanding handle-teardown obligations on this bundle. Dependent
    /// bundles hold theirs through the dependency handles recorded below.
    ref_count: u32,
    dep_handles: Vec<Handle<LoadedBundle>>,
}

struct LoaderInner {
    engine: OperationEngine,
    fetcher: Arc<dyn FetchProvider>,
    cache: Mutex<HashMap<String, BundleCacheEntry>>,
}

/// Reference-counting bundle cache and dependency resolver
#[derive(Clone)]
pub struct AssetBundleLoader {
    inner: Arc<LoaderInner>,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AssetBundleLoader {
    pub fn new(engine: OperationEngine, fetcher: Arc<dyn FetchProvider>) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                engine,
                fetcher,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of bundles currently cached (loading or resolved)
    pub fn cached_count(&self) -> usize {
        lock_recover(&self.inner.cache)
            .values()
            .filter(|e| !matches!(e.state, BundleState::Failed))
            .count()
    }

    /// Resolved bundle instance for an id, if present
    pub fn resolved(&self, bundle_id: &str) -> Option<Arc<LoadedBundle>> {
        match lock_recover(&self.inner.cache).get(bundle_id) {
            Some(BundleCacheEntry {
                state: BundleState::Resolved(bundle),
                ..
            }) => Some(bundle.clone()),
            _ => None,
        }
    }

    /// Resolve a bundle location into a loaded bundle.
    ///
    /// Releasing the returned handle to zero drops this resolve's hold on
    /// the bundle; the bundle itself unloads when its last holder (handle or
    /// dependent bundle) lets go.
    pub fn resolve(&self, location: &Arc<ResourceLocation>) -> Handle<LoadedBundle> {
        self.resolve_inner(location, Vec::new())
    }

    fn resolve_inner(
        &self,
        location: &Arc<ResourceLocation>,
        path: Vec<String>,
    ) -> Handle<LoadedBundle> {
        let id = location.primary_key().to_string();
        if path.contains(&id) {
            return self.inner.engine.failed(AddressablesError::DependencyUnresolved {
                bundle: id,
                message: format!("dependency cycle via {}", path.join(" -> ")),
            });
        }

        let mut cache = lock_recover(&self.inner.cache);
        if let Some(entry) = cache.get_mut(&id) {
            match &entry.state {
                BundleState::Resolved(bundle) => {
                    entry.ref_count += 1;
                    let bundle = bundle.clone();
                    drop(cache);
                    debug!(bundle = %id, "bundle cache hit");
                    return self.resolved_handle(id, bundle);
                }
                BundleState::Loading(handle) => {
                    // coalesce: attach to the in-flight load
                    let shared = handle.clone();
                    drop(cache);
                    debug!(bundle = %id, "attaching to in-flight bundle load");
                    match self.inner.engine.acquire(&shared) {
                        Ok(acquired) => return acquired,
                        Err(e) => return self.inner.engine.failed(e),
                    }
                }
                BundleState::Failed => {
                    // previous load failed; retry with a fresh load below
                    entry.ref_count += 1;
                    let handle = self.start_load(location, path, id.clone());
                    entry.state = BundleState::Loading(handle.clone());
                    return handle;
                }
            }
        }

        let handle = self.start_load(location, path, id.clone());
        cache.insert(
            id,
            BundleCacheEntry {
                state: BundleState::Loading(handle.clone()),
                ref_count: 1,
                dep_handles: Vec::new(),
            },
        );
        handle
    }

    /// Spawn the load for one bundle. Caller inserts/updates the cache entry
    /// while still holding the cache lock, so a racing completion cannot
    /// observe a missing entry.
    fn start_load(
        &self,
        location: &Arc<ResourceLocation>,
        mut path: Vec<String>,
        id: String,
    ) -> Handle<LoadedBundle> {
        let loader = self.clone();
        let engine = self.inner.engine.clone();
        let fetcher = self.inner.fetcher.clone();
        let location = location.clone();
        path.push(id.clone());

        self.inner.engine.spawn_with_cleanup(move |slot| {
            slot.set({
                let loader = loader.clone();
                let id = id.clone();
                move |_engine| loader.release_obligation(&id)
            });
            async move {
                let mut dep_handles: Vec<Handle<LoadedBundle>> = Vec::new();
                for dep in location
                    .dependencies()
                    .iter()
                    .filter(|d| d.resource_type() == ResourceType::AssetBundle)
                {
                    let dep_handle = loader.resolve_inner(dep, path.clone());
                    match engine.wait_for_completion(&dep_handle).await {
                        Ok(_) => dep_handles.push(dep_handle),
                        Err(error) => {
                            engine.release(dep_handle);
                            loader.fail_load(&id, dep_handles);
                            return Err(AddressablesError::DependencyUnresolved {
                                bundle: dep.primary_key().to_string(),
                                message: error.to_string(),
                            });
                        }
                    }
                }

                let bytes = match fetcher.fetch(location.internal_id()).await {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        loader.fail_load(&id, dep_handles);
                        return Err(AddressablesError::ProviderFailure {
                            location: location.internal_id().to_string(),
                            message: error.to_string(),
                            ignorable: false,
                        });
                    }
                };
                let manifest = match serde_json::from_slice::<BundleManifest>(&bytes) {
                    Ok(manifest) => manifest,
                    Err(error) => {
                        loader.fail_load(&id, dep_handles);
                        return Err(AddressablesError::Parse(format!(
                            "bundle '{}': {error}",
                            location.internal_id()
                        )));
                    }
                };

                let bundle = Arc::new(LoadedBundle::from_manifest(manifest));
                loader.finish_load(&id, bundle.clone(), dep_handles);
                Ok(bundle)
            }
        })
    }

    /// Record a successful load. If every holder released while the load was
    /// in flight, the result is discarded instead of cached.
    fn finish_load(
        &self,
        id: &str,
        bundle: Arc<LoadedBundle>,
        dep_handles: Vec<Handle<LoadedBundle>>,
    ) {
        let cancelled = {
            let mut cache = lock_recover(&self.inner.cache);
            match cache.get_mut(id) {
                Some(entry) => {
                    entry.state = BundleState::Resolved(bundle);
                    entry.dep_handles = dep_handles;
                    debug!(bundle = %id, "bundle resolved");
                    None
                }
                None => Some(dep_handles),
            }
        };
        if let Some(dep_handles) = cancelled {
            debug!(bundle = %id, "bundle load finished after release; discarding");
            for handle in dep_handles.into_iter().rev() {
                self.inner.engine.release(handle);
            }
        }
    }

    fn fail_load(&self, id: &str, dep_handles: Vec<Handle<LoadedBundle>>) {
        {
            let mut cache = lock_recover(&self.inner.cache);
            if let Some(entry) = cache.get_mut(id) {
                entry.state = BundleState::Failed;
            }
        }
        for handle in dep_handles.into_iter().rev() {
            self.inner.engine.release(handle);
        }
    }

    /// Completed handle over an already-resolved bundle; its teardown drops
    /// the hold taken by the cache hit.
    fn resolved_handle(&self, id: String, bundle: Arc<LoadedBundle>) -> Handle<LoadedBundle> {
        let loader = self.clone();
        self.inner
            .engine
            .completed_with_cleanup(bundle, move |_engine| loader.release_obligation(&id))
    }

    /// Drop one holder. At zero the bundle unloads and its dependency holds
    /// are released in reverse resolve order.
    fn release_obligation(&self, id: &str) {
        let removed = {
            let mut cache = lock_recover(&self.inner.cache);
            let Some(entry) = cache.get_mut(id) else {
                warn!(bundle = %id, "release of unknown bundle");
                return;
            };
            if entry.ref_count == 0 {
                warn!(bundle = %id, "unbalanced bundle release");
                return;
            }
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return;
            }
            cache.remove(id)
        };
        if let Some(entry) = removed {
            if matches!(entry.state, BundleState::Resolved(_)) {
                debug!(bundle = %id, "unloading bundle");
            }
            for handle in entry.dep_handles.into_iter().rev() {
                self.inner.engine.release(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_lookup_by_address_hash() {
        let manifest = BundleManifest {
            id: "B1".into(),
            dependencies: vec!["B0".into()],
            entries: vec![BundleEntry {
                address: "hero".into(),
                data: "hero-payload".into(),
            }],
        };
        let bundle = LoadedBundle::from_manifest(manifest);
        assert_eq!(bundle.id(), "B1");
        assert_eq!(
            bundle.asset(address_hash("hero")),
            Some(Bytes::from_static(b"hero-payload"))
        );
        assert_eq!(bundle.asset(address_hash("villain")), None);
    }

    #[test]
    fn test_manifest_parses_without_optional_fields() {
        let manifest: BundleManifest = serde_json::from_str(r#"{ "id": "B0" }"#).unwrap();
        assert!(manifest.dependencies.is_empty());
        assert!(manifest.entries.is_empty());
    }
}
