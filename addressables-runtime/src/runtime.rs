//! Addressables runtime
//!
//! Explicit context object owning the locator list, the operation engine,
//! the bundle cache and the scene tracker. Multiple independent runtimes can
//! coexist (one per test, for instance); there is no global registry.
//!
//! Load calls resolve a key through the registered locators, drive the
//! bundle loader over the resulting location graph and hand back a tracked
//! handle. While initialization or a catalog update is in flight, every load
//! call chains on it instead of failing.

use addressables_core::{
    address_hash, resolve_locations, AddressablesError, CatalogLocator, ContentCatalogData, Key,
    ResourceLocation, ResourceLocator, ResourceLocatorInfo, ResourceType, Result,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::bundle::AssetBundleLoader;
use crate::catalog_provider::CatalogProvider;
use crate::config::RuntimeConfig;
use crate::engine::{Handle, OperationEngine, OperationStatus, OpResult, UntypedHandle};
use crate::fetch::FetchProvider;
use crate::scene::{SceneInstance, SceneTracker};

/// A loaded asset payload extracted from its resolved bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedAsset {
    pub address: String,
    pub address_hash: u64,
    pub data: Bytes,
}

/// Opaque identity of a tracked result (explicit identity function: the
/// shared allocation address, not runtime type inspection)
fn result_identity(result: &OpResult) -> usize {
    Arc::as_ptr(result) as *const () as usize
}

struct RuntimeState {
    locators: Vec<ResourceLocatorInfo>,
    first_catalog_locator: Option<Arc<CatalogLocator>>,
    /// In-flight initialization operation; load calls chain on it
    init_op: Option<UntypedHandle>,
    /// In-flight catalog load/update; load calls chain on it
    active_update_op: Option<UntypedHandle>,
    result_to_handle: HashMap<usize, UntypedHandle>,
    has_started_initialization: bool,
}

struct RuntimeInner {
    engine: OperationEngine,
    fetcher: Arc<dyn FetchProvider>,
    loader: AssetBundleLoader,
    provider: CatalogProvider,
    scenes: SceneTracker,
    scene_ids: AtomicU64,
    state: Mutex<RuntimeState>,
}

/// The addressables runtime context
#[derive(Clone)]
pub struct AddressablesRuntime {
    inner: Arc<RuntimeInner>,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AddressablesRuntime {
    pub fn new(config: RuntimeConfig, fetcher: Arc<dyn FetchProvider>) -> Self {
        let engine = OperationEngine::new();
        let loader = AssetBundleLoader::new(engine.clone(), fetcher.clone());
        let provider = CatalogProvider::new(engine.clone(), fetcher.clone(), config);
        Self {
            inner: Arc::new(RuntimeInner {
                engine,
                fetcher,
                loader,
                provider,
                scenes: SceneTracker::new(),
                scene_ids: AtomicU64::new(1),
                state: Mutex::new(RuntimeState {
                    locators: Vec::new(),
                    first_catalog_locator: None,
                    init_op: None,
                    active_update_op: None,
                    result_to_handle: HashMap::new(),
                    has_started_initialization: false,
                }),
            }),
        }
    }

    pub fn engine(&self) -> &OperationEngine {
        &self.inner.engine
    }

    pub fn bundle_loader(&self) -> &AssetBundleLoader {
        &self.inner.loader
    }

    pub fn scenes(&self) -> &SceneTracker {
        &self.inner.scenes
    }

    pub fn fetcher(&self) -> &Arc<dyn FetchProvider> {
        &self.inner.fetcher
    }

    /// Advance all in-flight operations once
    pub fn update(&self) {
        self.inner.engine.update();
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        lock_recover(&self.inner.state)
    }

    // ---- locators ------------------------------------------------------

    /// Register a locator, optionally with the remote catalog location used
    /// for update checks
    pub fn add_resource_locator(
        &self,
        locator: Arc<dyn ResourceLocator>,
        remote_catalog_location: Option<Arc<ResourceLocation>>,
    ) {
        self.state()
            .locators
            .push(ResourceLocatorInfo::new(locator, remote_catalog_location));
    }

    fn register_catalog_locator(
        &self,
        locator: Arc<CatalogLocator>,
        remote_catalog_location: Option<Arc<ResourceLocation>>,
    ) {
        let mut state = self.state();
        if state.first_catalog_locator.is_none() {
            state.first_catalog_locator = Some(locator.clone());
        }
        state
            .locators
            .push(ResourceLocatorInfo::new(locator, remote_catalog_location));
    }

    pub fn remove_resource_locator(&self, locator_id: &str) {
        self.state()
            .locators
            .retain(|info| info.locator().locator_id() != locator_id);
    }

    pub fn clear_resource_locators(&self) {
        self.state().locators.clear();
    }

    pub fn locator_count(&self) -> usize {
        self.state().locators.len()
    }

    /// Resolve a key across all registered locators (union by identity)
    pub fn resolve_locations(
        &self,
        key: &Key,
        ty: Option<ResourceType>,
    ) -> Result<Vec<Arc<ResourceLocation>>> {
        let state = self.state();
        resolve_locations(&state.locators, key, ty)
    }

    // ---- initialization and catalogs -----------------------------------

    /// Load the primary catalog. Idempotent: a second call while the first
    /// is in flight shares it; after completion it hands back the already
    /// registered locator.
    pub fn initialize(&self, catalog_path: &str) -> Handle<CatalogLocator> {
        {
            let mut state = self.state();
            if state.has_started_initialization {
                if let Some(op) = &state.init_op {
                    if !op.is_done() {
                        if let Ok(acquired) = self.inner.engine.acquire_untyped(op) {
                            return acquired.typed();
                        }
                    }
                }
                if let Some(locator) = state.first_catalog_locator.clone() {
                    return self.inner.engine.completed_shared(locator);
                }
                return self.inner.engine.failed(AddressablesError::usage(
                    "initialization already started but no catalog is registered",
                ));
            }
            state.has_started_initialization = true;
        }

        info!(catalog = catalog_path, "initializing addressables runtime");
        let handle = self.load_content_catalog_async(catalog_path);
        if !handle.is_done() {
            if let Ok(acquired) = self.inner.engine.acquire(&handle) {
                self.state().init_op = Some(acquired.untyped());
                let rt = self.clone();
                self.inner.engine.on_completed(&handle.untyped(), move |_| {
                    let held = rt.state().init_op.take();
                    if let Some(held) = held {
                        rt.inner.engine.release_untyped(&held);
                    }
                });
            }
        }
        handle
    }

    /// Load an additional content catalog and register its locator
    pub fn load_content_catalog_async(&self, catalog_path: &str) -> Handle<CatalogLocator> {
        if let Some(dep) = self.chain_dependency() {
            debug!(catalog = catalog_path, "chaining catalog load on in-flight operation");
            let rt = self.clone();
            let path = catalog_path.to_string();
            let handle = self
                .inner
                .engine
                .chain(&dep, false, move |_| rt.load_content_catalog_async(&path));
            self.inner.engine.release_untyped(&dep);
            return handle;
        }

        let location = CatalogProvider::catalog_location_with_hash_dependencies(
            catalog_path,
            self.inner.provider.config(),
        );
        let remote_hash_location = location.dependencies().first().cloned();
        let catalog_op = self.inner.provider.load_catalog(location);

        let rt = self.clone();
        let handle: Handle<CatalogLocator> =
            self.inner
                .engine
                .chain(&catalog_op.untyped(), false, move |dep| {
                    let engine = rt.inner.engine.clone();
                    let Some(raw) = dep.raw_result() else {
                        return engine.failed(AddressablesError::InvalidHandle);
                    };
                    let Ok(catalog) = raw.downcast::<ContentCatalogData>() else {
                        return engine.failed(AddressablesError::usage(
                            "catalog operation produced an unexpected result type",
                        ));
                    };
                    info!(version = catalog.version(), "content catalog registered");
                    let locator = Arc::new(CatalogLocator::new(catalog));
                    rt.register_catalog_locator(locator.clone(), remote_hash_location);
                    engine.completed_shared(locator)
                });
        self.inner.engine.release(catalog_op);
        self.register_update_op(&handle);
        handle
    }

    fn register_update_op(&self, handle: &Handle<CatalogLocator>) {
        if handle.is_done() {
            return;
        }
        let Ok(acquired) = self.inner.engine.acquire(handle) else {
            return;
        };
        {
            let mut state = self.state();
            if let Some(previous) = state.active_update_op.take() {
                // a newer catalog operation supersedes the old hold
                self.inner.engine.release_untyped(&previous);
            }
            state.active_update_op = Some(acquired.untyped());
        }
        let rt = self.clone();
        let completed_id = handle.id();
        self.inner.engine.on_completed(&handle.untyped(), move |_| {
            let held = {
                let mut state = rt.state();
                match &state.active_update_op {
                    Some(op) if op.id() == completed_id => state.active_update_op.take(),
                    _ => None,
                }
            };
            if let Some(held) = held {
                rt.inner.engine.release_untyped(&held);
            }
        });
    }

    /// Acquired handle to whichever init/update operation a new load call
    /// must wait for, if any
    fn chain_dependency(&self) -> Option<UntypedHandle> {
        let state = self.state();
        for op in [&state.init_op, &state.active_update_op] {
            if let Some(op) = op {
                if !op.is_done() {
                    if let Ok(acquired) = self.inner.engine.acquire_untyped(op) {
                        return Some(acquired);
                    }
                }
            }
        }
        None
    }

    // ---- asset loading -------------------------------------------------

    /// Resolve a key and load the asset it addresses, bundle graph first
    pub fn load_asset_async(&self, key: &Key) -> Handle<LoadedAsset> {
        // only the outermost handle is tracked; inner handles created by
        // chain continuations belong to their chain op
        self.track(self.load_asset_inner(key))
    }

    fn load_asset_inner(&self, key: &Key) -> Handle<LoadedAsset> {
        if let Some(dep) = self.chain_dependency() {
            debug!(key = key.evaluate(), "chaining asset load on in-flight operation");
            let rt = self.clone();
            let key = key.clone();
            let handle = self
                .inner
                .engine
                .chain(&dep, false, move |_| rt.load_asset_inner(&key));
            self.inner.engine.release_untyped(&dep);
            return handle;
        }

        let locations = match self.resolve_locations(key, Some(ResourceType::Asset)) {
            Ok(locations) => locations,
            Err(e) => return self.inner.engine.failed(e),
        };
        let Some(location) = locations.first().cloned() else {
            return self
                .inner
                .engine
                .failed(AddressablesError::invalid_key(key.evaluate()));
        };
        let Some(bundle_location) = location.dependency_of_type(ResourceType::AssetBundle).cloned()
        else {
            return self.inner.engine.failed(AddressablesError::provider(
                location.primary_key(),
                "asset location has no bundle dependency",
            ));
        };

        let hash = address_hash(location.primary_key());
        let address = location.primary_key().to_string();
        let engine = self.inner.engine.clone();
        let loader = self.inner.loader.clone();
        let handle = self.inner.engine.spawn_with_cleanup(move |slot| async move {
            let bundle_handle = loader.resolve(&bundle_location);
            slot.set({
                let engine = engine.clone();
                let bundle_handle = bundle_handle.clone();
                move |_| engine.release(bundle_handle)
            });
            let bundle = engine.wait_for_completion(&bundle_handle).await?;
            let Some(data) = bundle.asset(hash) else {
                return Err(AddressablesError::provider(
                    &address,
                    "address not present in resolved bundle",
                ));
            };
            Ok(Arc::new(LoadedAsset {
                address,
                address_hash: hash,
                data,
            }))
        });
        handle
    }

    // ---- scenes --------------------------------------------------------

    /// Load the scene a key addresses; the completed handle joins the
    /// active scene set
    pub fn load_scene_async(&self, key: &Key) -> Handle<SceneInstance> {
        let handle = self.load_scene_inner(key);
        self.register_scene(&handle);
        handle
    }

    fn load_scene_inner(&self, key: &Key) -> Handle<SceneInstance> {
        if let Some(dep) = self.chain_dependency() {
            debug!(key = key.evaluate(), "chaining scene load on in-flight operation");
            let rt = self.clone();
            let key = key.clone();
            let handle = self
                .inner
                .engine
                .chain(&dep, false, move |_| rt.load_scene_inner(&key));
            self.inner.engine.release_untyped(&dep);
            return handle;
        }

        let locations = match self.resolve_locations(key, Some(ResourceType::Scene)) {
            Ok(locations) => locations,
            Err(e) => return self.inner.engine.failed(e),
        };
        let Some(location) = locations.first().cloned() else {
            return self
                .inner
                .engine
                .failed(AddressablesError::invalid_key(key.evaluate()));
        };
        let Some(bundle_location) = location.dependency_of_type(ResourceType::AssetBundle).cloned()
        else {
            return self.inner.engine.failed(AddressablesError::provider(
                location.primary_key(),
                "scene location has no bundle dependency",
            ));
        };

        let name = location.primary_key().to_string();
        let instance_id = self.inner.scene_ids.fetch_add(1, Ordering::Relaxed);
        let engine = self.inner.engine.clone();
        let loader = self.inner.loader.clone();
        let handle = self.inner.engine.spawn_with_cleanup(move |slot| async move {
            let bundle_handle = loader.resolve(&bundle_location);
            slot.set({
                let engine = engine.clone();
                let bundle_handle = bundle_handle.clone();
                move |_| engine.release(bundle_handle)
            });
            let bundle = engine.wait_for_completion(&bundle_handle).await?;
            if bundle.asset(address_hash(&name)).is_none() {
                return Err(AddressablesError::provider(
                    &name,
                    "scene not present in resolved bundle",
                ));
            }
            Ok(Arc::new(SceneInstance::new(name, instance_id)))
        });
        handle
    }

    /// Join the active scene set on success. The tracker must hold the
    /// handle the caller owns, not an intermediate one, so that an external
    /// unload notification releases the caller's hold.
    fn register_scene(&self, handle: &Handle<SceneInstance>) {
        let rt = self.clone();
        self.inner.engine.on_completed(&handle.untyped(), move |h| {
            if h.status() != Some(OperationStatus::Succeeded) {
                return;
            }
            let Some(raw) = h.raw_result() else { return };
            let identity = result_identity(&raw);
            if let Ok(instance) = raw.downcast::<SceneInstance>() {
                rt.inner.scenes.track(instance, h.clone());
                rt.state().result_to_handle.insert(identity, h.clone());
            }
        });
    }

    /// Host notification that a scene was unloaded outside the runtime.
    /// Returns true when a tracked scene matched.
    pub fn notify_scene_unloaded(&self, scene_name: &str) -> bool {
        match self
            .inner
            .scenes
            .notify_scene_unloaded(&self.inner.engine, scene_name)
        {
            Some(released) => {
                if released.fully_released {
                    let identity = Arc::as_ptr(&released.instance) as *const () as usize;
                    self.state().result_to_handle.remove(&identity);
                }
                true
            }
            None => {
                debug!(scene = scene_name, "unload notification for untracked scene");
                false
            }
        }
    }

    /// Explicitly unload a scene.
    ///
    /// Rejected while other holders still reference the handle; when the
    /// host already unloaded the scene externally, the remaining
    /// pending-release bookkeeping is auto-released without a second unload.
    pub fn unload_scene_async(&self, handle: &Handle<SceneInstance>) -> Handle<SceneInstance> {
        let engine = &self.inner.engine;
        let Some(instance) = handle.result() else {
            return engine.failed(AddressablesError::usage(
                "unload requested for a handle without a completed scene",
            ));
        };
        let Some(already_unloaded) = self.inner.scenes.is_unloaded(instance.instance_id()) else {
            return engine.failed(AddressablesError::usage(format!(
                "cannot find tracked scene '{}'",
                instance.name()
            )));
        };
        let identity = Arc::as_ptr(&instance) as *const () as usize;

        if already_unloaded {
            // host unloaded it first: drop the bookkeeping hold
            self.inner.scenes.remove(instance.instance_id());
            self.state().result_to_handle.remove(&identity);
            engine.release_untyped(&handle.untyped());
            info!(scene = instance.name(), "auto-released externally unloaded scene");
            return engine.completed_shared(instance);
        }

        let holders = handle.ref_count().unwrap_or(0);
        if holders > 1 {
            return engine.failed(AddressablesError::usage(format!(
                "scene '{}' still has {} other holder(s); release them before unloading",
                instance.name(),
                holders - 1
            )));
        }

        self.inner.scenes.remove(instance.instance_id());
        self.state().result_to_handle.remove(&identity);
        engine.release_untyped(&handle.untyped());
        info!(scene = instance.name(), "scene unloaded");
        engine.completed_shared(instance)
    }

    // ---- handle bookkeeping --------------------------------------------

    /// Record successful results so they can be released by value later
    fn track<T: Send + Sync + 'static>(&self, handle: Handle<T>) -> Handle<T> {
        let rt = self.clone();
        self.inner.engine.on_completed(&handle.untyped(), move |h| {
            if h.status() != Some(OperationStatus::Succeeded) {
                return;
            }
            let Some(result) = h.raw_result() else { return };
            let identity = result_identity(&result);
            rt.state()
                .result_to_handle
                .entry(identity)
                .or_insert_with(|| h.clone());
        });
        handle
    }

    pub fn tracked_result_count(&self) -> usize {
        self.state().result_to_handle.len()
    }

    /// Add a hold on a handle
    pub fn acquire<T: Send + Sync + 'static>(&self, handle: &Handle<T>) -> Result<Handle<T>> {
        self.inner.engine.acquire(handle)
    }

    /// Drop a hold; tracking for the result ends when the last hold goes
    pub fn release<T: Send + Sync + 'static>(&self, handle: Handle<T>) {
        if handle.ref_count() == Some(1) {
            self.remove_tracked_result(&handle.untyped());
        }
        self.inner.engine.release(handle);
    }

    /// Release by result value. Unknown results are a caller bug and are
    /// reported, not silently ignored.
    pub fn release_result<T: Send + Sync + 'static>(&self, result: &Arc<T>) -> Result<()> {
        let identity = Arc::as_ptr(result) as *const () as usize;
        let handle = self.state().result_to_handle.get(&identity).cloned();
        match handle {
            Some(handle) if handle.status().is_none() => {
                // handle was torn down elsewhere; drop the stale entry
                self.state().result_to_handle.remove(&identity);
                Err(AddressablesError::usage(
                    "release of a result whose operation was already released",
                ))
            }
            Some(handle) => {
                if handle.ref_count() == Some(1) {
                    self.state().result_to_handle.remove(&identity);
                }
                self.inner.engine.release_untyped(&handle);
                Ok(())
            }
            None => {
                error!("release was called on a result the runtime was not aware of; nothing released");
                Err(AddressablesError::usage(
                    "release of a result the runtime never tracked",
                ))
            }
        }
    }

    fn remove_tracked_result(&self, handle: &UntypedHandle) {
        if let Some(result) = handle.raw_result() {
            let identity = result_identity(&result);
            self.state().result_to_handle.remove(&identity);
        }
    }
}
