//! Async addressable-resource runtime
//!
//! Runtime half of the addressables stack: a ref-counted async operation
//! engine, file/remote content fetching, an asset bundle loader with
//! dependency resolution and resolve-once caching, a hash-versioned content
//! catalog provider, and scene instance tracking, all wired together behind
//! the [`AddressablesRuntime`] facade.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use addressables_runtime::{AddressablesRuntime, FileFetcher, RuntimeConfig};
//!
//! # async fn demo() -> addressables_core::Result<()> {
//! let runtime = AddressablesRuntime::new(RuntimeConfig::default(), Arc::new(FileFetcher));
//! let init = runtime.initialize("content/catalog.json");
//! init.wait_for_completion().await?;
//!
//! let handle = runtime.load_asset_async(&"hero".into());
//! let asset = handle.wait_for_completion().await?;
//! println!("loaded {} ({} bytes)", asset.address, asset.data.len());
//! runtime.release(handle);
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod catalog_provider;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod runtime;
pub mod scene;

pub use bundle::{AssetBundleLoader, BundleEntry, BundleManifest, LoadedBundle};
pub use catalog_provider::{CatalogProvider, DEPENDENCY_HASH_CACHE, DEPENDENCY_HASH_REMOTE};
pub use config::RuntimeConfig;
pub use engine::{
    CleanupSlot, Handle, OpContext, Operation, OperationEngine, OperationStatus, OpId, OpResult,
    UntypedHandle,
};
pub use fetch::{is_remote_path, FetchProvider, FileFetcher};
pub use runtime::{AddressablesRuntime, LoadedAsset};
pub use scene::{SceneInstance, SceneReleased, SceneTracker};

// Re-export the data model for downstream convenience
pub use addressables_core as core;
pub use addressables_core::{AddressablesError, Key, Result};
