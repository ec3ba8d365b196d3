//! Addressables Core
//!
//! Data model for the addressable-resource runtime: logical keys, resolved
//! resource locations, versioned content catalogs and the locator merge
//! layer that maps one onto the other. The async engine that loads what
//! these describe lives in `addressables-runtime`.

pub mod catalog;
pub mod error;
pub mod location;
pub mod locator;

// Re-export main types
pub use catalog::{CatalogDocument, CatalogEntry, ContentCatalogData};
pub use error::{AddressablesError, Result};
pub use location::{
    address_hash, AssetReference, Key, LoadOptions, LocationIdentity, ResourceLocation,
    ResourceType,
};
pub use locator::{resolve_locations, CatalogLocator, ResourceLocator, ResourceLocatorInfo};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
