//! Resource locations and keys
//!
//! A [`ResourceLocation`] is the resolved descriptor of one loadable unit of
//! content: where it lives, what kind of resource it is, and which other
//! locations must be loaded first. Locations are immutable once constructed
//! and owned by the catalog that created them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Resource type tag carried by every location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Asset,
    AssetBundle,
    Scene,
    Catalog,
    RawText,
}

/// Provider-specific load options attached to a location
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// When true, a fetch miss completes the operation successfully with an
    /// empty result instead of failing it. Used for speculative cache probes
    /// that are expected to sometimes be absent.
    #[serde(default)]
    pub ignore_failures: bool,
}

/// Location identity: primary key + resource type + internal id.
///
/// Two locations with equal identity refer to the same unit of content, no
/// matter which catalog produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationIdentity {
    pub primary_key: String,
    pub resource_type: ResourceType,
    pub internal_id: String,
}

/// Resolved descriptor of where and how to load one unit of content
#[derive(Debug)]
pub struct ResourceLocation {
    primary_key: String,
    internal_id: String,
    resource_type: ResourceType,
    dependencies: Vec<Arc<ResourceLocation>>,
    options: Option<LoadOptions>,
}

impl ResourceLocation {
    /// Create a location without dependencies or options
    pub fn new<K, I>(primary_key: K, internal_id: I, resource_type: ResourceType) -> Self
    where
        K: Into<String>,
        I: Into<String>,
    {
        Self {
            primary_key: primary_key.into(),
            internal_id: internal_id.into(),
            resource_type,
            dependencies: Vec::new(),
            options: None,
        }
    }

    /// Attach the ordered dependency list
    pub fn with_dependencies(mut self, dependencies: Vec<Arc<ResourceLocation>>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Attach provider load options
    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn internal_id(&self) -> &str {
        &self.internal_id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn dependencies(&self) -> &[Arc<ResourceLocation>] {
        &self.dependencies
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    pub fn options(&self) -> Option<&LoadOptions> {
        self.options.as_ref()
    }

    /// First dependency of the given type, if any
    pub fn dependency_of_type(&self, ty: ResourceType) -> Option<&Arc<ResourceLocation>> {
        self.dependencies.iter().find(|d| d.resource_type == ty)
    }

    pub fn identity(&self) -> LocationIdentity {
        LocationIdentity {
            primary_key: self.primary_key.clone(),
            resource_type: self.resource_type,
            internal_id: self.internal_id.clone(),
        }
    }
}

/// An indirection object that carries a runtime key instead of being one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetReference {
    pub runtime_key: String,
}

impl AssetReference {
    pub fn new<K: Into<String>>(runtime_key: K) -> Self {
        Self {
            runtime_key: runtime_key.into(),
        }
    }
}

/// Logical identifier used by callers to request content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Plain string address
    Address(String),
    /// Indirection object; normalized to its runtime key before lookup
    Reference(AssetReference),
}

impl Key {
    /// Normalize to the underlying runtime key string
    pub fn evaluate(&self) -> &str {
        match self {
            Key::Address(s) => s,
            Key::Reference(r) => &r.runtime_key,
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Address(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Address(s)
    }
}

impl From<AssetReference> for Key {
    fn from(r: AssetReference) -> Self {
        Key::Reference(r)
    }
}

/// Deterministic 64-bit FNV-1a hash of a logical address string.
///
/// Used to look up an object inside a resolved bundle without the original
/// string, and to derive local cache file names from remote paths.
pub fn address_hash(address: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in address.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality() {
        let a = ResourceLocation::new("icon", "bundles/ui.json", ResourceType::Asset);
        let b = ResourceLocation::new("icon", "bundles/ui.json", ResourceType::Asset);
        let c = ResourceLocation::new("icon", "bundles/other.json", ResourceType::Asset);
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn test_key_evaluation() {
        let plain = Key::from("hero");
        assert_eq!(plain.evaluate(), "hero");

        let indirect = Key::from(AssetReference::new("hero"));
        assert_eq!(indirect.evaluate(), "hero");
    }

    #[test]
    fn test_address_hash_deterministic() {
        assert_eq!(address_hash("level1"), address_hash("level1"));
        assert_ne!(address_hash("level1"), address_hash("level2"));
        // FNV-1a reference value for the empty string
        assert_eq!(address_hash(""), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn test_dependency_of_type() {
        let bundle = Arc::new(ResourceLocation::new(
            "B1",
            "bundles/b1.json",
            ResourceType::AssetBundle,
        ));
        let asset = ResourceLocation::new("hero", "hero", ResourceType::Asset)
            .with_dependencies(vec![bundle.clone()]);
        let dep = asset.dependency_of_type(ResourceType::AssetBundle);
        assert_eq!(dep.map(|d| d.primary_key()), Some("B1"));
        assert!(asset.dependency_of_type(ResourceType::Scene).is_none());
    }
}
