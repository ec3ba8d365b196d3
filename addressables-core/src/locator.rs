//! Resource locators
//!
//! A locator answers "what locations does this key map to?". Several may be
//! active at once (one per loaded catalog); resolving a key queries all of
//! them and unions the results by location identity.

use crate::catalog::ContentCatalogData;
use crate::error::{AddressablesError, Result};
use crate::location::{Key, LocationIdentity, ResourceLocation, ResourceType};
use std::collections::HashSet;
use std::sync::Arc;

/// Maps logical keys to resource locations
pub trait ResourceLocator: Send + Sync {
    /// Stable identifier for this locator (catalog version or similar)
    fn locator_id(&self) -> &str;

    /// Locations for a normalized runtime key, optionally filtered by
    /// resource type. `None` means this locator has no match.
    fn locate(&self, key: &str, ty: Option<ResourceType>) -> Option<Vec<Arc<ResourceLocation>>>;
}

/// Locator backed by one immutable content catalog
pub struct CatalogLocator {
    catalog: Arc<ContentCatalogData>,
    id: String,
}

impl CatalogLocator {
    pub fn new(catalog: Arc<ContentCatalogData>) -> Self {
        let id = catalog.version().to_string();
        Self { catalog, id }
    }

    pub fn catalog(&self) -> &Arc<ContentCatalogData> {
        &self.catalog
    }
}

impl ResourceLocator for CatalogLocator {
    fn locator_id(&self) -> &str {
        &self.id
    }

    fn locate(&self, key: &str, ty: Option<ResourceType>) -> Option<Vec<Arc<ResourceLocation>>> {
        let locations = self.catalog.key_locations(key)?;
        let matching: Vec<_> = locations
            .iter()
            .filter(|loc| ty.map_or(true, |t| loc.resource_type() == t))
            .cloned()
            .collect();
        if matching.is_empty() {
            None
        } else {
            Some(matching)
        }
    }
}

/// A registered locator plus the remote catalog location used for update
/// checks, when the locator came from a remote-capable catalog.
pub struct ResourceLocatorInfo {
    locator: Arc<dyn ResourceLocator>,
    remote_catalog_location: Option<Arc<ResourceLocation>>,
}

impl ResourceLocatorInfo {
    pub fn new(
        locator: Arc<dyn ResourceLocator>,
        remote_catalog_location: Option<Arc<ResourceLocation>>,
    ) -> Self {
        Self {
            locator,
            remote_catalog_location,
        }
    }

    pub fn locator(&self) -> &Arc<dyn ResourceLocator> {
        &self.locator
    }

    pub fn remote_catalog_location(&self) -> Option<&Arc<ResourceLocation>> {
        self.remote_catalog_location.as_ref()
    }
}

/// Resolve a key across every registered locator.
///
/// The common case is a single catalog: if exactly one locator matches, its
/// list is returned as-is without allocating a merge set. Multiple matches
/// are unioned by location identity. No match at all is an `InvalidKey`
/// error value, not a panic.
pub fn resolve_locations(
    locators: &[ResourceLocatorInfo],
    key: &Key,
    ty: Option<ResourceType>,
) -> Result<Vec<Arc<ResourceLocation>>> {
    let runtime_key = key.evaluate();

    let mut found: Option<Vec<Arc<ResourceLocation>>> = None;
    let mut seen: Option<HashSet<LocationIdentity>> = None;
    for info in locators {
        let Some(locations) = info.locator().locate(runtime_key, ty) else {
            continue;
        };
        match found.as_mut() {
            None => found = Some(locations),
            Some(existing) => {
                // less common path: merge by identity
                let seen = seen
                    .get_or_insert_with(|| existing.iter().map(|l| l.identity()).collect());
                for loc in locations {
                    if seen.insert(loc.identity()) {
                        existing.push(loc);
                    }
                }
            }
        }
    }

    found.ok_or_else(|| AddressablesError::invalid_key(runtime_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ContentCatalogData;

    fn catalog_with(version: &str, key: &str, internal_id: &str) -> ResourceLocatorInfo {
        let text = serde_json::json!({
            "version": version,
            "entries": [
                { "key": key, "internal_id": internal_id, "type": "asset" }
            ]
        })
        .to_string();
        let catalog = Arc::new(ContentCatalogData::from_json(&text).unwrap());
        ResourceLocatorInfo::new(Arc::new(CatalogLocator::new(catalog)), None)
    }

    #[test]
    fn test_single_locator_hit() {
        let locators = vec![catalog_with("v1", "icon", "icons/icon.png")];
        let locations = resolve_locations(&locators, &Key::from("icon"), None).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].internal_id(), "icons/icon.png");
    }

    #[test]
    fn test_unresolvable_key_is_invalid_key() {
        let locators = vec![catalog_with("v1", "icon", "icons/icon.png")];
        let err = resolve_locations(&locators, &Key::from("missing"), None).unwrap_err();
        assert_eq!(err, AddressablesError::invalid_key("missing"));
    }

    #[test]
    fn test_union_of_two_locators() {
        let locators = vec![
            catalog_with("v1", "icon", "icons/icon_v1.png"),
            catalog_with("v2", "icon", "icons/icon_v2.png"),
        ];
        let locations = resolve_locations(&locators, &Key::from("icon"), None).unwrap();
        assert_eq!(locations.len(), 2);

        // registration order must not change the set
        let reversed = vec![
            catalog_with("v2", "icon", "icons/icon_v2.png"),
            catalog_with("v1", "icon", "icons/icon_v1.png"),
        ];
        let mut ids: Vec<_> = resolve_locations(&reversed, &Key::from("icon"), None)
            .unwrap()
            .iter()
            .map(|l| l.internal_id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["icons/icon_v1.png", "icons/icon_v2.png"]);
    }

    #[test]
    fn test_union_deduplicates_by_identity() {
        let locators = vec![
            catalog_with("v1", "icon", "icons/icon.png"),
            catalog_with("v2", "icon", "icons/icon.png"),
        ];
        let locations = resolve_locations(&locators, &Key::from("icon"), None).unwrap();
        assert_eq!(locations.len(), 1);
    }

    #[test]
    fn test_type_filter() {
        let locators = vec![catalog_with("v1", "icon", "icons/icon.png")];
        assert!(resolve_locations(&locators, &Key::from("icon"), Some(ResourceType::Scene)).is_err());
    }
}
