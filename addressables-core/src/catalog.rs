//! Content catalog
//!
//! A catalog is a versioned, immutable set of resource locations: the
//! authoritative map from logical keys to locations. Catalogs are created
//! whole when a catalog document finishes loading and replaced whole on
//! catalog update; nothing mutates one in place. Key and dependent indexes
//! are built lazily on first use and cached for the catalog's lifetime.

use crate::error::{AddressablesError, Result};
use crate::location::{LoadOptions, LocationIdentity, ResourceLocation, ResourceType};
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// One entry of the on-disk catalog document. Dependencies are indices into
/// the document's own entry array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub key: String,
    pub internal_id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub dependencies: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<LoadOptions>,
}

/// Serialized catalog document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub version: String,
    pub entries: Vec<CatalogEntry>,
}

/// Immutable resolved mapping for one catalog version
#[derive(Debug)]
pub struct ContentCatalogData {
    version: String,
    locations: Vec<Arc<ResourceLocation>>,
    key_index: OnceCell<IndexMap<String, Vec<Arc<ResourceLocation>>>>,
    dependents_index: OnceCell<IndexMap<LocationIdentity, Vec<Arc<ResourceLocation>>>>,
}

impl ContentCatalogData {
    /// Build a catalog from already-resolved locations
    pub fn new<V: Into<String>>(version: V, locations: Vec<Arc<ResourceLocation>>) -> Self {
        Self {
            version: version.into(),
            locations,
            key_index: OnceCell::new(),
            dependents_index: OnceCell::new(),
        }
    }

    /// Parse a catalog document from JSON bytes.
    ///
    /// Dependency edges between entries must form a DAG; that property is
    /// guaranteed by the producing build pipeline, so a cycle or an
    /// out-of-range index here is a protocol violation and fails the parse.
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: CatalogDocument = serde_json::from_str(text)?;
        Self::from_document(doc)
    }

    /// Resolve a deserialized document into shared location objects
    pub fn from_document(doc: CatalogDocument) -> Result<Self> {
        let mut resolved: Vec<Option<Arc<ResourceLocation>>> = vec![None; doc.entries.len()];
        let mut visiting = vec![false; doc.entries.len()];
        for index in 0..doc.entries.len() {
            Self::resolve_entry(&doc, index, &mut resolved, &mut visiting)?;
        }

        let locations = resolved.into_iter().flatten().collect::<Vec<_>>();
        debug!(
            version = %doc.version,
            locations = locations.len(),
            "resolved content catalog"
        );
        Ok(Self::new(doc.version, locations))
    }

    fn resolve_entry(
        doc: &CatalogDocument,
        index: usize,
        resolved: &mut Vec<Option<Arc<ResourceLocation>>>,
        visiting: &mut Vec<bool>,
    ) -> Result<Arc<ResourceLocation>> {
        if let Some(loc) = &resolved[index] {
            return Ok(loc.clone());
        }
        if visiting[index] {
            return Err(AddressablesError::Parse(format!(
                "catalog dependency cycle through entry '{}'",
                doc.entries[index].key
            )));
        }
        visiting[index] = true;

        let entry = &doc.entries[index];
        let mut dependencies = Vec::with_capacity(entry.dependencies.len());
        for &dep in &entry.dependencies {
            if dep >= doc.entries.len() || dep == index {
                return Err(AddressablesError::Parse(format!(
                    "catalog entry '{}' has invalid dependency index {}",
                    entry.key, dep
                )));
            }
            dependencies.push(Self::resolve_entry(doc, dep, resolved, visiting)?);
        }

        let mut location =
            ResourceLocation::new(&entry.key, &entry.internal_id, entry.resource_type)
                .with_dependencies(dependencies);
        if let Some(options) = entry.options {
            location = location.with_options(options);
        }

        let location = Arc::new(location);
        resolved[index] = Some(location.clone());
        visiting[index] = false;
        Ok(location)
    }

    /// Serialize back to the on-disk document form
    pub fn to_json(&self) -> Result<String> {
        let mut index_of: IndexMap<LocationIdentity, usize> = IndexMap::new();
        for (i, loc) in self.locations.iter().enumerate() {
            index_of.insert(loc.identity(), i);
        }

        let mut entries = Vec::with_capacity(self.locations.len());
        for loc in &self.locations {
            let mut dependencies = Vec::with_capacity(loc.dependencies().len());
            for dep in loc.dependencies() {
                match index_of.get(&dep.identity()) {
                    Some(&i) => dependencies.push(i),
                    None => {
                        return Err(AddressablesError::Parse(format!(
                            "location '{}' depends on '{}' which is not in this catalog",
                            loc.primary_key(),
                            dep.primary_key()
                        )))
                    }
                }
            }
            entries.push(CatalogEntry {
                key: loc.primary_key().to_string(),
                internal_id: loc.internal_id().to_string(),
                resource_type: loc.resource_type(),
                dependencies,
                options: loc.options().copied(),
            });
        }

        let doc = CatalogDocument {
            version: self.version.clone(),
            entries,
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn locations(&self) -> &[Arc<ResourceLocation>] {
        &self.locations
    }

    /// Locations registered for a primary key, if any. Every indexed key maps
    /// to at least one location.
    pub fn key_locations(&self, key: &str) -> Option<&[Arc<ResourceLocation>]> {
        self.key_index().get(key).map(|v| v.as_slice())
    }

    /// Locations that list the given location as a dependency
    pub fn dependents_of(&self, identity: &LocationIdentity) -> &[Arc<ResourceLocation>] {
        self.dependents_index()
            .get(identity)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn key_index(&self) -> &IndexMap<String, Vec<Arc<ResourceLocation>>> {
        self.key_index.get_or_init(|| {
            let mut index: IndexMap<String, Vec<Arc<ResourceLocation>>> = IndexMap::new();
            for loc in &self.locations {
                index
                    .entry(loc.primary_key().to_string())
                    .or_default()
                    .push(loc.clone());
            }
            index
        })
    }

    fn dependents_index(&self) -> &IndexMap<LocationIdentity, Vec<Arc<ResourceLocation>>> {
        self.dependents_index.get_or_init(|| {
            let mut index: IndexMap<LocationIdentity, Vec<Arc<ResourceLocation>>> = IndexMap::new();
            for loc in &self.locations {
                for dep in loc.dependencies() {
                    index.entry(dep.identity()).or_default().push(loc.clone());
                }
            }
            index
        })
    }
}
