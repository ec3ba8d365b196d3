//! Runtime configuration

use std::path::PathBuf;

/// Configuration for an [`AddressablesRuntime`](crate::AddressablesRuntime)
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Writable directory for locally cached catalogs and hash tokens.
    /// Subpaths are keyed by a hash of the remote hash-file path, so
    /// concurrent catalogs do not collide.
    pub cache_dir: PathBuf,
    /// File extension of catalog documents (`json` for the JSON encoding)
    pub catalog_extension: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("addressables-cache"),
            catalog_extension: "json".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Config rooted at a specific writable data directory
    pub fn with_cache_dir<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }
}

/// Replace the final extension of a path-like string, appending if none
pub(crate) fn swap_extension(path: &str, extension: &str) -> String {
    match path.rfind('.') {
        Some(dot) if !path[dot + 1..].contains('/') => {
            format!("{}.{}", &path[..dot], extension)
        }
        _ => format!("{path}.{extension}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_extension() {
        assert_eq!(swap_extension("a/catalog.json", "hash"), "a/catalog.hash");
        assert_eq!(swap_extension("a/catalog", "hash"), "a/catalog.hash");
        assert_eq!(swap_extension("a.b/catalog", "hash"), "a.b/catalog.hash");
    }
}
