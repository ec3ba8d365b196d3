//! Fetch boundary
//!
//! Raw byte/text loading capability supplied to the catalog provider and the
//! bundle loader. Transparent over local file paths and remote URLs: callers
//! never branch on the source kind except to decide whether a miss is worth
//! logging (persistent-cache probes are expected to sometimes be absent).

use addressables_core::{AddressablesError, ResourceLocation, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::engine::{Handle, OperationEngine};

/// Raw bytes for a path or URL
#[async_trait]
pub trait FetchProvider: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<Bytes>;
}

/// Whether a path should go through a web request rather than the filesystem
pub fn is_remote_path(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

/// Filesystem-backed fetch provider
#[derive(Debug, Default, Clone)]
pub struct FileFetcher;

#[async_trait]
impl FetchProvider for FileFetcher {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| AddressablesError::Io(format!("{path}: {e}")))?;
        Ok(Bytes::from(data))
    }
}

/// Fetch a location's content as text, honoring its load options.
///
/// A miss on a location marked `ignore_failures` completes successfully with
/// `None` so speculative cache probes stay off the error channels.
pub async fn fetch_text(
    fetcher: &Arc<dyn FetchProvider>,
    location: &ResourceLocation,
) -> Result<Option<String>> {
    let path = location.internal_id();
    let ignore_failures = location
        .options()
        .map(|o| o.ignore_failures)
        .unwrap_or(false);

    match fetcher.fetch(path).await {
        Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Ok(Some(text)),
            Err(e) if ignore_failures => {
                debug!(path, "ignoring undecodable text content: {e}");
                Ok(None)
            }
            Err(e) => Err(AddressablesError::Parse(format!("{path}: {e}"))),
        },
        Err(e) if ignore_failures => {
            debug!(path, "ignorable fetch miss: {e}");
            Ok(None)
        }
        Err(e) => Err(AddressablesError::ProviderFailure {
            location: path.to_string(),
            message: e.to_string(),
            ignorable: false,
        }),
    }
}

/// Handle-producing text provider over the fetch boundary
pub fn provide_text(
    engine: &OperationEngine,
    fetcher: &Arc<dyn FetchProvider>,
    location: &Arc<ResourceLocation>,
) -> Handle<Option<String>> {
    let fetcher = fetcher.clone();
    let location = location.clone();
    engine.spawn(async move { fetch_text(&fetcher, &location).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use addressables_core::{LoadOptions, ResourceType};

    #[test]
    fn test_remote_path_detection() {
        assert!(is_remote_path("https://cdn.example.com/catalog.json"));
        assert!(is_remote_path("http://cdn.example.com/catalog.json"));
        assert!(!is_remote_path("/data/catalog.json"));
        assert!(!is_remote_path("relative/catalog.json"));
    }

    #[tokio::test]
    async fn test_missing_ignorable_location_is_quiet_success() {
        let fetcher: Arc<dyn FetchProvider> = Arc::new(FileFetcher);
        let location = Arc::new(
            ResourceLocation::new(
                "probe",
                "/definitely/not/here.hash",
                ResourceType::RawText,
            )
            .with_options(LoadOptions {
                ignore_failures: true,
            }),
        );
        let result = fetch_text(&fetcher, &location).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_missing_required_location_fails() {
        let fetcher: Arc<dyn FetchProvider> = Arc::new(FileFetcher);
        let location = Arc::new(ResourceLocation::new(
            "catalog",
            "/definitely/not/here.json",
            ResourceType::RawText,
        ));
        let err = fetch_text(&fetcher, &location).await.unwrap_err();
        assert!(matches!(err, AddressablesError::ProviderFailure { .. }));
    }

    #[tokio::test]
    async fn test_provide_text_reads_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.hash");
        tokio::fs::write(&path, "abc123").await.unwrap();

        let engine = OperationEngine::new();
        let fetcher: Arc<dyn FetchProvider> = Arc::new(FileFetcher);
        let location = Arc::new(ResourceLocation::new(
            "token",
            path.to_string_lossy(),
            ResourceType::RawText,
        ));
        let handle = provide_text(&engine, &fetcher, &location);
        let result = engine.wait_for_completion(&handle).await.unwrap();
        assert_eq!(result.as_deref(), Some("abc123"));
    }
}
