//! Error handling
//!
//! One shared error type for the addressables workspace. Errors travel as
//! values inside operation handles; nothing in the public surface panics.

use thiserror::Error;

/// Result type for addressables operations
pub type Result<T> = std::result::Result<T, AddressablesError>;

/// Main error type for the addressables runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressablesError {
    /// No registered locator resolved the key.
    #[error("invalid key: {key}")]
    InvalidKey { key: String },

    /// A provider-level fetch or conversion failed for a location.
    #[error("provider failure for '{location}': {message}")]
    ProviderFailure {
        location: String,
        message: String,
        /// Failures on locations marked expected-to-possibly-fail (cache
        /// probes) complete successfully with an empty result instead of
        /// surfacing this error.
        ignorable: bool,
    },

    /// Catalog load failed after the single allowed retry.
    #[error("unable to load content catalog from '{location}' on second attempt")]
    CatalogLoadFailure { location: String },

    /// A dependency bundle failed to load; propagated to the dependent
    /// unless the request was created failure-tolerant.
    #[error("dependency bundle '{bundle}' unresolved: {message}")]
    DependencyUnresolved { bundle: String, message: String },

    /// The handle was already released or never issued by this engine.
    #[error("invalid or released operation handle")]
    InvalidHandle,

    /// Caller bug: releasing an unknown result, unbalanced release, etc.
    #[error("usage error: {0}")]
    Usage(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl AddressablesError {
    /// Create a provider failure for a location
    pub fn provider<L: Into<String>, M: Into<String>>(location: L, message: M) -> Self {
        Self::ProviderFailure {
            location: location.into(),
            message: message.into(),
            ignorable: false,
        }
    }

    /// Create an invalid-key error
    pub fn invalid_key<K: Into<String>>(key: K) -> Self {
        Self::InvalidKey { key: key.into() }
    }

    /// Create a usage error
    pub fn usage<M: Into<String>>(message: M) -> Self {
        Self::Usage(message.into())
    }

    /// Whether the failure was tagged as expected-to-possibly-fail
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::ProviderFailure { ignorable: true, .. })
    }
}

impl From<std::io::Error> for AddressablesError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for AddressablesError {
    fn from(error: serde_json::Error) -> Self {
        Self::Parse(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignorable_flag() {
        let probe = AddressablesError::ProviderFailure {
            location: "cache/abc.hash".into(),
            message: "not found".into(),
            ignorable: true,
        };
        assert!(probe.is_ignorable());
        assert!(!AddressablesError::provider("a", "b").is_ignorable());
    }

    #[test]
    fn test_io_conversion() {
        let err: AddressablesError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, AddressablesError::Io(_)));
    }
}
