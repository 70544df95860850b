//! Identity handles.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// Opaque handle naming one provisioned user identity.
///
/// Supplied by callers; the session manager never interprets its contents
/// beyond using it as a cache key and storage namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Arc<str>);

impl Identity {
    /// Create an identity from any string-like value.
    #[must_use]
    pub fn new(handle: impl AsRef<str>) -> Self {
        Self(Arc::from(handle.as_ref()))
    }

    /// Borrow the raw handle.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(handle: &str) -> Self {
        Self::new(handle)
    }
}

impl From<String> for Identity {
    fn from(handle: String) -> Self {
        Self(Arc::from(handle))
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

