//! Logical addressing for stored blobs.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Internal key prefix reserved for adapter bookkeeping objects.
pub(crate) const INTERNAL_PREFIX: &str = ".leo";

/// Identifies a logical blob as a `(container, base_path)` pair.
///
/// The container is a namespace (typically a partition id); the base path is
/// a forward-slash-delimited logical path. Equality is case-sensitive and
/// byte-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub container: String,
    pub base_path: String,
}

impl Location {
    pub fn new(container: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            base_path: base_path.into(),
        }
    }

    /// Check the location is addressable: non-empty container without path
    /// separators, non-empty relative base path outside the internal prefix.
    pub fn validate(&self) -> Result<()> {
        validate_container(&self.container)?;
        if self.base_path.is_empty() {
            return Err(Error::Config("base path must not be empty".to_string()));
        }
        if self.base_path.starts_with('/') {
            return Err(Error::Config(format!(
                "base path must be relative: {}",
                self.base_path
            )));
        }
        if self.base_path == INTERNAL_PREFIX
            || self.base_path.starts_with(&format!("{}/", INTERNAL_PREFIX))
        {
            return Err(Error::Config(format!(
                "base path {} collides with the reserved {} prefix",
                self.base_path, INTERNAL_PREFIX
            )));
        }
        Ok(())
    }

    /// First non-empty path segment of the base path, splitting on `/` or `\`.
    pub fn first_path_segment(&self) -> &str {
        first_path_segment(&self.base_path)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.container, self.base_path)
    }
}

pub(crate) fn validate_container(container: &str) -> Result<()> {
    if container.is_empty() {
        return Err(Error::Config("container must not be empty".to_string()));
    }
    if container.contains('/') || container.contains('\\') {
        return Err(Error::Config(format!(
            "container must not contain path separators: {container}"
        )));
    }
    Ok(())
}

/// First non-empty token of `path` split on `/` or `\`, or `""` when the path
/// has none.
pub fn first_path_segment(path: &str) -> &str {
    path.split(['/', '\\'])
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_container_and_path() {
        let loc = Location::new("kalixtest", "tests/A.dat");
        assert_eq!(loc.to_string(), "kalixtest/tests/A.dat");
    }

    #[test]
    fn equality_is_case_sensitive() {
        assert_ne!(
            Location::new("c", "tests/A.dat"),
            Location::new("c", "tests/a.dat")
        );
    }

    #[test]
    fn first_segment_skips_empty_tokens() {
        assert_eq!(first_path_segment("orders/2024/1.json"), "orders");
        assert_eq!(first_path_segment("orders\\2024"), "orders");
        assert_eq!(first_path_segment("/orders/1"), "orders");
        assert_eq!(first_path_segment(""), "");
    }

    #[test]
    fn validate_rejects_internal_prefix() {
        assert!(Location::new("c", ".leo/current/x").validate().is_err());
        assert!(Location::new("c", ".leopard/x").validate().is_ok());
        assert!(Location::new("c/d", "x").validate().is_err());
        assert!(Location::new("c", "/x").validate().is_err());
    }
}
