//! Content package metadata and compatibility checks.

use std::fmt;

use bitcode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// A content package enabled for a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct ContentPackageInfo {
    /// Human readable package name
    pub name: String,
    /// xxHash3 of the package manifest
    pub hash: u64,
}

impl ContentPackageInfo {
    pub fn new(name: impl Into<String>, hash: u64) -> Self {
        Self {
            name: name.into(),
            hash,
        }
    }

    /// Build package info by hashing the raw manifest bytes
    pub fn from_manifest(name: impl Into<String>, manifest: &[u8]) -> Self {
        Self::new(name, xxh3_64(manifest))
    }
}

impl fmt::Display for ContentPackageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:016x})", self.name, self.hash)
    }
}

/// Packages the host requires that a client does not have
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing content packages: {}", format_packages(.missing))]
pub struct ContentMismatch {
    pub missing: Vec<ContentPackageInfo>,
}

fn format_packages(packages: &[ContentPackageInfo]) -> String {
    packages
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Check that `available` contains every package in `required`.
///
/// Packages are matched by hash. Order is not considered here; the host's
/// order is negotiated separately during the handshake.
pub fn check_content_compatibility(
    required: &[ContentPackageInfo],
    available: &[ContentPackageInfo],
) -> Result<(), ContentMismatch> {
    let missing: Vec<ContentPackageInfo> = required
        .iter()
        .filter(|req| !available.iter().any(|have| have.hash == req.hash))
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ContentMismatch { missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_manifest_hash_is_stable() {
        let a = ContentPackageInfo::from_manifest("Vanilla", b"<package name=\"Vanilla\"/>");
        let b = ContentPackageInfo::from_manifest("Renamed", b"<package name=\"Vanilla\"/>");
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, ContentPackageInfo::from_manifest("Vanilla", b"other").hash);
    }

    #[test]
    fn test_compatible_superset() {
        let required = vec![ContentPackageInfo::new("Vanilla", 1)];
        let available = vec![ContentPackageInfo::new("Extra", 2), ContentPackageInfo::new("Vanilla", 1)];
        assert!(check_content_compatibility(&required, &available).is_ok());
    }

    #[test]
    fn test_missing_packages_reported() {
        let required = vec![ContentPackageInfo::new("Vanilla", 1), ContentPackageInfo::new("Mod", 7)];
        let available = vec![ContentPackageInfo::new("Vanilla", 1)];

        let err = check_content_compatibility(&required, &available).unwrap_err();
        assert_eq!(err.missing, vec![ContentPackageInfo::new("Mod", 7)]);
        assert!(err.to_string().contains("Mod"));
    }
}
