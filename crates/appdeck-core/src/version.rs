//! Template version parsing.
//!
//! Template versions are semantic versions. A leading `v` is tolerated
//! (`v1.2.0`), and the canonical form is what gets pinned onto instances.

use semver::Version;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid template version {input:?}: {source}")]
pub struct VersionError {
    pub input: String,
    #[source]
    pub source: semver::Error,
}

/// Parse a template version string.
pub fn parse_version(input: &str) -> Result<Version, VersionError> {
    let trimmed = input.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(bare).map_err(|source| VersionError {
        input: input.to_string(),
        source,
    })
}

/// Canonical string form of a template version.
pub fn canonical_version(input: &str) -> Result<String, VersionError> {
    parse_version(input).map(|v| v.to_string())
}
