//! Release version parsing and placeholder detection.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::errors::VerificationError;

#[allow(clippy::expect_used)]
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-([0-9A-Za-z.-]+))?(?:\+([0-9A-Za-z.-]+))?$",
    )
    .expect("version pattern is valid")
});

/// Versions that build tooling emits when no real version was stamped.
pub const PLACEHOLDER_VERSIONS: &[&str] = &["0.0.0", "0.0.0-dev", "0.0.0.dev0", "0.0.0+unknown"];

/// A parsed `MAJOR.MINOR.PATCH[-pre][+build]` version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseVersion {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
    /// Pre-release tag, without the leading `-`.
    pub pre: Option<String>,
    /// Build metadata, without the leading `+`.
    pub build: Option<String>,
}

impl ReleaseVersion {
    /// Parses a version, accepting and stripping a leading `v` or `V`.
    pub fn parse(input: &str) -> Result<Self, VerificationError> {
        let trimmed = strip_tag_prefix(input.trim());
        let caps = VERSION_RE.captures(trimmed).ok_or_else(|| {
            VerificationError::new(format!("'{input}' is not a MAJOR.MINOR.PATCH version"))
                .with_checks(vec!["version_format".to_string()])
        })?;

        let component = |idx: usize| -> Result<u64, VerificationError> {
            caps[idx].parse::<u64>().map_err(|e| {
                VerificationError::new(format!("version component out of range in '{input}': {e}"))
                    .with_checks(vec!["version_format".to_string()])
            })
        };

        Ok(Self {
            major: component(1)?,
            minor: component(2)?,
            patch: component(3)?,
            pre: caps.get(4).map(|m| m.as_str().to_string()),
            build: caps.get(5).map(|m| m.as_str().to_string()),
        })
    }

    /// Returns true for the `0.0.0` family of sentinel versions.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.major == 0 && self.minor == 0 && self.patch == 0
    }

    /// Returns true if a pre-release tag is present.
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }
}

impl FromStr for ReleaseVersion {
    type Err = VerificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.pre {
            write!(f, "-{pre}")?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

/// Strips a `v`/`V` tag prefix.
#[must_use]
pub fn strip_tag_prefix(tag: &str) -> &str {
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag)
}

/// Checks that `version` is a real, non-sentinel release version.
///
/// `extra_placeholders` are matched verbatim in addition to the
/// built-in sentinels.
pub fn check_version_sanity(
    version: &str,
    extra_placeholders: &[String],
) -> Result<ReleaseVersion, VerificationError> {
    let bare = strip_tag_prefix(version.trim());
    if PLACEHOLDER_VERSIONS.contains(&bare) || extra_placeholders.iter().any(|p| p == bare) {
        return Err(VerificationError::new(format!(
            "version '{version}' is a placeholder"
        ))
        .with_checks(vec!["version_placeholder".to_string()]));
    }

    let parsed = ReleaseVersion::parse(bare)?;
    if parsed.is_placeholder() {
        return Err(VerificationError::new(format!(
            "version '{version}' is a placeholder"
        ))
        .with_checks(vec!["version_placeholder".to_string()]));
    }
    Ok(parsed)
}
