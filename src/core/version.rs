//! Semantic version bumping and matching for card families
//!
//! Versions follow `MAJOR.MINOR.PATCH[-PRERELEASE]` with semver ordering.
//! Build metadata is never issued.

use crate::error::{RegistryError, Result};
use semver::{Prerelease, Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Requested granularity of a version increment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BumpKind {
    /// (M+1).0.0
    Major,
    /// M.(m+1).0
    Minor,
    /// M.m.(p+1)
    Patch,
    /// Increment the pre-release counter of `label`, e.g. `rc.1` -> `rc.2`
    PreRelease { label: String },
}

impl BumpKind {
    pub fn pre_release(label: impl Into<String>) -> Self {
        BumpKind::PreRelease {
            label: label.into(),
        }
    }

    /// Compute the version issued after `current`
    ///
    /// `current` is the last issued version of the family, or 0.0.0 when the
    /// family has never issued one. The result is always strictly greater
    /// than `current`.
    ///
    /// A pre-release bump on a released version starts a pre-release of the
    /// next patch (`1.4.2` -> `1.4.3-rc.1`), since `1.4.2-rc.1` would sort
    /// below `1.4.2`.
    pub fn apply(&self, current: &Version) -> Result<Version> {
        let overflow =
            || RegistryError::Validation(format!("version component overflow bumping {}", current));

        let next = match self {
            BumpKind::Major => {
                Version::new(current.major.checked_add(1).ok_or_else(overflow)?, 0, 0)
            }
            BumpKind::Minor => Version::new(
                current.major,
                current.minor.checked_add(1).ok_or_else(overflow)?,
                0,
            ),
            BumpKind::Patch => Version::new(
                current.major,
                current.minor,
                current.patch.checked_add(1).ok_or_else(overflow)?,
            ),
            BumpKind::PreRelease { label } => {
                validate_label(label)?;
                if current.pre.is_empty() {
                    let mut next = Version::new(
                        current.major,
                        current.minor,
                        current.patch.checked_add(1).ok_or_else(overflow)?,
                    );
                    next.pre = Prerelease::new(&format!("{}.1", label))?;
                    next
                } else {
                    let counter = match split_counter(current.pre.as_str()) {
                        Some((current_label, n)) if current_label == label => {
                            n.checked_add(1).ok_or_else(overflow)?
                        }
                        _ => 1,
                    };
                    let mut next = Version::new(current.major, current.minor, current.patch);
                    next.pre = Prerelease::new(&format!("{}.{}", label, counter))?;
                    next
                }
            }
        };

        if next <= *current {
            return Err(RegistryError::Validation(format!(
                "{} bump from {} yields {}, which does not advance the family",
                self, current, next
            )));
        }

        Ok(next)
    }
}

impl fmt::Display for BumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BumpKind::Major => write!(f, "major"),
            BumpKind::Minor => write!(f, "minor"),
            BumpKind::Patch => write!(f, "patch"),
            BumpKind::PreRelease { label } => write!(f, "pre-release({})", label),
        }
    }
}

impl FromStr for BumpKind {
    type Err = RegistryError;

    /// Parses `major`, `minor`, `patch`, `pre` (label `rc`) or `pre:<label>`
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "major" => Ok(BumpKind::Major),
            "minor" => Ok(BumpKind::Minor),
            "patch" => Ok(BumpKind::Patch),
            "pre" | "prerelease" | "pre-release" => Ok(BumpKind::pre_release("rc")),
            other => match other.strip_prefix("pre:") {
                Some(label) => {
                    validate_label(label)?;
                    Ok(BumpKind::pre_release(label))
                }
                None => Err(RegistryError::Validation(format!(
                    "unknown bump kind '{}'. Valid options: major, minor, patch, pre, pre:<label>",
                    s
                ))),
            },
        }
    }
}

/// Split `rc.3` into `("rc", 3)`
fn split_counter(pre: &str) -> Option<(&str, u64)> {
    let (label, counter) = pre.rsplit_once('.')?;
    counter.parse::<u64>().ok().map(|n| (label, n))
}

fn validate_label(label: &str) -> Result<()> {
    let valid = !label.is_empty()
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !label.chars().all(|c| c.is_ascii_digit());
    if !valid {
        return Err(RegistryError::Validation(format!(
            "pre-release label '{}' must be a non-numeric alphanumeric identifier",
            label
        )));
    }
    Ok(())
}

/// Parse a version string, rejecting build metadata
pub fn parse_version(s: &str) -> Result<Version> {
    let version = Version::parse(s.trim())?;
    if !version.build.is_empty() {
        return Err(RegistryError::Validation(format!(
            "version '{}' carries build metadata, which cards never use",
            s
        )));
    }
    Ok(version)
}

/// Version selector used by lookups
///
/// A bare `1.2.3` matches exactly; anything else is a semver requirement
/// (`^1.2`, `~1.2`, `1.*`, `>=1.0, <2.0`, `*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionFilter {
    Exact(Version),
    Req(VersionReq),
}

impl VersionFilter {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(version) = Version::parse(s) {
            return Ok(VersionFilter::Exact(version));
        }
        let req = VersionReq::parse(s).map_err(|e| {
            RegistryError::Validation(format!("invalid version requirement '{}': {}", s, e))
        })?;
        Ok(VersionFilter::Req(req))
    }

    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionFilter::Exact(exact) => exact == version,
            VersionFilter::Req(req) => req.matches(version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_release_bumps() {
        let current = v("1.4.2");
        assert_eq!(BumpKind::Major.apply(&current).unwrap(), v("2.0.0"));
        assert_eq!(BumpKind::Minor.apply(&current).unwrap(), v("1.5.0"));
        assert_eq!(BumpKind::Patch.apply(&current).unwrap(), v("1.4.3"));
    }

    #[test]
    fn test_bumps_from_empty_family() {
        let zero = Version::new(0, 0, 0);
        assert_eq!(BumpKind::Patch.apply(&zero).unwrap(), v("0.0.1"));
        assert_eq!(BumpKind::Minor.apply(&zero).unwrap(), v("0.1.0"));
        assert_eq!(BumpKind::Major.apply(&zero).unwrap(), v("1.0.0"));
        assert_eq!(
            BumpKind::pre_release("rc").apply(&zero).unwrap(),
            v("0.0.1-rc.1")
        );
    }

    #[test]
    fn test_pre_release_counter() {
        let rc = BumpKind::pre_release("rc");
        assert_eq!(rc.apply(&v("1.4.3-rc.1")).unwrap(), v("1.4.3-rc.2"));
        assert_eq!(rc.apply(&v("1.4.2")).unwrap(), v("1.4.3-rc.1"));

        // a later label restarts the counter on the same release triple
        assert_eq!(
            rc.apply(&v("1.4.3-beta.7")).unwrap(),
            v("1.4.3-rc.1")
        );
    }

    #[test]
    fn test_pre_release_label_cannot_go_backwards() {
        let alpha = BumpKind::pre_release("alpha");
        assert!(alpha.apply(&v("1.4.3-rc.2")).is_err());
    }

    #[test]
    fn test_release_bump_from_pre_release() {
        let current = v("1.4.3-rc.2");
        assert_eq!(BumpKind::Patch.apply(&current).unwrap(), v("1.4.4"));
        assert_eq!(BumpKind::Minor.apply(&current).unwrap(), v("1.5.0"));
    }

    #[test]
    fn test_invalid_labels() {
        assert!(BumpKind::pre_release("").apply(&v("1.0.0")).is_err());
        assert!(BumpKind::pre_release("42").apply(&v("1.0.0")).is_err());
        assert!(BumpKind::pre_release("rc.1").apply(&v("1.0.0")).is_err());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let max = Version::new(u64::MAX, 0, 0);
        assert!(BumpKind::Major.apply(&max).is_err());
    }

    #[test]
    fn test_parse_bump_kind() {
        assert_eq!("major".parse::<BumpKind>().unwrap(), BumpKind::Major);
        assert_eq!(" Patch ".parse::<BumpKind>().unwrap(), BumpKind::Patch);
        assert_eq!(
            "pre".parse::<BumpKind>().unwrap(),
            BumpKind::pre_release("rc")
        );
        assert_eq!(
            "pre:beta".parse::<BumpKind>().unwrap(),
            BumpKind::pre_release("beta")
        );
        assert!("huge".parse::<BumpKind>().is_err());
    }

    #[test]
    fn test_parse_version_rejects_build_metadata() {
        assert!(parse_version("1.0.0").is_ok());
        assert!(parse_version("1.0.0-rc.1").is_ok());
        assert!(parse_version("1.0.0+build.5").is_err());
        assert!(parse_version("1.0").is_err());
    }

    #[test]
    fn test_version_filters() {
        let exact = VersionFilter::parse("1.2.3").unwrap();
        assert!(matches!(exact, VersionFilter::Exact(_)));
        assert!(exact.matches(&v("1.2.3")));
        assert!(!exact.matches(&v("1.2.4")));

        let caret = VersionFilter::parse("^1.2").unwrap();
        assert!(caret.matches(&v("1.9.0")));
        assert!(!caret.matches(&v("2.0.0")));

        let tilde = VersionFilter::parse("~1.2").unwrap();
        assert!(tilde.matches(&v("1.2.9")));
        assert!(!tilde.matches(&v("1.3.0")));

        let wildcard = VersionFilter::parse("1.*").unwrap();
        assert!(wildcard.matches(&v("1.0.0")));
        assert!(!wildcard.matches(&v("2.0.0")));

        let range = VersionFilter::parse(">=1.0.0, <1.5.0").unwrap();
        assert!(range.matches(&v("1.4.2")));
        assert!(!range.matches(&v("1.5.0")));

        assert!(VersionFilter::parse("not a version").is_err());
    }
}
