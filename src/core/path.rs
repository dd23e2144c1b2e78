//! Deterministic storage layout for card artifacts
//!
//! `{team}/{name}/v{major}.{minor}.{patch}[-{prerelease}]/{artifact_kind}`
//!
//! Paths are relative to the storage root. Team and name are validated
//! slugs and the version was issued exactly once, so two resolutions can
//! only collide if the ledger issued the same version twice.

use crate::codec::ArtifactKind;
use crate::validation::Slug;
use semver::Version;

/// Resolve the storage path of an artifact
pub fn resolve(team: &Slug, name: &Slug, version: &Version, kind: ArtifactKind) -> String {
    format!("{}/{}/v{}/{}", team, name, version, kind.as_str())
}

/// Staging location used while an artifact is being written
///
/// Lives beside the final path so a same-filesystem rename is possible.
pub fn staging_path(final_path: &str, token: &str) -> String {
    format!("{}.staging-{}", final_path, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slug(s: &str) -> Slug {
        Slug::new(s).unwrap()
    }

    #[test]
    fn test_resolve_release() {
        let path = resolve(
            &slug("fraud"),
            &slug("scorer"),
            &Version::new(1, 4, 2),
            ArtifactKind::Model,
        );
        assert_eq!(path, "fraud/scorer/v1.4.2/model");
    }

    #[test]
    fn test_resolve_pre_release() {
        let version = Version::parse("2.0.0-rc.3").unwrap();
        let path = resolve(&slug("fraud"), &slug("features"), &version, ArtifactKind::Tabular);
        assert_eq!(path, "fraud/features/v2.0.0-rc.3/tabular");
    }

    #[test]
    fn test_resolve_is_deterministic_and_distinct() {
        let a = resolve(&slug("t"), &slug("n"), &Version::new(0, 0, 1), ArtifactKind::Metadata);
        let b = resolve(&slug("t"), &slug("n"), &Version::new(0, 0, 1), ArtifactKind::Metadata);
        let c = resolve(&slug("t"), &slug("n"), &Version::new(0, 0, 2), ArtifactKind::Metadata);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("t/n/"));
    }

    #[test]
    fn test_staging_paths() {
        let staged = staging_path("t/n/v0.0.1/model", "abc123");
        assert_eq!(staged, "t/n/v0.0.1/model.staging-abc123");
        assert!(staged.starts_with("t/n/v0.0.1/"));
    }
}
