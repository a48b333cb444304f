//! Build metadata embedded by `build.rs`, reported by `gnlink --version`
//! and logged when a responder starts.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("GNLINK_GIT_HASH");

/// The build timestamp as a Unix epoch string.
pub const BUILD_TIMESTAMP: &str = env!("GNLINK_BUILD_TIMESTAMP");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("GNLINK_BUILD_PROFILE");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

/// Seconds since the Unix epoch at build time, if the build script could
/// read the clock.
pub fn build_time() -> Option<u64> {
    BUILD_TIMESTAMP.parse().ok().filter(|&secs| secs > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_not_empty() {
        let v = version_string();
        assert!(!v.is_empty());
        assert!(v.contains(VERSION));
    }

    #[test]
    fn test_git_hash_not_empty() {
        assert!(!GIT_HASH.is_empty());
    }

    #[test]
    fn test_build_profile_is_known() {
        assert!(["debug", "release"].contains(&BUILD_PROFILE));
    }

    #[test]
    fn test_build_time_parses() {
        assert!(build_time().is_some());
    }
}
