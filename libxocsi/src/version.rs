//! Build metadata reported by `GetPluginInfo` and `xocsi --version`.
//!
//! The git commit and build date are injected at build time through the
//! `XOCSI_GIT_COMMIT` and `XOCSI_BUILD_DATE` environment variables.

const UNKNOWN: &str = "unknown";

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn git_commit() -> &'static str {
    option_env!("XOCSI_GIT_COMMIT").unwrap_or(UNKNOWN)
}

pub fn build_date() -> &'static str {
    option_env!("XOCSI_BUILD_DATE").unwrap_or(UNKNOWN)
}

/// One-line summary, e.g. `Version: 0.1.0, GitCommit: abc123, BuildDate: ...`.
pub fn version_info() -> String {
    format!(
        "Version: {}, GitCommit: {}, BuildDate: {}",
        version(),
        git_commit(),
        build_date()
    )
}
