//! Binary prerequisite checks for a flow.
//!
//! Each enabled step's binary is resolved on `PATH`. API-only providers are
//! reported with their endpoint instead of a filesystem path.

use std::path::{Path, PathBuf};

use crate::flow::{Step, is_api_only_binary, required_binaries};

/// Base URL reported for the in-process DeepSeek provider.
pub const DEEPSEEK_API_BASE_URL: &str = "https://api.deepseek.com";

/// Resolution status of one binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryStatus {
    pub binary: String,
    /// Filesystem path, or the API endpoint for API-only providers.
    pub resolved: Option<String>,
    pub is_available: bool,
    /// The binary lives in a directory any user can write to.
    pub is_world_writable_location: bool,
}

/// Evaluate every binary needed by the enabled steps of `steps`.
pub fn evaluate_prerequisites(steps: &[Step]) -> Vec<BinaryStatus> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let search: Vec<PathBuf> = std::env::split_paths(&path_var).collect();
    evaluate_prerequisites_in(steps, &search)
}

/// Same as [`evaluate_prerequisites`] with an explicit search path.
pub fn evaluate_prerequisites_in(steps: &[Step], search: &[PathBuf]) -> Vec<BinaryStatus> {
    required_binaries(steps)
        .into_iter()
        .map(|binary| {
            if is_api_only_binary(&binary) {
                return BinaryStatus {
                    binary,
                    resolved: Some(DEEPSEEK_API_BASE_URL.to_string()),
                    is_available: true,
                    is_world_writable_location: false,
                };
            }
            match find_in_path(&binary, search) {
                Some(path) => BinaryStatus {
                    is_world_writable_location: path.parent().is_some_and(is_world_writable),
                    resolved: Some(path.display().to_string()),
                    is_available: true,
                    binary,
                },
                None => BinaryStatus {
                    binary,
                    resolved: None,
                    is_available: false,
                    is_world_writable_location: false,
                },
            }
        })
        .collect()
}

/// Binaries that could not be resolved.
pub fn missing_binaries(statuses: &[BinaryStatus]) -> Vec<&str> {
    statuses
        .iter()
        .filter(|s| !s.is_available)
        .map(|s| s.binary.as_str())
        .collect()
}

fn find_in_path(binary: &str, search: &[PathBuf]) -> Option<PathBuf> {
    if binary.contains('/') {
        let candidate = PathBuf::from(binary);
        return is_executable(&candidate).then_some(candidate);
    }
    search
        .iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(unix)]
fn is_world_writable(dir: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(dir).is_ok_and(|m| m.permissions().mode() & 0o002 != 0)
}

#[cfg(not(unix))]
fn is_world_writable(_dir: &Path) -> bool {
    false
}
