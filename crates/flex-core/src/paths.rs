//! Runtime directory resolution.

use std::env;
use std::path::{Path, PathBuf};

/// Environment variable overriding the runtime directory.
pub const FLEX_DIR_ENV: &str = "FLEX_DIR";

/// Runtime directory used when `FLEX_DIR` is unset or empty.
pub const DEFAULT_FLEX_DIR: &str = "/var/lib/flex";

/// Returns the runtime directory: `$FLEX_DIR`, or `/var/lib/flex`.
pub fn flex_dir() -> PathBuf {
    match env::var_os(FLEX_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_FLEX_DIR),
    }
}

/// Joins `parts` onto the runtime directory.
///
/// ```
/// let socket = flex_core::var_path(["unix.socket"]);
/// assert!(socket.ends_with("unix.socket"));
/// ```
pub fn var_path<I, P>(parts: I) -> PathBuf
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    parts
        .into_iter()
        .fold(flex_dir(), |path, part| path.join(part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_path_joins_parts() {
        let path = var_path(["containers", "c1.conf"]);
        assert!(path.ends_with("containers/c1.conf"));
        assert!(path.starts_with(flex_dir()));
    }

    #[test]
    fn test_var_path_without_parts_is_flex_dir() {
        let empty: [&str; 0] = [];
        assert_eq!(var_path(empty), flex_dir());
    }
}
