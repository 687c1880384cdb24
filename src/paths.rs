//! Lexical path sandboxing.
//!
//! Nothing here touches the filesystem: paths are normalized component by
//! component, so a destination that does not exist yet is validated the same
//! way as one that does.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Resolve `relative` under `root`, rejecting absolute, empty and escaping paths.
///
/// `.` segments are dropped and `..` pops the previous segment; popping past
/// the root is an error even if later segments would come back inside
/// (`a/../../root/x` is rejected).
pub fn resolve(root: &Path, relative: impl AsRef<Path>) -> Result<PathBuf> {
    let relative = relative.as_ref();
    if relative.as_os_str().is_empty() {
        return Err(Error::invalid_path(relative, "path is empty"));
    }

    let mut segments: Vec<&std::ffi::OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => segments.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if segments.pop().is_none() {
                    return Err(Error::invalid_path(relative, "path escapes its root"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::invalid_path(relative, "absolute paths are not allowed"));
            }
        }
    }

    if segments.is_empty() {
        return Err(Error::invalid_path(relative, "path does not name anything below its root"));
    }

    let mut resolved = root.to_path_buf();
    resolved.extend(segments);
    Ok(resolved)
}

/// Resolve a host-side endpoint: absolute paths are taken as given, relative
/// ones are sandboxed under `root`.
pub fn host_path(root: &Path, path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        resolve(root, path)
    }
}

/// Pick a root directory by precedence: per-call override, CLI argument,
/// specific environment variable, generic environment variable, then `cwd`.
/// Empty strings count as unset.
pub fn select_root(
    per_call: Option<&str>,
    cli: Option<&str>,
    specific_env: Option<&str>,
    fallback_env: Option<&str>,
    cwd: &Path,
) -> PathBuf {
    [per_call, cli, specific_env, fallback_env]
        .into_iter()
        .flatten()
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| cwd.to_path_buf())
}
