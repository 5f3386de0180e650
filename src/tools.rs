//! Resolution of the external executables a run depends on.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::error::MissingToolsError;

/// Resolve `name` against the current `PATH`.
pub fn resolve_program(name: &str) -> Option<PathBuf> {
    resolve_program_in(name, env::var_os("PATH").as_deref())
}

/// Resolve `name` against an explicit search path.
///
/// Names containing a path separator are checked as given and never searched.
pub fn resolve_program_in(name: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    let as_path = Path::new(name);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        return is_executable(as_path).then(|| as_path.to_path_buf());
    }

    let search_path = search_path?;
    env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| candidates(&dir, name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(windows)]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name), dir.join(format!("{}.exe", name))]
}

#[cfg(not(windows))]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name)]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Verify every tool in `names` is available.
///
/// Returns the resolved paths in input order (duplicates collapsed), or a
/// single error naming every tool that could not be found.
pub fn check_tools<S: AsRef<str>>(names: &[S]) -> Result<Vec<PathBuf>, MissingToolsError> {
    let mut seen: Vec<&str> = Vec::new();
    let mut resolved = Vec::new();
    let mut missing = Vec::new();

    for name in names.iter().map(AsRef::as_ref) {
        if seen.contains(&name) {
            continue;
        }
        seen.push(name);

        match resolve_program(name) {
            Some(path) => {
                debug!("Found {} at {:?}", name, path);
                resolved.push(path);
            }
            None => {
                error!("Required tool not found: {}", name);
                missing.push(name.to_string());
            }
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(MissingToolsError { missing })
    }
}
