//! Node path helpers

use crate::error::CoordError;

/// The root of the store's namespace.
pub const ROOT: &str = "/";

/// Check that `path` is a well-formed absolute node path.
pub fn validate(path: &str) -> Result<(), CoordError> {
    if path.is_empty() {
        return Err(CoordError::invalid_path(path, "path must not be empty"));
    }
    if !path.starts_with('/') {
        return Err(CoordError::invalid_path(path, "path must be absolute"));
    }
    if path == ROOT {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(CoordError::invalid_path(path, "path must not end with '/'"));
    }
    if path.contains('\0') {
        return Err(CoordError::invalid_path(path, "path contains a null character"));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(CoordError::invalid_path(path, "empty path segment")),
            "." | ".." => return Err(CoordError::invalid_path(path, "relative path segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Parent of `path`, or `None` when `path` sits directly under the root
/// (or is the root itself).
pub fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// Last segment of `path`.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a child name onto a parent path.
pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{child}")
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}
