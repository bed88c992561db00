use crate::{Result, StoreError};

/// Validates and normalizes an absolute path.
///
/// Paths are '/'-separated and must be absolute. `.` and `..` segments
/// and empty segments are rejected; callers resolve those before handing
/// paths to the filesystem. Trailing slashes are stripped, except on the
/// root itself.
pub(crate) fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(StoreError::InvalidArgument(format!(
            "path {:?} is not absolute",
            path
        )));
    }
    if path == "/" {
        return Ok(path.to_owned());
    }

    let trimmed = path.trim_end_matches('/');
    for segment in trimmed[1..].split('/') {
        match segment {
            "" => {
                return Err(StoreError::InvalidArgument(format!(
                    "path {:?} has an empty segment",
                    path
                )));
            }
            "." | ".." => {
                return Err(StoreError::InvalidArgument(format!(
                    "path {:?} contains {:?}; resolve it before calling",
                    path, segment
                )));
            }
            _ => {}
        }
    }
    Ok(trimmed.to_owned())
}

/// Segments of a normalized path; empty for the root.
pub(crate) fn segments(path: &str) -> Vec<&str> {
    if path == "/" {
        Vec::new()
    } else {
        path[1..].split('/').collect()
    }
}

/// Splits a normalized non-root path into its parent path and final name.
pub(crate) fn split_parent(path: &str) -> (String, String) {
    let cut = path.rfind('/').expect("normalized paths contain '/'");
    let parent = if cut == 0 { "/" } else { &path[..cut] };
    (parent.to_owned(), path[cut + 1..].to_owned())
}

/// Joins a normalized base path and a child name.
pub(crate) fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Whether `candidate` equals `base` or lies inside it.
pub(crate) fn is_within(base: &str, candidate: &str) -> bool {
    candidate == base || candidate.starts_with(&join(base, ""))
}
