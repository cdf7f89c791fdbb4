//! Path handling for the resource tree.
//!
//! Every path that enters the kernel is normalized to absolute,
//! slash-separated, empty-segment-free form before any lookup:
//! `"devices//motor/"` becomes `"/devices/motor"` and `""` becomes `"/"`.
//! Relative components (`.` and `..`) and embedded NUL bytes are rejected
//! rather than resolved.

use safefs_types::KernelError;

/// The root of the tree.
pub const ROOT: &str = "/";

/// Normalize `path` or return [`KernelError::InvalidPath`].
pub fn normalize(path: &str) -> Result<String, KernelError> {
    if path.contains('\0') {
        return Err(KernelError::InvalidPath(path.escape_default().to_string()));
    }
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(KernelError::InvalidPath(path.to_string()));
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Split an already-normalized path into its segments. The root has none.
pub fn segments(normalized: &str) -> impl Iterator<Item = &str> {
    normalized.split('/').filter(|s| !s.is_empty())
}

/// `true` when `path` equals `prefix` or lies beneath it.
///
/// Matching is segment-wise: `/devices/motor` contains
/// `/devices/motor/cmd` but not `/devices/motorway`.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix == ROOT {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Parent of a normalized path; the root has none.
pub fn parent(normalized: &str) -> Option<&str> {
    if normalized == ROOT {
        return None;
    }
    match normalized.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&normalized[..idx]),
        None => None,
    }
}

/// Append `name` to a normalized directory path.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_redundant_slashes() {
        assert_eq!(normalize("devices//motor/").unwrap(), "/devices/motor");
        assert_eq!(normalize("/a/b/c").unwrap(), "/a/b/c");
        assert_eq!(normalize("///").unwrap(), "/");
        assert_eq!(normalize("").unwrap(), "/");
    }

    #[test]
    fn rejects_relative_segments() {
        assert!(matches!(normalize("/a/../b"), Err(KernelError::InvalidPath(_))));
        assert!(matches!(normalize("./a"), Err(KernelError::InvalidPath(_))));
        assert!(matches!(normalize("/a\0b"), Err(KernelError::InvalidPath(_))));
    }

    #[test]
    fn dotted_names_are_fine() {
        assert_eq!(normalize("/logs/.hidden").unwrap(), "/logs/.hidden");
        assert_eq!(normalize("/v1.2/...").unwrap(), "/v1.2/...");
    }

    #[test]
    fn within_is_segment_aware() {
        assert!(is_within("/devices/motor/cmd", "/devices/motor"));
        assert!(is_within("/devices/motor", "/devices/motor"));
        assert!(!is_within("/devices/motorway", "/devices/motor"));
        assert!(is_within("/anything", "/"));
        assert!(!is_within("/devices", "/devices/motor"));
    }

    #[test]
    fn parent_walks_up_to_root() {
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("/", "logs"), "/logs");
        assert_eq!(join("/logs", "access"), "/logs/access");
    }

    #[test]
    fn segments_of_root_is_empty() {
        assert_eq!(segments("/").count(), 0);
        assert_eq!(segments("/a/b").collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
