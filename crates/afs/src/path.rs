//! Path normalization helpers.
//!
//! Every path in the file system is `/`-separated. Normalization drops empty
//! and `.` segments, so `//docs/./a/` and `/docs/a` are the same path.

use crate::error::{AfsError, Result};

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

/// Normalize a path into absolute form (`/a/b`, root is `/`).
pub fn normalize(path: &str) -> String {
    from_segments(&segments(path))
}

/// Build an absolute path from segments.
pub fn from_segments<S: AsRef<str>>(parts: &[S]) -> String {
    let mut out = String::from("/");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(part.as_ref());
    }
    out
}

/// Reject paths that try to escape their root.
pub fn validate(path: &str) -> Result<()> {
    if segments(path).contains(&"..") {
        return Err(AfsError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Whether `prefix` is a segment-wise prefix of `of`.
pub fn is_prefix<A: AsRef<str>, B: AsRef<str>>(prefix: &[A], of: &[B]) -> bool {
    prefix.len() <= of.len()
        && prefix
            .iter()
            .zip(of.iter())
            .all(|(a, b)| a.as_ref() == b.as_ref())
}

/// Join a mount path and a module-relative path.
pub fn join(mount: &str, relative: &str) -> String {
    let mut parts = segments(mount);
    parts.extend(segments(relative));
    from_segments(&parts)
}

/// Number of segments in `path` below `base`, if `path` is inside `base`.
pub fn depth_below(base: &str, path: &str) -> Option<usize> {
    let base = segments(base);
    let path = segments(path);
    is_prefix(&base, &path).then(|| path.len() - base.len())
}

/// Parent of a normalized path (`None` for root).
pub fn parent(path: &str) -> Option<String> {
    let parts = segments(path);
    if parts.is_empty() {
        return None;
    }
    Some(from_segments(&parts[..parts.len() - 1]))
}

/// Last segment of a path (empty for root).
pub fn file_name(path: &str) -> &str {
    segments(path).last().copied().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("docs"), "/docs");
        assert_eq!(normalize("//docs/./guide//"), "/docs/guide");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "/a"), "/a");
        assert_eq!(join("/docs", "/"), "/docs");
        assert_eq!(join("/docs", "/a/b.md"), "/docs/a/b.md");
        assert_eq!(join("/modules/docs/", "a"), "/modules/docs/a");
    }

    #[test]
    fn test_is_prefix() {
        assert!(is_prefix(&segments("/"), &segments("/a/b")));
        assert!(is_prefix(&segments("/a"), &segments("/a/b")));
        assert!(is_prefix(&segments("/a/b"), &segments("/a/b")));
        assert!(!is_prefix(&segments("/a/b"), &segments("/a")));
        // Segment-wise, not string-wise
        assert!(!is_prefix(&segments("/doc"), &segments("/docs/a")));
    }

    #[test]
    fn test_depth_below() {
        assert_eq!(depth_below("/", "/a/b"), Some(2));
        assert_eq!(depth_below("/a", "/a"), Some(0));
        assert_eq!(depth_below("/a", "/b/c"), None);
    }

    #[test]
    fn test_validate_rejects_parent_segments() {
        assert!(validate("/a/../b").is_err());
        assert!(validate("/a/b").is_ok());
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent("/a/b").as_deref(), Some("/a"));
        assert_eq!(parent("/a").as_deref(), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(file_name("/a/b.md"), "b.md");
        assert_eq!(file_name("/"), "");
    }
}
