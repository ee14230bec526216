//! Repository-relative path normalization.
//!
//! Every path that enters the policy core goes through [`normalize_repo_path`]
//! so that matching, classification and diff comparison all see one spelling.

/// Forward slashes, no leading `./` or `/`, no empty or `.` segments.
/// Case is preserved and `..` is left untouched.
pub fn normalize_repo_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    unified
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalized directory prefix with a trailing `/`, or `""` for the root.
pub fn normalize_dir_prefix(prefix: &str) -> String {
    let p = normalize_repo_path(prefix);
    if p.is_empty() { p } else { format!("{p}/") }
}

/// True when `path` is `dir` itself or lies below it. An empty `dir` is the root.
pub fn is_under(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        return true;
    }
    path == dir
        || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/')
}

pub fn parent_dir(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx])
}

/// Ancestor directories of a file path, outermost first
/// (`a/b/c.txt` → `["a", "a/b"]`).
pub fn ancestor_dirs(path: &str) -> Vec<String> {
    let Some(parent) = parent_dir(path) else {
        return Vec::new();
    };
    let segments: Vec<&str> = parent.split('/').collect();
    (1..=segments.len())
        .map(|k| segments[..k].join("/"))
        .collect()
}

/// Rejects absolute paths and any `..` segment. Used for pointer-supplied
/// pack locations that must stay inside the intents root.
pub fn is_contained_relative(path: &str) -> bool {
    let unified = path.trim().replace('\\', "/");
    if unified.starts_with('/') || unified.contains(':') {
        return false;
    }
    !unified.split('/').any(|seg| seg == "..")
}
