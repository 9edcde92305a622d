//! Path safety: canonicalization against an explicit allow-list
//! (spec.md §4.7.6, §9 Open Question).

use std::path::{Path, PathBuf};

use crate::error::CoreError;

/// Canonicalize `requested` (joined under `root_hint` if relative) and
/// verify it falls within one of `allowed_roots`. Returns the
/// canonicalized path on success.
///
/// # Errors
///
/// Returns [`CoreError::PathInvalid`] if the path cannot be
/// canonicalized (e.g. contains no existing parent to resolve against),
/// and [`CoreError::PathForbidden`] if it canonicalizes outside every
/// allow-listed root.
pub fn resolve(
    requested: &Path,
    allowed_roots: &[PathBuf],
) -> Result<PathBuf, CoreError> {
    if allowed_roots.is_empty() {
        return Err(CoreError::PathForbidden);
    }

    let canonical_roots: Vec<PathBuf> = allowed_roots
        .iter()
        .filter_map(|r| dunce_canonicalize(r).ok())
        .collect();

    let candidate = canonicalize_best_effort(requested)
        .map_err(|e| CoreError::PathInvalid(e.to_string()))?;

    if canonical_roots.iter().any(|root| candidate.starts_with(root)) {
        Ok(candidate)
    } else {
        Err(CoreError::PathForbidden)
    }
}

/// Canonicalize a path that may not exist yet (e.g. an upload
/// destination) by canonicalizing its deepest existing ancestor and
/// rejoining the remaining components, rather than requiring the whole
/// path to already exist.
fn canonicalize_best_effort(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(canon) = std::fs::canonicalize(path) {
        return Ok(canon);
    }
    let mut existing = path;
    let mut remainder = Vec::new();
    loop {
        match existing.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                if let Some(name) = existing.file_name() {
                    remainder.push(name.to_owned());
                }
                existing = parent;
                if existing.exists() {
                    break;
                }
            },
            _ => break,
        }
    }
    let mut canon = std::fs::canonicalize(existing)?;
    for component in remainder.into_iter().rev() {
        canon.push(component);
    }
    Ok(canon)
}

fn dunce_canonicalize(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::canonicalize(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_path_within_allowed_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let roots = vec![dir.path().to_path_buf()];
        let target = dir.path().join("file.txt");
        let resolved = resolve(&target, &roots).expect("resolve");
        assert!(resolved.starts_with(dir.path().canonicalize().expect("canon")));
    }

    #[test]
    fn rejects_escape_via_parent_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sub = dir.path().join("sandbox");
        std::fs::create_dir_all(&sub).expect("mkdir");
        let roots = vec![sub.clone()];
        let escape = sub.join("..").join("outside.txt");
        let result = resolve(&escape, &roots);
        assert!(matches!(result, Err(CoreError::PathForbidden)));
    }

    #[test]
    fn rejects_when_no_roots_configured() {
        let result = resolve(Path::new("/tmp/anything"), &[]);
        assert!(matches!(result, Err(CoreError::PathForbidden)));
    }
}
