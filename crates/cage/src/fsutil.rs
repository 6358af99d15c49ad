//! Filesystem helpers for volume seeding.

use std::path::Path;

use walkdir::WalkDir;

/// Recursively copy the contents of `src` into `dst`. Blocking; run it on a
/// blocking thread from async contexts.
pub fn seed_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Make `path`'s owner (uid/gid) match `reference`'s current owner, so
/// dataset contents inherit container-visible ownership.
#[cfg(unix)]
pub fn chown_to_match(path: &Path, reference: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(reference)?;
    std::os::unix::fs::chown(path, Some(meta.uid()), Some(meta.gid()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_dir_copies_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("top.txt"), b"top").unwrap();
        std::fs::write(src.join("nested/inner.txt"), b"inner").unwrap();

        seed_dir(&src, &dst).unwrap();

        assert_eq!(std::fs::read(dst.join("top.txt")).unwrap(), b"top");
        assert_eq!(std::fs::read(dst.join("nested/inner.txt")).unwrap(), b"inner");
    }

    #[test]
    fn test_seed_dir_empty_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();

        seed_dir(&src, &dst).unwrap();
        assert!(dst.is_dir());
        assert_eq!(std::fs::read_dir(&dst).unwrap().count(), 0);
    }

    #[test]
    fn test_chown_to_match_same_owner_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        // Both created by us; syncing ownership must succeed unprivileged.
        chown_to_match(&a, &b).unwrap();
    }
}
