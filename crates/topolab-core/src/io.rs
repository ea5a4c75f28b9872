use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `data` to `path` through a tempfile in the same directory, so
/// `instance.yaml`, rendered configs and files delivered by the local
/// transport are either the old content or the new, never a torn mix.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// [`atomic_write`] then chmod; used for delivered data and SSH keys.
/// `mode` is ignored off unix.
pub fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    atomic_write(path, data)?;
    set_mode(path, mode)
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// `mkdir -p` for build and key directories under the lab dir.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Remove a file if it exists. Returns true if something was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Recursively copy the contents of `src` into `dst`, overwriting files that
/// already exist. Permissions are carried over by `std::fs::copy`.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<u64> {
    ensure_dir(dst)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_dir(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Make `dst` an exact copy of `src`: [`copy_dir`], then delete whatever
/// `dst` holds that `src` does not. The local counterpart of
/// `rsync -a --delete`.
pub fn mirror_dir(src: &Path, dst: &Path) -> Result<u64> {
    let copied = copy_dir(src, dst)?;
    prune_extra(src, dst)?;
    Ok(copied)
}

fn prune_extra(src: &Path, dst: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dst)? {
        let entry = entry?;
        let target = entry.path();
        let counterpart = src.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            if counterpart.is_dir() {
                prune_extra(&counterpart, &target)?;
            } else {
                std::fs::remove_dir_all(&target)?;
            }
        } else if !counterpart.is_file() {
            std::fs::remove_file(&target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/instance.yaml");
        atomic_write(&path, b"data").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "data");
    }

    #[cfg(unix)]
    #[test]
    fn write_with_mode_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");
        write_with_mode(&path, b"secret", 0o600).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn remove_if_exists_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.txt");
        std::fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn copy_dir_copies_nested_files() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("bin")).unwrap();
        std::fs::write(src.path().join("bin/ziti"), b"elf").unwrap();
        std::fs::write(src.path().join("README"), b"hi").unwrap();

        let n = copy_dir(src.path(), &dst.path().join("out")).unwrap();
        assert_eq!(n, 2);
        assert!(dst.path().join("out/bin/ziti").exists());
        assert!(dst.path().join("out/README").exists());
    }

    #[test]
    fn mirror_dir_drops_stale_entries() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("bin")).unwrap();
        std::fs::write(src.path().join("bin/ziti"), b"elf").unwrap();
        std::fs::create_dir_all(dst.path().join("bin")).unwrap();
        std::fs::create_dir_all(dst.path().join("cfg/old")).unwrap();
        std::fs::write(dst.path().join("bin/ziti-old"), b"stale").unwrap();
        std::fs::write(dst.path().join("cfg/old/ctrl9.yml"), b"stale").unwrap();

        mirror_dir(src.path(), dst.path()).unwrap();
        assert!(dst.path().join("bin/ziti").exists());
        assert!(!dst.path().join("bin/ziti-old").exists());
        assert!(!dst.path().join("cfg").exists());
    }
}
