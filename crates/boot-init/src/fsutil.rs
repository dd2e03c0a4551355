use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Creates `path` (and missing parents) and leaves it with exactly `mode`.
pub fn prepare_dir(path: &Path, mode: u32) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(mode).create(path)?;
    fs::set_permissions(path, Permissions::from_mode(mode))
}

/// Writes `contents` to `path`, truncating it, and leaves it with exactly `mode`.
pub fn write_artifact(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents)?;
    file.set_permissions(Permissions::from_mode(mode))
}

/// Creates `path` if missing, without touching existing contents.
pub fn touch(path: &Path, mode: u32) -> io::Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(mode)
        .open(path)?;
    file.set_permissions(Permissions::from_mode(mode))
}

pub fn copy_file(from: &Path, to: &Path) -> io::Result<u64> {
    fs::copy(from, to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Kind of the node at `path`, following symlinks. Anything that is not a
/// directory counts as a file.
pub fn node_kind(path: &Path) -> io::Result<NodeKind> {
    let meta = fs::metadata(path)?;
    Ok(if meta.is_dir() {
        NodeKind::Directory
    } else {
        NodeKind::File
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn prepare_dir_creates_parents_and_fixes_mode() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");

        prepare_dir(&nested, 0o700).unwrap();
        assert_eq!(mode_of(&nested), 0o700);

        prepare_dir(&nested, 0o755).unwrap();
        assert_eq!(mode_of(&nested), 0o755);
    }

    #[test]
    fn write_artifact_truncates_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.rc");
        fs::write(&path, "old contents that are longer").unwrap();

        write_artifact(&path, b"new", 0o650).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(mode_of(&path), 0o650);
    }

    #[test]
    fn touch_keeps_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marker");
        fs::write(&path, "keep").unwrap();

        touch(&path, 0o444).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep");
        assert_eq!(mode_of(&path), 0o444);
    }

    #[test]
    fn node_kind_distinguishes_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "").unwrap();

        assert_eq!(node_kind(dir.path()).unwrap(), NodeKind::Directory);
        assert_eq!(node_kind(&file).unwrap(), NodeKind::File);
        assert!(node_kind(&dir.path().join("missing")).is_err());
    }
}
