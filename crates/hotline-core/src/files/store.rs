//! Filesystem abstraction used by the transaction handlers.
//!
//! Handlers only stat, list and rearrange the tree; bulk data moves
//! over the transfer side channel. Keeping these operations behind a
//! trait lets tests run against scratch directories and keeps every
//! mutation of the served tree in one place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Metadata for a single file or directory.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// True for directories.
    pub is_dir: bool,
    /// Size in bytes; 0 for directories.
    pub len: u64,
    /// Last modification time.
    pub modified: Option<SystemTime>,
    /// Creation time where the platform records one.
    pub created: Option<SystemTime>,
}

/// One directory entry, with symlinks already resolved.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    /// File name within its directory.
    pub name: String,
    /// Metadata of the target (for symlinks, the resolved target).
    pub info: FileInfo,
    /// Number of entries, for directories.
    pub entry_count: u32,
}

/// Operations the handlers perform against the served tree.
pub trait FileStore: Send + Sync {
    /// Create a directory (permissions 0777 before umask).
    fn mkdir(&self, path: &Path) -> io::Result<()>;
    /// Stat a path.
    fn stat(&self, path: &Path) -> io::Result<FileInfo>;
    /// List a directory, resolving symlinks; dangling links are skipped.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>>;
    /// Create a symlink at `new` pointing to `original`.
    fn symlink(&self, original: &Path, new: &Path) -> io::Result<()>;
    /// Remove a file or an empty directory.
    fn remove(&self, path: &Path) -> io::Result<()>;
    /// Remove a directory and its contents.
    fn remove_all(&self, path: &Path) -> io::Result<()>;
    /// Rename/move within the tree.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Write a whole file.
    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;
}

/// The production [`FileStore`] over the host filesystem.
pub struct OsFileStore;

fn to_file_info(md: &fs::Metadata) -> FileInfo {
    FileInfo {
        is_dir: md.is_dir(),
        len: if md.is_dir() { 0 } else { md.len() },
        modified: md.modified().ok(),
        created: md.created().ok(),
    }
}

impl FileStore for OsFileStore {
    fn mkdir(&self, path: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new().mode(0o777).create(path)
        }
        #[cfg(not(unix))]
        {
            fs::create_dir(path)
        }
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        fs::metadata(path).map(|md| to_file_info(&md))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let entry_path = entry.path();
            // metadata() follows symlinks; a dangling link stats as
            // missing and is dropped from the listing.
            let md = match fs::metadata(&entry_path) {
                Ok(md) => md,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let entry_count = if md.is_dir() {
                fs::read_dir(&entry_path)?.count() as u32
            } else {
                0
            };
            entries.push(DirEntryInfo { name, info: to_file_info(&md), entry_count });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn symlink(&self, original: &Path, new: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(original, new)
        }
        #[cfg(not(unix))]
        {
            let _ = (original, new);
            Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks unsupported"))
        }
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if fs::metadata(path)?.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        if fs::metadata(path)?.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }
}

/// Walk a directory tree, returning (relative path, info) pairs in
/// sorted order, directories before their contents. The root itself is
/// not included.
pub fn walk_tree(store: &dyn FileStore, root: &Path) -> io::Result<Vec<(PathBuf, FileInfo)>> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let abs = root.join(&rel);
        for entry in store.read_dir(&abs)? {
            let child = rel.join(&entry.name);
            if entry.info.is_dir {
                stack.push(child.clone());
            }
            out.push((child, entry.info));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mkdir_stat_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OsFileStore;

        store.mkdir(&dir.path().join("sub")).expect("mkdir");
        store.write_file(&dir.path().join("a.txt"), b"hello").expect("write");

        let info = store.stat(&dir.path().join("a.txt")).expect("stat");
        assert!(!info.is_dir);
        assert_eq!(info.len, 5);

        let listing = store.read_dir(dir.path()).expect("read_dir");
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert!(listing[1].info.is_dir);
    }

    #[test]
    fn test_walk_tree_ordering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OsFileStore;
        store.mkdir(&dir.path().join("b")).expect("mkdir");
        store.write_file(&dir.path().join("b/inner.txt"), b"x").expect("write");
        store.write_file(&dir.path().join("a.txt"), b"y").expect("write");

        let walked = walk_tree(&store, dir.path()).expect("walk");
        let rels: Vec<_> = walked.iter().map(|(p, _)| p.to_string_lossy().into_owned()).collect();
        assert_eq!(rels, vec!["a.txt", "b", "b/inner.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OsFileStore;
        store
            .symlink(&dir.path().join("missing"), &dir.path().join("link"))
            .expect("symlink");
        let listing = store.read_dir(dir.path()).expect("read_dir");
        assert!(listing.is_empty());
    }
}
