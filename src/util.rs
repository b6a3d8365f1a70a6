use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Files below this size are read into memory instead of being mapped.
const MMAP_THRESHOLD: u64 = 64 * 1024;

const DELETE_ATTEMPTS: u32 = 10;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Forward-slash relative path. Directories end with `/`.
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
}

/// Walk a directory tree and collect every file and directory below `root`.
///
/// Paths use forward slashes so they can be used verbatim as archive entry
/// names. Directory paths carry a trailing slash, which keeps `a/` distinct
/// from a file named `a` and makes parents sort before their children.
pub fn collect_relative_paths(root: &Path) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", root.display()))?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(root)
            .with_context(|| "Failed to compute relative path")?;

        let mut relative_str = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");

        let kind = if entry.file_type().is_dir() {
            relative_str.push('/');
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        entries.push(TreeEntry {
            relative_path: relative_str,
            kind,
            full_path,
        });
    }

    Ok(entries)
}

/// Resolve a relative patch path (possibly with a trailing `/`) under `root`.
pub fn resolve(root: &Path, relative: &str) -> PathBuf {
    root.join(relative.trim_end_matches('/'))
}

pub fn is_dir_path(relative: &str) -> bool {
    relative.ends_with('/')
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: We only read from this mapping; the installation is single-writer.
    unsafe {
        Mmap::map(&file).with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// File contents, either mapped or read into memory depending on size.
pub enum FileBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl std::ops::Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Owned(bytes) => bytes,
        }
    }
}

pub fn read_file_bytes(path: &Path) -> Result<FileBytes> {
    let len = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?
        .len();
    if len < MMAP_THRESHOLD {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;
        Ok(FileBytes::Owned(bytes))
    } else {
        Ok(FileBytes::Mapped(mmap_file(path)?))
    }
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Per-run scratch space: one lazily created temporary directory holding
/// extracted archives, backups and staging files.
///
/// Dropping the session removes the directory; [`TempSession::cleanup`] does
/// the same but reports failures.
#[derive(Default)]
pub struct TempSession {
    root: Option<TempDir>,
    counter: u32,
}

impl TempSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn root(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.root {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new()
            .prefix("updater.")
            .suffix(".tmp")
            .tempdir()
            .context("Failed to create temp directory")?;
        info!("created temp directory: {}", dir.path().display());
        let path = dir.path().to_path_buf();
        self.root = Some(dir);
        Ok(path)
    }

    fn next_name(&mut self, suffix: &str) -> Result<PathBuf> {
        let root = self.root()?;
        self.counter += 1;
        Ok(root.join(format!("temp.{}.{}", self.counter, suffix)))
    }

    /// Allocate a fresh, empty file inside the session directory.
    pub fn create_temp_file(&mut self) -> Result<PathBuf> {
        let path = self.next_name("tmp")?;
        fs::File::create(&path)
            .with_context(|| format!("Failed to create temp file: {}", path.display()))?;
        Ok(path)
    }

    /// Allocate a fresh, empty directory inside the session directory.
    pub fn create_temp_dir(&mut self) -> Result<PathBuf> {
        let path = self.next_name("dir")?;
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create temp directory: {}", path.display()))?;
        debug!("created temp directory: {}", path.display());
        Ok(path)
    }

    pub fn is_active(&self) -> bool {
        self.root.is_some()
    }

    pub fn cleanup(&mut self) -> Result<()> {
        if let Some(dir) = self.root.take() {
            delete(dir.path())?;
            info!("deleted temp directory: {}", dir.path().display());
        }
        Ok(())
    }
}

/// Delete a file or directory tree, retrying briefly on failure.
///
/// A missing path counts as deleted. Files held open by another process on
/// some platforms need a few attempts before they go away.
pub fn delete(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read metadata: {}", path.display()))
        }
    };

    if meta.is_dir() {
        for entry in fs::read_dir(path)
            .with_context(|| format!("Failed to list directory: {}", path.display()))?
        {
            let entry = entry
                .with_context(|| format!("Failed to read directory entry in {}", path.display()))?;
            delete(&entry.path())?;
        }
    }

    let mut last_error = None;
    for _ in 0..DELETE_ATTEMPTS {
        let result = if meta.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                last_error = Some(e);
                std::thread::sleep(DELETE_RETRY_DELAY);
            }
        }
    }

    match last_error {
        Some(e) => Err(e).with_context(|| format!("Cannot delete: {}", path.display())),
        None => bail!("Cannot delete: {}", path.display()),
    }
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let meta =
        fs::metadata(path).with_context(|| format!("Failed to read metadata: {}", path.display()))?;
    Ok(meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
pub fn is_executable(_path: &Path) -> Result<bool> {
    Ok(false)
}

/// Mark a file executable for everyone. A `false` flag leaves the mode as is.
#[cfg(unix)]
pub fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if !executable {
        return Ok(());
    }
    let mut perms = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?
        .permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms)
        .with_context(|| format!("Cannot set executable permissions for: {}", path.display()))
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

/// Copy a file or a directory tree, keeping the executable bit of files.
pub fn copy(from: &Path, to: &Path) -> Result<()> {
    debug!("copy {} -> {}", from.display(), to.display());
    if from.is_dir() {
        fs::create_dir_all(to)
            .with_context(|| format!("Failed to create directory: {}", to.display()))?;
        for entry in fs::read_dir(from)
            .with_context(|| format!("Cannot get directory's content: {}", from.display()))?
        {
            let entry = entry
                .with_context(|| format!("Failed to read directory entry in {}", from.display()))?;
            copy(&entry.path(), &to.join(entry.file_name()))?;
        }
        return Ok(());
    }

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    set_executable(to, is_executable(from)?)
}

/// Write `data` to `to`, creating parent directories as needed.
pub fn write_file(to: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(to, data).with_context(|| format!("Failed to write file: {}", to.display()))
}

/// Stream `from` into a new file at `to`.
pub fn copy_stream_to_file<R: Read + ?Sized>(from: &mut R, to: &Path) -> Result<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let file = fs::File::create(to)
        .with_context(|| format!("Failed to create file: {}", to.display()))?;
    let mut out = std::io::BufWriter::with_capacity(256 * 1024, file);
    let copied = std::io::copy(from, &mut out)
        .with_context(|| format!("Failed to write file: {}", to.display()))?;
    out.flush()
        .with_context(|| format!("Failed to flush file: {}", to.display()))?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_relative_paths_marks_directories() {
        let temp = tempfile::tempdir().unwrap();
        write_file(&temp.path().join("lib/core.jar"), b"jar").unwrap();
        write_file(&temp.path().join("readme.txt"), b"text").unwrap();
        fs::create_dir_all(temp.path().join("empty")).unwrap();

        let paths: Vec<String> = collect_relative_paths(temp.path())
            .unwrap()
            .into_iter()
            .map(|e| e.relative_path)
            .collect();

        assert_eq!(paths, vec!["empty/", "lib/", "lib/core.jar", "readme.txt"]);
    }

    #[test]
    fn test_delete_tree_and_missing_path() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("tree");
        write_file(&root.join("a/b/c.txt"), b"data").unwrap();

        delete(&root).unwrap();
        assert!(!root.exists());
        // Deleting again is not an error.
        delete(&root).unwrap();
    }

    #[test]
    fn test_temp_session_lazily_created_and_cleaned() {
        let mut session = TempSession::new();
        assert!(!session.is_active());

        let file = session.create_temp_file().unwrap();
        let dir = session.create_temp_dir().unwrap();
        assert!(file.is_file());
        assert!(dir.is_dir());
        assert_ne!(file, dir);

        session.cleanup().unwrap();
        assert!(!session.is_active());
        assert!(!file.exists());
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_keeps_executable_bit() {
        let temp = tempfile::tempdir().unwrap();
        let from = temp.path().join("run.sh");
        let to = temp.path().join("out/run.sh");
        write_file(&from, b"#!/bin/sh\n").unwrap();
        set_executable(&from, true).unwrap();

        copy(&from, &to).unwrap();

        assert!(is_executable(&to).unwrap());
        assert_eq!(fs::read(&to).unwrap(), b"#!/bin/sh\n");
    }

    #[test]
    fn test_resolve_strips_directory_marker() {
        let root = Path::new("/install");
        assert_eq!(resolve(root, "lib/"), PathBuf::from("/install/lib"));
        assert!(is_dir_path("lib/"));
        assert!(!is_dir_path("lib/a.jar"));
    }
}
