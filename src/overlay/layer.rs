//! Data-source abstraction over one layer directory.
//!
//! Lookup and readdir only ever use the read half ([`LayerStore`]); the
//! upper layer additionally exposes the mutating operations directly on
//! [`DirLayer`]. Keeping the read half behind a trait leaves a seam for
//! alternative layer backends without touching the lookup engine.

use std::ffi::{CString, OsStr, OsString};
use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Read-only operation set every layer supports.
pub(crate) trait LayerStore: Send + Sync {
    fn root(&self) -> &Path;

    /// lstat, so symlinks and whiteout devices stat as themselves.
    fn stat_at(&self, rel: &Path) -> io::Result<Metadata>;

    fn open_at(&self, rel: &Path, read: bool, write: bool) -> io::Result<File>;

    fn read_link_at(&self, rel: &Path) -> io::Result<PathBuf>;

    /// Directory entry names, unordered.
    fn read_dir(&self, rel: &Path) -> io::Result<Vec<OsString>>;

    fn list_xattr(&self, rel: &Path) -> io::Result<Vec<OsString>>;

    fn get_xattr(&self, rel: &Path, name: &OsStr) -> io::Result<Option<Vec<u8>>>;

    fn file_exists(&self, rel: &Path) -> bool;
}

/// A layer backed by a plain directory tree.
#[derive(Debug, Clone)]
pub(crate) struct DirLayer {
    root: PathBuf,
}

impl DirLayer {
    pub fn new(root: PathBuf) -> Self {
        DirLayer { root }
    }

    pub fn full_path(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    // --- mutating half, used against the upper layer only ---

    pub fn mkdir_at(&self, rel: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let path = self.full_path(rel);
        std::fs::create_dir(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))
    }

    pub fn unlink_at(&self, rel: &Path) -> io::Result<()> {
        std::fs::remove_file(self.full_path(rel))
    }

    pub fn rmdir_at(&self, rel: &Path) -> io::Result<()> {
        std::fs::remove_dir(self.full_path(rel))
    }

    pub fn rename_at(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(self.full_path(from), self.full_path(to))
    }

    /// renameat2(RENAME_EXCHANGE); atomically swaps the two entries.
    pub fn exchange_at(&self, from: &Path, to: &Path) -> io::Result<()> {
        exchange_paths(&self.full_path(from), &self.full_path(to))
    }

    pub fn link_at(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::hard_link(self.full_path(from), self.full_path(to))
    }

    pub fn symlink_at(&self, target: &Path, rel: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.full_path(rel))
    }
}

impl LayerStore for DirLayer {
    fn root(&self) -> &Path {
        &self.root
    }

    fn stat_at(&self, rel: &Path) -> io::Result<Metadata> {
        std::fs::symlink_metadata(self.full_path(rel))
    }

    fn open_at(&self, rel: &Path, read: bool, write: bool) -> io::Result<File> {
        OpenOptions::new()
            .read(read)
            .write(write)
            .custom_flags(libc::O_NOFOLLOW)
            .open(self.full_path(rel))
    }

    fn read_link_at(&self, rel: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(self.full_path(rel))
    }

    fn read_dir(&self, rel: &Path) -> io::Result<Vec<OsString>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.full_path(rel))? {
            names.push(entry?.file_name());
        }
        Ok(names)
    }

    fn list_xattr(&self, rel: &Path) -> io::Result<Vec<OsString>> {
        Ok(xattr::list(self.full_path(rel))?.collect())
    }

    fn get_xattr(&self, rel: &Path, name: &OsStr) -> io::Result<Option<Vec<u8>>> {
        xattr::get(self.full_path(rel), name)
    }

    fn file_exists(&self, rel: &Path) -> bool {
        std::fs::symlink_metadata(self.full_path(rel)).is_ok()
    }
}

/// renameat2 with RENAME_EXCHANGE over absolute paths.
pub(crate) fn exchange_paths(a: &Path, b: &Path) -> io::Result<()> {
    let a_c = CString::new(a.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let b_c = CString::new(b.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    // SAFETY: both CStrings outlive the call; AT_FDCWD with absolute paths.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            libc::AT_FDCWD,
            a_c.as_ptr(),
            libc::AT_FDCWD,
            b_c.as_ptr(),
            libc::RENAME_EXCHANGE,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// renameat2 with RENAME_WHITEOUT: move `a` to `b` and leave a whiteout
/// device at `a` in one atomic step.
pub(crate) fn rename_whiteout_paths(a: &Path, b: &Path) -> io::Result<()> {
    let a_c = CString::new(a.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let b_c = CString::new(b.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    // SAFETY: both CStrings outlive the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            libc::AT_FDCWD,
            a_c.as_ptr(),
            libc::AT_FDCWD,
            b_c.as_ptr(),
            libc::RENAME_WHITEOUT,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Copy atime/mtime from a stat result onto a path (no symlink follow).
pub(crate) fn copy_file_times(path: &Path, meta: &Metadata) -> io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let path_c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let times = [
        libc::timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        libc::timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    ];
    // SAFETY: path_c and times are valid for the duration of the call.
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            path_c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stat_and_read_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();

        let layer = DirLayer::new(dir.path().to_path_buf());
        assert!(layer.file_exists(Path::new("a")));
        assert!(!layer.file_exists(Path::new("b")));

        let meta = layer.stat_at(Path::new("a")).unwrap();
        assert_eq!(meta.len(), 1);

        let mut names = layer.read_dir(Path::new(".")).unwrap();
        names.sort();
        assert_eq!(names, vec![OsString::from("a"), OsString::from("d")]);
    }

    #[test]
    fn stat_does_not_follow_symlinks() {
        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink("missing-target", dir.path().join("link")).unwrap();

        let layer = DirLayer::new(dir.path().to_path_buf());
        let meta = layer.stat_at(Path::new("link")).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            layer.read_link_at(Path::new("link")).unwrap(),
            PathBuf::from("missing-target")
        );
    }

    #[test]
    fn copy_file_times_preserves_mtime() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, b"src").unwrap();
        std::fs::write(&dst, b"dst").unwrap();

        let meta = std::fs::metadata(&src).unwrap();
        copy_file_times(&dst, &meta).unwrap();

        use std::os::unix::fs::MetadataExt;
        let copied = std::fs::metadata(&dst).unwrap();
        assert_eq!(copied.mtime(), meta.mtime());
        assert_eq!(copied.mtime_nsec(), meta.mtime_nsec());
    }
}
