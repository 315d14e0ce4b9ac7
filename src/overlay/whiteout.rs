//! Whiteout and opaque-directory markers.
//!
//! A whiteout hides a lower-layer name from the merged view. Two on-disk
//! encodings exist: the preferred one is a character device with device
//! number 0:0 at `parent/name`; when the process may not mknod, an empty
//! regular file `parent/.wh.name` is used instead. An opaque marker on an
//! upper-layer directory stops the merge from descending into same-named
//! lower directories; it is an xattr when xattrs are available and a
//! `.wh..wh..opq` sentinel file otherwise.

use std::ffi::{OsStr, OsString};
use std::fs::{File, Metadata};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

use nix::sys::stat::{makedev, mknod, Mode, SFlag};

/// Prefix of the fallback whiteout encoding.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Sentinel file marking a directory opaque when xattrs are unavailable.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

pub const OPAQUE_XATTR: &str = "user.fuseoverlayfs.opaque";
pub const PRIVILEGED_OPAQUE_XATTR: &str = "trusted.overlay.opaque";
pub const ORIGIN_XATTR: &str = "user.fuseoverlayfs.origin";

/// Whiteout encoding and detection. All whiteout handling goes through
/// this type so the two encodings stay interchangeable.
pub struct Whiteout;

impl Whiteout {
    /// `.wh.<name>` for a given name.
    pub fn marker_name(name: &OsStr) -> OsString {
        let mut marker = OsString::from(WHITEOUT_PREFIX);
        marker.push(name);
        marker
    }

    pub fn is_marker_name(name: &OsStr) -> bool {
        name.as_bytes().starts_with(WHITEOUT_PREFIX.as_bytes())
    }

    /// `foo` from `.wh.foo`, or None when the name is not a marker.
    pub fn extract_target(marker: &OsStr) -> Option<OsString> {
        let bytes = marker.as_bytes();
        let prefix = WHITEOUT_PREFIX.as_bytes();
        if bytes.starts_with(prefix) {
            Some(OsString::from(OsStr::from_bytes(&bytes[prefix.len()..])))
        } else {
            None
        }
    }

    /// True when a stat result is the character-device whiteout encoding.
    pub fn is_whiteout_device(meta: &Metadata) -> bool {
        meta.file_type().is_char_device() && meta.rdev() == 0
    }

    /// True when either encoding covers `name` inside `dir`.
    pub fn covers(dir: &Path, name: &OsStr) -> bool {
        if let Ok(meta) = std::fs::symlink_metadata(dir.join(name)) {
            if Self::is_whiteout_device(&meta) {
                return true;
            }
        }
        dir.join(Self::marker_name(name)).exists()
    }

    /// Create a whiteout for `name` inside `dir`.
    ///
    /// Prefers the device encoding; falls back to the `.wh.` file when
    /// mknod is unavailable (latched `can_mknod` or EPERM/ENOTSUP at the
    /// call). EEXIST over an existing whiteout succeeds idempotently.
    pub fn create(dir: &Path, name: &OsStr, can_mknod: bool) -> io::Result<()> {
        let dev_path = dir.join(name);

        if can_mknod {
            match mknod(
                &dev_path,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o700),
                makedev(0, 0),
            ) {
                Ok(()) => return Ok(()),
                Err(nix::errno::Errno::EEXIST) => {
                    if let Ok(meta) = std::fs::symlink_metadata(&dev_path) {
                        if Self::is_whiteout_device(&meta) {
                            return Ok(());
                        }
                    }
                    return Err(io::Error::from_raw_os_error(libc::EEXIST));
                }
                Err(nix::errno::Errno::EPERM) | Err(nix::errno::Errno::ENOTSUP) => {}
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }

        let marker = dir.join(Self::marker_name(name));
        match File::create(&marker) {
            Ok(f) => {
                let _ = f.set_permissions(std::fs::Permissions::from_mode(0o700));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove both possible encodings. A missing marker is not an error.
    pub fn delete(dir: &Path, name: &OsStr) -> io::Result<()> {
        let dev_path = dir.join(name);
        if let Ok(meta) = std::fs::symlink_metadata(&dev_path) {
            if Self::is_whiteout_device(&meta) {
                match std::fs::remove_file(&dev_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        match std::fs::remove_file(dir.join(Self::marker_name(name))) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Probe whether this process can create whiteout device nodes, using a
/// scratch name in the workdir. Called once at startup; the result is
/// latched into the settings. Only EPERM disables the device encoding;
/// any other failure (say a leftover probe entry) leaves it on and the
/// per-call fallback handles the rest.
pub fn probe_can_mknod(workdir: &Path, scratch_name: &str) -> bool {
    let path = workdir.join(scratch_name);
    match mknod(
        &path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o700),
        makedev(0, 0),
    ) {
        Ok(()) => {
            let _ = std::fs::remove_file(&path);
            true
        }
        Err(nix::errno::Errno::EPERM) => false,
        Err(_) => true,
    }
}

/// True when an upper-layer directory is opaque: any of the two xattr
/// spellings with value "y", or the sentinel file inside it.
pub fn is_opaque(dir: &Path) -> bool {
    for name in [PRIVILEGED_OPAQUE_XATTR, OPAQUE_XATTR] {
        if let Ok(Some(value)) = xattr::get(dir, name) {
            if value.first() == Some(&b'y') {
                return true;
            }
        }
    }
    dir.join(OPAQUE_WHITEOUT).exists()
}

/// Mark an upper-layer directory opaque, walking the encoding ladder:
/// privileged xattr, unprivileged xattr, sentinel file.
pub fn set_opaque(dir: &Path) -> io::Result<()> {
    if xattr::set(dir, PRIVILEGED_OPAQUE_XATTR, b"y").is_ok() {
        return Ok(());
    }
    if xattr::set(dir, OPAQUE_XATTR, b"y").is_ok() {
        return Ok(());
    }
    File::create(dir.join(OPAQUE_WHITEOUT)).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marker_name_roundtrip() {
        let marker = Whiteout::marker_name(OsStr::new("data.bin"));
        assert_eq!(marker, OsString::from(".wh.data.bin"));
        assert_eq!(
            Whiteout::extract_target(&marker),
            Some(OsString::from("data.bin"))
        );
        assert_eq!(Whiteout::extract_target(OsStr::new("data.bin")), None);
        assert!(Whiteout::is_marker_name(&marker));
        assert!(!Whiteout::is_marker_name(OsStr::new("wh.data.bin")));
    }

    #[test]
    fn fallback_marker_covers_name() {
        let dir = tempdir().unwrap();
        let name = OsStr::new("gone.txt");
        assert!(!Whiteout::covers(dir.path(), name));

        Whiteout::create(dir.path(), name, false).unwrap();
        assert!(dir.path().join(".wh.gone.txt").exists());
        assert!(Whiteout::covers(dir.path(), name));

        Whiteout::delete(dir.path(), name).unwrap();
        assert!(!Whiteout::covers(dir.path(), name));
    }

    #[test]
    fn delete_missing_whiteout_is_ok() {
        let dir = tempdir().unwrap();
        Whiteout::delete(dir.path(), OsStr::new("never-there")).unwrap();
    }

    #[test]
    fn create_is_idempotent_over_fallback_marker() {
        let dir = tempdir().unwrap();
        let name = OsStr::new("twice");
        Whiteout::create(dir.path(), name, false).unwrap();
        Whiteout::create(dir.path(), name, false).unwrap();
        assert!(Whiteout::covers(dir.path(), name));
    }

    #[test]
    fn opaque_sentinel_file_detected() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("d");
        std::fs::create_dir(&sub).unwrap();
        assert!(!is_opaque(&sub));
        File::create(sub.join(OPAQUE_WHITEOUT)).unwrap();
        assert!(is_opaque(&sub));
    }
}
