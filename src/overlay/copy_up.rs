//! Copy-up: promoting an entry from a lower layer to the upper layer.
//!
//! Regular files are staged in the workdir under a monotonic counter
//! name, their content encoded block-by-block through the cipher engine,
//! metadata and user xattrs carried over, then renamed into place so the
//! promotion is atomic. Directories use a staging ladder of their own;
//! symlinks are recreated directly.

use std::ffi::OsStr;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use crate::config::XattrPermissions;
use crate::overlay::convert::io_error_to_libc;
use crate::overlay::crypto::NodeCipher;
use crate::overlay::idmap;
use crate::overlay::layer::{copy_file_times, exchange_paths, LayerStore};
use crate::overlay::types::Node;
use crate::overlay::whiteout::{self, Whiteout, ORIGIN_XATTR};
use crate::overlay::VeilFs;

/// Xattr namespaces owned by the overlay itself; never copied through
/// and never exposed to clients.
const RESERVED_XATTR_PREFIXES: [&str; 2] = ["user.fuseoverlayfs.", "trusted.overlay."];

pub(crate) fn is_reserved_xattr(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    RESERVED_XATTR_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// What a new upper-layer directory should carry.
pub(crate) struct DirSpec<'a> {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Source layer and stat to copy times and xattrs from (copy-up);
    /// None for a fresh mkdir.
    pub src: Option<(usize, &'a Metadata)>,
    pub opaque: bool,
}

impl VeilFs {
    /// Next staging name in the workdir: a bare decimal counter.
    pub(crate) fn next_staging_path(&self) -> Option<PathBuf> {
        let work = self.workdir.as_ref()?;
        let n = self.wd_counter.fetch_add(1, Ordering::Relaxed);
        Some(work.join(n.to_string()))
    }

    /// Promote a node to the upper layer. No-op when it is already
    /// there; EROFS when the stack has no upper layer.
    pub(crate) fn copy_up(&self, ino: u64) -> Result<(), i32> {
        let upper = match self.upper_index() {
            Some(idx) => idx,
            None => return Err(libc::EROFS),
        };

        let node = {
            let nodes = self.nodes.read();
            match nodes.peek(ino) {
                Some(n) => n.clone(),
                None => return Err(libc::ENOENT),
            }
        };
        if node.layer == upper {
            return Ok(());
        }

        // the upper layer must contain the parent chain first
        if node.ino != fuser::FUSE_ROOT_ID && node.parent != 0 {
            self.copy_up(node.parent)?;
        }

        let src_layer = &self.layers[node.layer];
        let src_meta = src_layer
            .store
            .stat_at(&node.path)
            .map_err(|e| io_error_to_libc(&e))?;

        tracing::debug!(
            "copy_up: promoting {:?} from layer {} (kind {:?})",
            node.path,
            node.layer,
            src_meta.file_type()
        );

        let result = if src_meta.is_dir() {
            self.create_directory(
                &node.path,
                DirSpec {
                    mode: src_meta.mode() & 0o7777,
                    uid: src_meta.uid(),
                    gid: src_meta.gid(),
                    src: Some((node.layer, &src_meta)),
                    opaque: false,
                },
            )
        } else if src_meta.file_type().is_symlink() {
            self.copy_up_symlink(&node.path, node.layer)
        } else {
            self.copy_up_regular(ino, &node.path, node.layer, &src_meta)
        };
        result.map_err(|e| io_error_to_libc(&e))?;

        // drop any fallback whiteout that covered the name
        if let Some(parent_rel) = node.path.parent() {
            let upper_parent = self.layers[upper].path(parent_rel);
            let _ = Whiteout::delete(&upper_parent, &node.name);
        }

        let upper_identity = self.layers[upper].store.stat_at(&node.path).ok();
        let mut nodes = self.nodes.write();
        if let Some(n) = nodes.get_mut(ino) {
            n.layer = upper;
        }
        // the promoted entry now also answers to its upper identity, so
        // a later hard link of the upper file interns to this node even
        // when the origin xattr could not be written
        if let Some(meta) = upper_identity {
            nodes.alias_identity(meta.dev(), meta.ino(), ino);
        }
        Ok(())
    }

    fn copy_up_symlink(&self, rel: &Path, src_layer: usize) -> io::Result<()> {
        let upper = &self.layers[self.upper_index().expect("caller checked upper")];
        let target = self.layers[src_layer].store.read_link_at(rel)?;
        // a covering whiteout device at the path would make symlinkat fail
        if let (Some(parent), Some(name)) = (rel.parent(), rel.file_name()) {
            let _ = Whiteout::delete(&upper.path(parent), name);
        }
        upper.store.symlink_at(&target, rel)
    }

    fn copy_up_regular(
        &self,
        ino: u64,
        rel: &Path,
        src_layer: usize,
        src_meta: &Metadata,
    ) -> io::Result<()> {
        let upper_idx = self.upper_index().expect("caller checked upper");
        let staging = self
            .next_staging_path()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EROFS))?;

        let result = self.stage_regular(ino, rel, src_layer, src_meta, &staging);
        if result.is_err() {
            let _ = std::fs::remove_file(&staging);
            return result;
        }

        let dest = self.layers[upper_idx].path(rel);
        if let Err(e) = std::fs::rename(&staging, &dest) {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
        Ok(())
    }

    fn stage_regular(
        &self,
        ino: u64,
        rel: &Path,
        src_layer: usize,
        src_meta: &Metadata,
        staging: &Path,
    ) -> io::Result<()> {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;

        let src = self.layers[src_layer].store.open_at(rel, true, false)?;

        let mut mode = src_meta.mode() & 0o7777;
        if self.settings.xattr_permissions != XattrPermissions::Off {
            // the real mode lives in the override attribute; the file
            // itself must stay traversable for the overlay process
            mode |= 0o755;
        }
        // SAFETY: geteuid has no failure modes.
        if unsafe { libc::geteuid() } != 0 {
            mode |= 0o200;
        }

        let dst = OpenOptions::new()
            .write(true)
            .read(true)
            .create_new(true)
            .mode(mode)
            .open(staging)?;

        self.apply_ownership(staging, src_meta.uid(), src_meta.gid(), src_meta.mode())?;

        let cipher = self.node_cipher(ino);
        self.encode_into(&cipher, &src, &dst, src_meta.len())?;

        copy_file_times(staging, src_meta)?;
        self.copy_user_xattrs(src_layer, rel, staging)?;

        // record where this file came from so its identity survives
        let origin = rel.as_os_str().to_string_lossy();
        if !self.settings.noxattrs {
            let _ = xattr::set(staging, ORIGIN_XATTR, origin.as_bytes());
        }
        Ok(())
    }

    /// Run the block encoder outside the big lock; the content loop is
    /// the long-running part of copy-up.
    fn encode_into(
        &self,
        cipher: &NodeCipher,
        src: &std::fs::File,
        dst: &std::fs::File,
        size: u64,
    ) -> io::Result<()> {
        self.engine.encode_file(cipher, src, dst, size)
    }

    /// Ownership and mode, routed through the override xattr when that
    /// mechanism is on, through chown/chmod otherwise. Failures are
    /// swallowed when ownership is squashed anyway.
    pub(crate) fn apply_ownership(
        &self,
        path: &Path,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> io::Result<()> {
        if self.settings.xattr_permissions != XattrPermissions::Off {
            return idmap::write_override(
                path,
                self.settings.xattr_permissions,
                uid,
                gid,
                mode,
            );
        }
        match std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
            Ok(()) => Ok(()),
            Err(_) if self.idmap.squashed() => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn copy_user_xattrs(&self, src_layer: usize, rel: &Path, dst: &Path) -> io::Result<()> {
        if self.settings.noxattrs {
            return Ok(());
        }
        let names = match self.layers[src_layer].store.list_xattr(rel) {
            Ok(names) => names,
            Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => return Ok(()),
            Err(e) => return Err(e),
        };
        for name in names {
            if is_reserved_xattr(&name) {
                continue;
            }
            if let Ok(Some(value)) = self.layers[src_layer].store.get_xattr(rel, &name) {
                match xattr::set(dst, &name, &value) {
                    Ok(()) => {}
                    Err(e) if e.raw_os_error() == Some(libc::EPERM) => {}
                    Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Create a directory on the upper layer carrying the source's
    /// metadata (or the given mode for a fresh mkdir) and, optionally,
    /// the opaque marker.
    ///
    /// A plain mkdirat suffices only when no metadata must be staged;
    /// otherwise the directory is built in the workdir and renamed in.
    /// The rename ladder handles a leftover entry of a different type
    /// (exchange it away), ENOTDIR (unlink and retry) and ENOENT
    /// (materialize parents and retry).
    pub(crate) fn create_directory(&self, rel: &Path, spec: DirSpec) -> io::Result<()> {
        let upper_idx = self
            .upper_index()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EROFS))?;
        let upper = &self.layers[upper_idx];

        let needs_staging = spec.opaque
            || spec.src.is_some()
            || self.settings.xattr_permissions != XattrPermissions::Off;

        if !needs_staging {
            return upper.store.mkdir_at(rel, spec.mode);
        }

        let staging = self
            .next_staging_path()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EROFS))?;

        let build = || -> io::Result<()> {
            use std::os::unix::fs::PermissionsExt;
            std::fs::create_dir(&staging)?;
            std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(spec.mode))?;
            self.apply_ownership(&staging, spec.uid, spec.gid, spec.mode)?;
            if let Some((layer, src_meta)) = spec.src {
                copy_file_times(&staging, src_meta)?;
                self.copy_user_xattrs(layer, rel, &staging)?;
            }
            if spec.opaque {
                whiteout::set_opaque(&staging)?;
            }
            Ok(())
        };
        if let Err(e) = build() {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        let dest = upper.path(rel);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match std::fs::rename(&staging, &dest) {
                Ok(()) => return Ok(()),
                Err(e) if attempts > 3 => {
                    let _ = std::fs::remove_dir_all(&staging);
                    return Err(e);
                }
                Err(e) => match e.raw_os_error() {
                    Some(libc::EEXIST) | Some(libc::ENOTEMPTY) => {
                        if std::fs::symlink_metadata(&dest)
                            .map(|m| m.is_dir())
                            .unwrap_or(false)
                        {
                            // the directory already materialized; keep it
                            let _ = std::fs::remove_dir_all(&staging);
                            return Ok(());
                        }
                        // something of a different type sits at the target:
                        // swap it into the workdir and dispose of it there
                        let parked = self.next_staging_path().unwrap_or_else(|| {
                            staging.with_extension("parked")
                        });
                        exchange_paths(&staging, &dest)?;
                        // staging path now holds the old target entry
                        let _ = std::fs::rename(&staging, &parked);
                        let _ = std::fs::remove_dir_all(&parked);
                        let _ = std::fs::remove_file(&parked);
                        return Ok(());
                    }
                    Some(libc::ENOTDIR) => {
                        std::fs::remove_file(&dest)?;
                    }
                    Some(libc::ENOENT) => {
                        if let Some(parent) = rel.parent() {
                            std::fs::create_dir_all(upper.path(parent))?;
                        }
                    }
                    _ => {
                        let _ = std::fs::remove_dir_all(&staging);
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Emit a whiteout for `(parent, name)` in the upper layer. Without
    /// `force`, a name no lower layer exposes needs no marker and this
    /// is a no-op. Exposure is decided by the lookup engine's own walk
    /// so it always agrees with the merged view.
    pub(crate) fn create_whiteout(
        &self,
        parent: &Node,
        name: &OsStr,
        force: bool,
    ) -> io::Result<()> {
        if !force && !self.lower_exposes(parent, name) {
            return Ok(());
        }
        let upper_idx = self
            .upper_index()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EROFS))?;
        let dir = self.layers[upper_idx].path(&parent.path);
        Whiteout::create(&dir, name, self.can_mknod)
    }
}
