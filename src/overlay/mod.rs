mod convert;
mod copy_up;
pub mod crypto;
mod handle;
pub mod idmap;
pub(crate) mod layer;
mod lookup;
pub(crate) mod types;
pub mod whiteout;

use convert::{io_error_to_libc, metadata_to_fileattr};
use crypto::{CipherEngine, CipherSuite, KeySize, NodeCipher};
use handle::FileHandle;
use layer::LayerStore;
use lookup::Discovered;
use types::{Layer, LayerKind, Node, NodeTable};
use whiteout::{Whiteout, WHITEOUT_PREFIX};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow, FUSE_ROOT_ID,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{Settings, XattrPermissions};
use crate::error::{Result, VeilError};
use crate::overlay::idmap::IdMapper;

/// The overlay filesystem: an ordered layer stack merged into one view,
/// with upper-layer file data routed through the block cipher engine.
pub struct VeilFs {
    pub(crate) layers: Vec<Layer>,
    /// The overlay-owned `work/` subdirectory of the configured workdir.
    pub(crate) workdir: Option<PathBuf>,
    pub(crate) settings: Settings,
    pub(crate) idmap: IdMapper,
    pub(crate) engine: Arc<CipherEngine>,
    pub(crate) nodes: Arc<RwLock<NodeTable>>,
    handles: Arc<RwLock<HashMap<u64, FileHandle>>>,
    /// Directory-stream snapshots, fixed at opendir time.
    dir_handles: Arc<RwLock<HashMap<u64, Arc<Vec<(u64, FileType, std::ffi::OsString)>>>>>,
    next_fh: Arc<Mutex<u64>>,
    /// Per-node cipher state (the single-block cache and its mutex).
    ciphers: Arc<RwLock<HashMap<u64, Arc<NodeCipher>>>>,
    /// Serializes namespace mutations and node-graph access across
    /// handlers; released before long-running syscalls.
    big_lock: Arc<Mutex<()>>,
    pub(crate) wd_counter: AtomicU64,
    ttl: Duration,
    pub(crate) can_mknod: bool,
    namemax: usize,
}

pub(crate) fn sentinel_attrs(ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: crypto::BLOCK_SIZE as u32,
        flags: 0,
    }
}

impl VeilFs {
    pub fn new(settings: Settings) -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(upper) = &settings.upperdir {
            if !upper.is_dir() {
                return Err(VeilError::NotADirectory(upper.clone()));
            }
            layers.push(Layer::new(0, LayerKind::Upper, upper.clone()));
        }
        for lower in &settings.lowerdirs {
            if !lower.is_dir() {
                return Err(VeilError::NotADirectory(lower.clone()));
            }
            layers.push(Layer::new(layers.len(), LayerKind::Lower, lower.clone()));
        }

        let workdir = match (&settings.upperdir, &settings.workdir) {
            (Some(_), Some(wd)) => {
                let work = wd.join("work");
                std::fs::create_dir_all(&work)?;
                Some(work)
            }
            _ => None,
        };

        let can_mknod = workdir
            .as_deref()
            .map(|wd| whiteout::probe_can_mknod(wd, "0"))
            .unwrap_or(false);

        let namemax = nix::sys::statvfs::statvfs(layers[0].store.root())
            .map(|st| st.name_max() as usize)
            .unwrap_or(255);

        let engine = CipherEngine::new(CipherSuite::from_env(KeySize::Bits256), true);
        let idmap = IdMapper::new(
            settings.uid_mappings.clone(),
            settings.gid_mappings.clone(),
            settings.squash_to_root,
            settings.squash_to_uid,
            settings.squash_to_gid,
        );
        let ttl = settings.timeout;

        let fs = VeilFs {
            layers,
            workdir,
            settings,
            idmap,
            engine: Arc::new(engine),
            nodes: Arc::new(RwLock::new(NodeTable::new())),
            handles: Arc::new(RwLock::new(HashMap::new())),
            dir_handles: Arc::new(RwLock::new(HashMap::new())),
            next_fh: Arc::new(Mutex::new(1)),
            ciphers: Arc::new(RwLock::new(HashMap::new())),
            big_lock: Arc::new(Mutex::new(())),
            // staging name "0" was consumed by the mknod probe
            wd_counter: AtomicU64::new(1),
            ttl,
            can_mknod,
            namemax,
        };
        fs.initialize_root()?;
        Ok(fs)
    }

    fn initialize_root(&self) -> Result<()> {
        let meta = std::fs::metadata(self.layers[0].store.root())?;
        let mut attrs = metadata_to_fileattr(&meta, FUSE_ROOT_ID);
        attrs.uid = self.idmap.uid_to_container(attrs.uid);
        attrs.gid = self.idmap.gid_to_container(attrs.gid);

        self.nodes.write().insert(Node {
            ino: FUSE_ROOT_ID,
            parent: 0,
            name: Default::default(),
            path: PathBuf::from("."),
            layer: 0,
            last_layer: None,
            attrs,
            whiteout: false,
            hidden: false,
            src_dev: meta.dev(),
            src_ino: meta.ino(),
            lookups: 1,
            nlink_refs: 1,
            open_handles: 0,
        });
        Ok(())
    }

    pub(crate) fn upper_index(&self) -> Option<usize> {
        self.layers.first().filter(|l| l.is_upper()).map(|l| l.index)
    }

    fn upper_layer(&self) -> Option<&Layer> {
        self.layers.first().filter(|l| l.is_upper())
    }

    pub(crate) fn node_snapshot(&self, ino: u64) -> Option<Node> {
        self.nodes.read().peek(ino).cloned()
    }

    fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        *next = next.wrapping_add(1);
        fh
    }

    pub(crate) fn node_cipher(&self, ino: u64) -> Arc<NodeCipher> {
        let mut ciphers = self.ciphers.write();
        ciphers
            .entry(ino)
            .or_insert_with(|| Arc::new(NodeCipher::new()))
            .clone()
    }

    fn drop_node_state(&self, ino: u64) {
        self.ciphers.write().remove(&ino);
    }

    /// The cipher engine handles a node's data exactly when the upper
    /// layer provides a regular file.
    fn engaged(&self, node: &Node) -> bool {
        self.upper_index() == Some(node.layer) && node.attrs.kind == FileType::RegularFile
    }

    fn check_name(&self, name: &OsStr) -> std::result::Result<(), i32> {
        if Whiteout::is_marker_name(name) {
            return Err(libc::EINVAL);
        }
        if name.as_bytes().len() > self.namemax.saturating_sub(WHITEOUT_PREFIX.len()) {
            return Err(libc::ENAMETOOLONG);
        }
        Ok(())
    }

    /// Resolve `(parent, name)` to an existing node, materializing it
    /// from the layers when necessary. `Ok(None)` means the name is
    /// absent or whiteout-covered.
    pub(crate) fn resolve_child(
        &self,
        parent: u64,
        name: &OsStr,
    ) -> std::result::Result<Option<u64>, i32> {
        let cached = self.nodes.read().lookup_child(parent, name);
        if let Some(ino) = cached {
            let whiteout = self
                .nodes
                .read()
                .peek(ino)
                .map(|n| n.whiteout)
                .unwrap_or(true);
            return Ok(if whiteout { None } else { Some(ino) });
        }

        let parent_node = self.node_snapshot(parent).ok_or(libc::ENOENT)?;
        match self.scan_layers(&parent_node, name) {
            Err(e) => Err(io_error_to_libc(&e)),
            Ok(None) => Ok(None),
            Ok(Some(Discovered::Whiteout)) => {
                self.register_whiteout_node(parent, name);
                Ok(None)
            }
            Ok(Some(Discovered::Entry {
                layer,
                last_layer,
                meta,
            })) => {
                let (ino, _) = self.register_entry(parent, name, layer, last_layer, &meta);
                Ok(Some(ino))
            }
        }
    }

    fn clear_tombstone(&self, parent: u64, name: &OsStr) {
        let mut nodes = self.nodes.write();
        if let Some(ino) = nodes.lookup_child(parent, name) {
            if nodes.peek(ino).is_some_and(|n| n.whiteout) {
                nodes.remove(ino);
            }
        }
    }

    fn refresh_attrs(&self, ino: u64) -> Option<FileAttr> {
        let node = self.node_snapshot(ino)?;
        if node.whiteout {
            return None;
        }
        match self.layers[node.layer].store.stat_at(&node.path) {
            Ok(meta) => {
                let attrs = self.attrs_for(node.layer, &node.path, &meta, ino);
                self.nodes.write().update_attrs(ino, attrs);
                Some(attrs)
            }
            Err(_) => Some(node.attrs),
        }
    }

    fn bump_lookup(&self, ino: u64) {
        if let Some(node) = self.nodes.write().get_mut(ino) {
            node.lookups += 1;
        }
    }

    /// Remove a name from the tree and settle the node's fate: it stays
    /// alive (hidden) while the kernel or open handles still reference
    /// it, and is evicted otherwise.
    fn drop_tree_entry(&self, parent: u64, name: &OsStr, ino: u64) {
        let evict = {
            let mut nodes = self.nodes.write();
            nodes.remove_child(parent, name);
            if let Some(node) = nodes.get_mut(ino) {
                node.nlink_refs = node.nlink_refs.saturating_sub(1);
                node.attrs.nlink = node.attrs.nlink.saturating_sub(1);
                if node.nlink_refs == 0 {
                    node.hidden = true;
                }
                node.lookups == 0 && node.nlink_refs == 0 && node.open_handles == 0
            } else {
                false
            }
        };
        if evict {
            self.nodes.write().remove(ino);
            self.drop_node_state(ino);
        }
    }

    /// Unlink the upper entry for a node, leaving a whiteout behind when
    /// lower layers still expose the name. Prefers the atomic
    /// RENAME_WHITEOUT move through the workdir.
    fn remove_upper_entry(
        &self,
        node: &Node,
        parent: &Node,
        is_dir: bool,
    ) -> io::Result<()> {
        let upper = self.upper_layer().expect("caller checked upper");
        let full = upper.path(&node.path);
        let exposes = self.lower_exposes(parent, &node.name);

        if self.upper_index() == Some(node.layer) {
            if is_dir {
                self.empty_upper_dir(&node.path)?;
                upper.store.rmdir_at(&node.path)?;
            } else if exposes && self.can_mknod {
                match self
                    .next_staging_path()
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::EROFS))
                    .and_then(|parked| {
                        layer::rename_whiteout_paths(&full, &parked).map(|()| parked)
                    }) {
                    Ok(parked) => {
                        let _ = std::fs::remove_file(&parked);
                        return Ok(());
                    }
                    Err(_) => {
                        upper.store.unlink_at(&node.path)?;
                    }
                }
            } else {
                upper.store.unlink_at(&node.path)?;
            }
        }

        if exposes {
            self.create_whiteout(parent, &node.name, true)?;
        }
        Ok(())
    }

    /// Remove every remaining on-disk entry of an upper directory; by
    /// the time this runs the merged view is empty, so anything left is
    /// a whiteout marker or opaque sentinel.
    fn empty_upper_dir(&self, rel: &Path) -> io::Result<()> {
        let upper = self.upper_layer().expect("caller checked upper");
        let dir = upper.path(rel);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// True when the node and (for directories) its whole merged subtree
    /// live on the upper layer only.
    fn subtree_all_upper(&self, ino: u64) -> io::Result<bool> {
        let Some(upper) = self.upper_index() else {
            return Ok(false);
        };
        let node = match self.node_snapshot(ino) {
            Some(n) => n,
            None => return Ok(false),
        };
        if node.layer != upper {
            return Ok(false);
        }
        if !node.is_dir() || node.last_layer == Some(upper) {
            return Ok(true);
        }
        self.subtree_all_upper_at(&node.path, node.layer, node.last_layer)
    }

    fn subtree_all_upper_at(
        &self,
        path: &Path,
        layer: usize,
        last_layer: Option<usize>,
    ) -> io::Result<bool> {
        let upper = self.upper_index().expect("caller checked upper");
        let merged = self.merge_dir_at(path, layer, last_layer)?;
        for (name, (entry_layer, meta)) in merged {
            if entry_layer != upper {
                return Ok(false);
            }
            if meta.is_dir()
                && !self.subtree_all_upper_at(&path.join(&name), entry_layer, None)?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn set_times_masked(
        path: &Path,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> io::Result<()> {
        fn ts(t: Option<TimeOrNow>) -> libc::timespec {
            match t {
                None => libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
                Some(TimeOrNow::Now) => libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_NOW,
                },
                Some(TimeOrNow::SpecificTime(st)) => {
                    let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
                    libc::timespec {
                        tv_sec: d.as_secs() as libc::time_t,
                        tv_nsec: d.subsec_nanos() as libc::c_long,
                    }
                }
            }
        }

        let path_c = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let times = [ts(atime), ts(mtime)];
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

    /// Build the fixed readdir table for a directory: `[".", "..",
    /// children...]`, whiteouts and hidden entries already filtered.
    /// Entries added or removed after this point are not visible to an
    /// in-flight directory stream.
    fn dir_snapshot(
        &self,
        ino: u64,
    ) -> std::result::Result<Vec<(u64, FileType, std::ffi::OsString)>, i32> {
        let dir = self.node_snapshot(ino).ok_or(libc::ENOENT)?;
        if !dir.is_dir() {
            return Err(libc::ENOTDIR);
        }

        let merged = self.merge_dir(&dir).map_err(|e| io_error_to_libc(&e))?;

        let parent_ino = if ino == FUSE_ROOT_ID { FUSE_ROOT_ID } else { dir.parent };
        let mut entries: Vec<(u64, FileType, std::ffi::OsString)> = vec![
            (ino, FileType::Directory, ".".into()),
            (parent_ino, FileType::Directory, "..".into()),
        ];
        let scan_end = self.layers.len().saturating_sub(1);
        for (name, (layer, meta)) in merged {
            let cached = self.nodes.read().lookup_child(ino, &name);
            let child_ino = match cached {
                Some(child) => {
                    let skip = self
                        .nodes
                        .read()
                        .peek(child)
                        .map(|n| n.whiteout || n.hidden)
                        .unwrap_or(true);
                    if skip {
                        continue;
                    }
                    child
                }
                None => {
                    let last = if meta.is_dir() { scan_end } else { layer };
                    self.register_entry(ino, &name, layer, last, &meta).0
                }
            };
            entries.push((child_ino, convert::metadata_to_filetype(&meta), name));
        }
        Ok(entries)
    }

    /// Create the on-disk hard link and register the new name through
    /// the same identity-interning path lookup uses, so both ways of
    /// discovering an alias (linkat here, origin-chasing in lookup)
    /// converge on one node. The source must already be on the upper
    /// layer.
    fn register_link(
        &self,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
    ) -> std::result::Result<(u64, FileAttr), i32> {
        let upper_idx = self.upper_index().ok_or(libc::EROFS)?;
        let (src_rel, newparent_rel) =
            match (self.node_snapshot(ino), self.node_snapshot(newparent)) {
                (Some(s), Some(np)) => (s.path, np.path),
                _ => return Err(libc::ENOENT),
            };

        let upper = &self.layers[upper_idx];
        let dest_rel = newparent_rel.join(newname);
        upper
            .store
            .link_at(&src_rel, &dest_rel)
            .map_err(|e| io_error_to_libc(&e))?;
        let _ = Whiteout::delete(&upper.path(&newparent_rel), newname);
        self.clear_tombstone(newparent, newname);

        let meta = upper
            .store
            .stat_at(&dest_rel)
            .map_err(|e| io_error_to_libc(&e))?;
        // the new name carries the source's backing identity, so the
        // interning table hands back the existing node and hooks the
        // name to it
        let (linked, _) = self.register_entry(newparent, newname, upper_idx, upper_idx, &meta);
        let attrs = self.refresh_attrs(linked).ok_or(libc::ENOENT)?;
        self.bump_lookup(linked);
        Ok((linked, attrs))
    }

    /// Shared tail of the entry-creating operations: refresh from disk,
    /// register the node, account the kernel reference.
    fn finish_entry_creation(
        &self,
        parent: u64,
        name: &OsStr,
    ) -> std::result::Result<(u64, FileAttr), i32> {
        let upper = self.upper_index().ok_or(libc::EROFS)?;
        let parent_path = self
            .node_snapshot(parent)
            .map(|p| p.path)
            .ok_or(libc::ENOENT)?;
        let rel = parent_path.join(name);
        let meta = self.layers[upper]
            .store
            .stat_at(&rel)
            .map_err(|e| io_error_to_libc(&e))?;

        self.clear_tombstone(parent, name);
        let (ino, attrs) = self.register_entry(parent, name, upper, upper, &meta);
        self.bump_lookup(ino);
        Ok((ino, attrs))
    }
}

impl Filesystem for VeilFs {
    fn init(
        &mut self,
        _req: &Request,
        config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        if self.settings.writeback {
            if let Err(unsupported) = config.add_capabilities(fuser::consts::FUSE_WRITEBACK_CACHE)
            {
                tracing::debug!("writeback cache not offered by kernel ({:#x})", unsupported);
                self.settings.writeback = false;
            }
        }
        tracing::info!(
            "veilfs initialized: {} layer(s), upper={}, can_mknod={}, writeback={}",
            self.layers.len(),
            self.upper_index().is_some(),
            self.can_mknod,
            self.settings.writeback
        );
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("veilfs destroyed");
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        let _guard = self.big_lock.lock();
        let evict = self.nodes.write().forget(ino, nlookup);
        if evict {
            self.nodes.write().remove(ino);
            self.drop_node_state(ino);
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        let _guard = self.big_lock.lock();

        if Whiteout::is_marker_name(name) {
            reply.error(libc::EINVAL);
            return;
        }

        match self.resolve_child(parent, name) {
            Err(errno) => reply.error(errno),
            Ok(None) => reply.error(libc::ENOENT),
            Ok(Some(ino)) => {
                let attrs = self
                    .refresh_attrs(ino)
                    .or_else(|| self.node_snapshot(ino).map(|n| n.attrs));
                match attrs {
                    Some(attrs) => {
                        self.bump_lookup(ino);
                        reply.entry(&self.ttl, &attrs, 0);
                    }
                    None => reply.error(libc::ENOENT),
                }
            }
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        let _guard = self.big_lock.lock();
        match self.refresh_attrs(ino) {
            Some(attrs) => reply.attr(&self.ttl, &attrs),
            None => reply.error(libc::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        tracing::debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino,
            mode,
            uid,
            gid,
            size
        );
        let guard = self.big_lock.lock();

        if self.node_snapshot(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }
        if let Err(e) = self.copy_up(ino) {
            reply.error(e);
            return;
        }
        let node = match self.node_snapshot(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let path = self.layers[node.layer].path(&node.path);

        // ownership and mode changes go through the override mechanism
        // when it is on
        if mode.is_some() || uid.is_some() || gid.is_some() {
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    reply.error(io_error_to_libc(&e));
                    return;
                }
            };
            let (cur_uid, cur_gid, cur_perm) =
                idmap::effective_stat(&path, &meta, self.settings.xattr_permissions);
            let new_uid = uid.map(|u| self.idmap.uid_to_host(u)).unwrap_or(cur_uid);
            let new_gid = gid.map(|g| self.idmap.gid_to_host(g)).unwrap_or(cur_gid);
            let new_perm = mode.map(|m| m & 0o7777).unwrap_or(cur_perm);

            let result = if self.settings.xattr_permissions != XattrPermissions::Off {
                idmap::write_override(
                    &path,
                    self.settings.xattr_permissions,
                    new_uid,
                    new_gid,
                    new_perm,
                )
            } else {
                let mut r = Ok(());
                if mode.is_some() && !meta.file_type().is_symlink() {
                    use std::os::unix::fs::PermissionsExt;
                    r = std::fs::set_permissions(
                        &path,
                        std::fs::Permissions::from_mode(new_perm),
                    );
                }
                if r.is_ok() && (uid.is_some() || gid.is_some()) {
                    r = match std::os::unix::fs::lchown(&path, Some(new_uid), Some(new_gid)) {
                        Err(_) if self.idmap.squashed() => Ok(()),
                        other => other,
                    };
                }
                r
            };
            if let Err(e) = result {
                reply.error(io_error_to_libc(&e));
                return;
            }
        }

        // the truncate may be long-running; big lock is not held across it
        drop(guard);

        if let Some(new_size) = size {
            self.node_cipher(ino).invalidate();
            let result = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|f| f.set_len(new_size));
            if let Err(e) = result {
                reply.error(io_error_to_libc(&e));
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            if let Err(e) = Self::set_times_masked(&path, atime, mtime) {
                reply.error(io_error_to_libc(&e));
                return;
            }
        }

        match self.refresh_attrs(ino) {
            Some(attrs) => reply.attr(&self.ttl, &attrs),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let _guard = self.big_lock.lock();
        let Some(node) = self.node_snapshot(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.layers[node.layer].store.read_link_at(&node.path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mknod(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let _guard = self.big_lock.lock();

        if let Err(errno) = self.check_name(name) {
            reply.error(errno);
            return;
        }
        if self.upper_index().is_none() {
            reply.error(libc::EROFS);
            return;
        }
        match self.resolve_child(parent, name) {
            Ok(Some(_)) => {
                reply.error(libc::EEXIST);
                return;
            }
            Ok(None) => {}
            Err(errno) => {
                reply.error(errno);
                return;
            }
        }
        if let Err(e) = self.copy_up(parent) {
            reply.error(e);
            return;
        }

        let Some(staging) = self.next_staging_path() else {
            reply.error(libc::EROFS);
            return;
        };

        use nix::sys::stat::{mknod as nix_mknod, Mode, SFlag};
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        if let Err(e) = nix_mknod(&staging, kind, perm, rdev as nix::libc::dev_t) {
            reply.error(e as i32);
            return;
        }

        let uid = self.idmap.uid_to_host(req.uid());
        let gid = self.idmap.gid_to_host(req.gid());
        let finish = || -> io::Result<()> {
            self.apply_ownership(&staging, uid, gid, mode)?;
            let parent_path = self
                .node_snapshot(parent)
                .map(|p| p.path)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
            let upper = self.upper_layer().expect("checked above");
            let dest = upper.path(&parent_path.join(name));
            std::fs::rename(&staging, &dest)?;
            Whiteout::delete(&upper.path(&parent_path), name)?;
            Ok(())
        };
        if let Err(e) = finish() {
            let _ = std::fs::remove_file(&staging);
            reply.error(io_error_to_libc(&e));
            return;
        }

        match self.finish_entry_creation(parent, name) {
            Ok((_, attrs)) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let _guard = self.big_lock.lock();

        if let Err(errno) = self.check_name(name) {
            reply.error(errno);
            return;
        }
        if self.upper_index().is_none() {
            reply.error(libc::EROFS);
            return;
        }
        match self.resolve_child(parent, name) {
            Ok(Some(_)) => {
                reply.error(libc::EEXIST);
                return;
            }
            Ok(None) => {}
            Err(errno) => {
                reply.error(errno);
                return;
            }
        }
        if let Err(e) = self.copy_up(parent) {
            reply.error(e);
            return;
        }

        let parent_path = match self.node_snapshot(parent) {
            Some(p) => p.path,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let rel = parent_path.join(name);

        // the new directory must shadow any same-named directory a lower
        // layer grows later, so it is born opaque
        let spec = copy_up::DirSpec {
            mode: mode & 0o7777,
            uid: self.idmap.uid_to_host(req.uid()),
            gid: self.idmap.gid_to_host(req.gid()),
            src: None,
            opaque: true,
        };
        if let Err(e) = self.create_directory(&rel, spec) {
            reply.error(io_error_to_libc(&e));
            return;
        }
        let upper = self.upper_layer().expect("checked above");
        if let Err(e) = Whiteout::delete(&upper.path(&parent_path), name) {
            reply.error(io_error_to_libc(&e));
            return;
        }

        match self.finish_entry_creation(parent, name) {
            Ok((_, attrs)) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("unlink(parent={}, name={:?})", parent, name);
        let _guard = self.big_lock.lock();

        let ino = match self.resolve_child(parent, name) {
            Ok(Some(ino)) => ino,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let node = match self.node_snapshot(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if node.is_dir() {
            reply.error(libc::EISDIR);
            return;
        }
        if self.upper_index().is_none() {
            reply.error(libc::EROFS);
            return;
        }
        if let Err(e) = self.copy_up(parent) {
            reply.error(e);
            return;
        }

        let parent_node = match self.node_snapshot(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if let Err(e) = self.remove_upper_entry(&node, &parent_node, false) {
            reply.error(io_error_to_libc(&e));
            return;
        }

        self.drop_tree_entry(parent, name, ino);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("rmdir(parent={}, name={:?})", parent, name);
        let _guard = self.big_lock.lock();

        let ino = match self.resolve_child(parent, name) {
            Ok(Some(ino)) => ino,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let node = match self.node_snapshot(ino) {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if !node.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }
        if self.upper_index().is_none() {
            reply.error(libc::EROFS);
            return;
        }

        match self.merge_dir(&node) {
            Ok(merged) if !merged.is_empty() => {
                reply.error(libc::ENOTEMPTY);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                reply.error(io_error_to_libc(&e));
                return;
            }
        }
        if let Err(e) = self.copy_up(parent) {
            reply.error(e);
            return;
        }

        let parent_node = match self.node_snapshot(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if let Err(e) = self.remove_upper_entry(&node, &parent_node, true) {
            reply.error(io_error_to_libc(&e));
            return;
        }

        self.drop_tree_entry(parent, name, ino);
        reply.ok();
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        tracing::debug!("symlink(parent={}, name={:?} -> {:?})", parent, name, link);
        let _guard = self.big_lock.lock();

        if let Err(errno) = self.check_name(name) {
            reply.error(errno);
            return;
        }
        if self.upper_index().is_none() {
            reply.error(libc::EROFS);
            return;
        }
        match self.resolve_child(parent, name) {
            Ok(Some(_)) => {
                reply.error(libc::EEXIST);
                return;
            }
            Ok(None) => {}
            Err(errno) => {
                reply.error(errno);
                return;
            }
        }
        if let Err(e) = self.copy_up(parent) {
            reply.error(e);
            return;
        }

        let Some(staging) = self.next_staging_path() else {
            reply.error(libc::EROFS);
            return;
        };
        let uid = self.idmap.uid_to_host(req.uid());
        let gid = self.idmap.gid_to_host(req.gid());

        let build = || -> io::Result<()> {
            std::os::unix::fs::symlink(link, &staging)?;
            match std::os::unix::fs::lchown(&staging, Some(uid), Some(gid)) {
                Ok(()) => {}
                Err(_) if self.idmap.squashed() => {}
                Err(e) if e.raw_os_error() == Some(libc::EPERM) => {}
                Err(e) => return Err(e),
            }
            let parent_path = self
                .node_snapshot(parent)
                .map(|p| p.path)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
            let upper = self.upper_layer().expect("checked above");
            let dest = upper.path(&parent_path.join(name));
            let _ = Whiteout::delete(&upper.path(&parent_path), name);
            std::fs::rename(&staging, &dest)
        };
        if let Err(e) = build() {
            let _ = std::fs::remove_file(&staging);
            reply.error(io_error_to_libc(&e));
            return;
        }

        match self.finish_entry_creation(parent, name) {
            Ok((_, attrs)) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        tracing::debug!(
            "rename({}, {:?} -> {}, {:?}, flags={:#x})",
            parent,
            name,
            newparent,
            newname,
            flags
        );
        let _guard = self.big_lock.lock();

        if let Err(errno) = self.check_name(newname) {
            reply.error(errno);
            return;
        }
        if self.upper_index().is_none() {
            reply.error(libc::EROFS);
            return;
        }

        let src_ino = match self.resolve_child(parent, name) {
            Ok(Some(ino)) => ino,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let dest_ino = match self.resolve_child(newparent, newname) {
            Ok(dest) => dest,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let exchange = flags & libc::RENAME_EXCHANGE != 0;
        let noreplace = flags & libc::RENAME_NOREPLACE != 0;

        if noreplace && dest_ino.is_some() {
            reply.error(libc::EEXIST);
            return;
        }

        if let Err(e) = self.copy_up(parent).and_then(|_| self.copy_up(newparent)) {
            reply.error(e);
            return;
        }

        let (parent_node, newparent_node) = match (
            self.node_snapshot(parent),
            self.node_snapshot(newparent),
        ) {
            (Some(p), Some(np)) => (p, np),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let parent_rel = parent_node.path.clone();
        let newparent_rel = newparent_node.path.clone();

        if exchange {
            let Some(dest_ino) = dest_ino else {
                reply.error(libc::ENOENT);
                return;
            };
            for &ino in &[src_ino, dest_ino] {
                let is_dir = self
                    .node_snapshot(ino)
                    .map(|n| n.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    match self.subtree_all_upper(ino) {
                        Ok(true) => {}
                        Ok(false) => {
                            reply.error(libc::EXDEV);
                            return;
                        }
                        Err(e) => {
                            reply.error(io_error_to_libc(&e));
                            return;
                        }
                    }
                } else if let Err(e) = self.copy_up(ino) {
                    reply.error(e);
                    return;
                }
            }

            let upper = self.upper_layer().expect("checked above");
            if let Err(e) =
                upper.store.exchange_at(&parent_rel.join(name), &newparent_rel.join(newname))
            {
                reply.error(io_error_to_libc(&e));
                return;
            }

            {
                let mut nodes = self.nodes.write();
                nodes.remove_child(parent, name);
                nodes.remove_child(newparent, newname);
                nodes.add_child(parent, name.to_os_string(), dest_ino);
                nodes.add_child(newparent, newname.to_os_string(), src_ino);
                if let Some(n) = nodes.get_mut(src_ino) {
                    n.parent = newparent;
                    n.name = newname.to_os_string();
                }
                if let Some(n) = nodes.get_mut(dest_ino) {
                    n.parent = parent;
                    n.name = name.to_os_string();
                }
                nodes.update_paths(src_ino);
                nodes.update_paths(dest_ino);
            }
            reply.ok();
            return;
        }

        // default mode: the source must move wholly to the upper layer
        let src_is_dir = self
            .node_snapshot(src_ino)
            .map(|n| n.is_dir())
            .unwrap_or(false);
        if src_is_dir {
            match self.subtree_all_upper(src_ino) {
                Ok(true) => {}
                Ok(false) => {
                    reply.error(libc::EXDEV);
                    return;
                }
                Err(e) => {
                    reply.error(io_error_to_libc(&e));
                    return;
                }
            }
        }
        if let Err(e) = self.copy_up(src_ino) {
            reply.error(e);
            return;
        }

        // a visible destination directory must be empty in the merged
        // view; its upper remnants (whiteout markers) are cleared so the
        // rename can land
        if let Some(dest) = dest_ino {
            let dest_node = self.node_snapshot(dest);
            if let Some(dest_node) = dest_node {
                if dest_node.is_dir() {
                    match self.merge_dir(&dest_node) {
                        Ok(merged) if !merged.is_empty() => {
                            reply.error(libc::ENOTEMPTY);
                            return;
                        }
                        Ok(_) => {
                            if self.upper_index() == Some(dest_node.layer) {
                                if let Err(e) = self.empty_upper_dir(&dest_node.path) {
                                    reply.error(io_error_to_libc(&e));
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            reply.error(io_error_to_libc(&e));
                            return;
                        }
                    }
                }
            }
        }

        let upper = self.upper_layer().expect("checked above");
        let src_rel = parent_rel.join(name);
        let dst_rel = newparent_rel.join(newname);
        let src_exposed = self.lower_exposes(&parent_node, name);

        // an on-disk whiteout at the destination can migrate to the
        // source side in one atomic exchange
        let dest_is_whiteout = upper
            .store
            .stat_at(&dst_rel)
            .map(|m| Whiteout::is_whiteout_device(&m))
            .unwrap_or(false);

        let rename_result = if dest_is_whiteout && src_exposed {
            upper.store.exchange_at(&src_rel, &dst_rel)
        } else if src_exposed && self.can_mknod {
            match layer::rename_whiteout_paths(&upper.path(&src_rel), &upper.path(&dst_rel)) {
                Ok(()) => Ok(()),
                Err(_) => upper
                    .store
                    .rename_at(&src_rel, &dst_rel)
                    .and_then(|()| self.create_whiteout(&parent_node, name, true)),
            }
        } else {
            upper.store.rename_at(&src_rel, &dst_rel).and_then(|()| {
                if src_exposed {
                    self.create_whiteout(&parent_node, name, true)
                } else {
                    Ok(())
                }
            })
        };
        if let Err(e) = rename_result {
            reply.error(io_error_to_libc(&e));
            return;
        }

        // the destination name must not stay covered
        let _ = Whiteout::delete(&upper.path(&newparent_rel), newname);

        // a directory landing on a name lower layers still expose must
        // block the merge with their same-named directories
        let landed_opaque =
            src_is_dir && self.lower_exposes(&newparent_node, newname);
        if landed_opaque {
            let _ = whiteout::set_opaque(&upper.path(&dst_rel));
        }

        if let Some(dest) = dest_ino {
            self.drop_tree_entry(newparent, newname, dest);
        }
        self.clear_tombstone(newparent, newname);
        {
            let mut nodes = self.nodes.write();
            nodes.remove_child(parent, name);
            nodes.add_child(newparent, newname.to_os_string(), src_ino);
            if let Some(n) = nodes.get_mut(src_ino) {
                n.parent = newparent;
                n.name = newname.to_os_string();
                if landed_opaque {
                    n.last_layer = self.upper_index();
                }
            }
            nodes.update_paths(src_ino);
        }
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        tracing::debug!("link(ino={} -> {}, {:?})", ino, newparent, newname);
        let _guard = self.big_lock.lock();

        if let Err(errno) = self.check_name(newname) {
            reply.error(errno);
            return;
        }
        if self.upper_index().is_none() {
            reply.error(libc::EROFS);
            return;
        }
        match self.resolve_child(newparent, newname) {
            Ok(Some(_)) => {
                reply.error(libc::EEXIST);
                return;
            }
            Ok(None) => {}
            Err(errno) => {
                reply.error(errno);
                return;
            }
        }
        if let Err(e) = self.copy_up(ino).and_then(|_| self.copy_up(newparent)) {
            reply.error(e);
            return;
        }

        match self.register_link(ino, newparent, newname) {
            Ok((_, attrs)) => reply.entry(&self.ttl, &attrs, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        let guard = self.big_lock.lock();

        if self.node_snapshot(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }
        let wants_write = (flags & libc::O_ACCMODE) != libc::O_RDONLY;

        // the copy-up content loop is the long-running part; it runs
        // without the big lock
        drop(guard);

        if wants_write {
            if let Err(e) = self.copy_up(ino) {
                reply.error(e);
                return;
            }
        }

        let _guard = self.big_lock.lock();
        let Some(node) = self.node_snapshot(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let encrypted = self.engaged(&node);
        let full = self.layers[node.layer].path(&node.path);

        // O_WRONLY is widened to O_RDWR so the cipher can read-modify-
        // write partial blocks
        let file = match std::fs::OpenOptions::new()
            .read(true)
            .write(wants_write)
            .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
            .open(&full)
        {
            Ok(f) => f,
            Err(e) => {
                reply.error(io_error_to_libc(&e));
                return;
            }
        };

        if wants_write && (flags & libc::O_TRUNC) != 0 {
            if let Err(e) = file.set_len(0) {
                reply.error(io_error_to_libc(&e));
                return;
            }
            self.node_cipher(ino).invalidate();
            self.nodes.write().update_size(ino, 0);
        }

        let fh = self.alloc_fh();
        self.handles.write().insert(
            fh,
            FileHandle {
                file: Arc::new(Mutex::new(file)),
                encrypted,
            },
        );
        if let Some(node) = self.nodes.write().get_mut(ino) {
            node.open_handles += 1;
        }
        reply.opened(fh, 0);
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!(
            "create(parent={}, name={:?}, mode={:#o}, flags={:#x})",
            parent,
            name,
            mode,
            flags
        );
        let _guard = self.big_lock.lock();

        if let Err(errno) = self.check_name(name) {
            reply.error(errno);
            return;
        }
        if self.upper_index().is_none() {
            reply.error(libc::EROFS);
            return;
        }
        match self.resolve_child(parent, name) {
            Ok(Some(_)) => {
                reply.error(libc::EEXIST);
                return;
            }
            Ok(None) => {}
            Err(errno) => {
                reply.error(errno);
                return;
            }
        }
        if let Err(e) = self.copy_up(parent) {
            reply.error(e);
            return;
        }

        let Some(staging) = self.next_staging_path() else {
            reply.error(libc::EROFS);
            return;
        };
        let uid = self.idmap.uid_to_host(req.uid());
        let gid = self.idmap.gid_to_host(req.gid());

        let file = match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(&staging)
        {
            Ok(f) => f,
            Err(e) => {
                reply.error(io_error_to_libc(&e));
                return;
            }
        };

        let finish = || -> io::Result<()> {
            self.apply_ownership(&staging, uid, gid, mode & 0o7777)?;
            let parent_path = self
                .node_snapshot(parent)
                .map(|p| p.path)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
            let upper = self.upper_layer().expect("checked above");
            let dest = upper.path(&parent_path.join(name));
            std::fs::rename(&staging, &dest)?;
            Whiteout::delete(&upper.path(&parent_path), name)?;
            Ok(())
        };
        if let Err(e) = finish() {
            let _ = std::fs::remove_file(&staging);
            reply.error(io_error_to_libc(&e));
            return;
        }

        match self.finish_entry_creation(parent, name) {
            Ok((new_ino, attrs)) => {
                let fh = self.alloc_fh();
                self.handles.write().insert(
                    fh,
                    FileHandle {
                        file: Arc::new(Mutex::new(file)),
                        encrypted: true,
                    },
                );
                if let Some(node) = self.nodes.write().get_mut(new_ino) {
                    node.open_handles += 1;
                }
                reply.created(&self.ttl, &attrs, 0, fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        let _guard = self.big_lock.lock();

        let (file_arc, encrypted) = {
            let handles = self.handles.read();
            match handles.get(&fh) {
                Some(h) => (Arc::clone(&h.file), h.encrypted),
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        let file = file_arc.lock();
        let mut buf = vec![0u8; size as usize];

        let result = if encrypted {
            let cipher = self.node_cipher(ino);
            self.engine.read_blocks(&cipher, &file, offset as u64, &mut buf)
        } else {
            file.read_at(&mut buf, offset as u64)
        };

        match result {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => {
                tracing::error!("read failed: {}", e);
                reply.error(io_error_to_libc(&e));
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::trace!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        let _guard = self.big_lock.lock();

        let (file_arc, encrypted) = {
            let handles = self.handles.read();
            match handles.get(&fh) {
                Some(h) => (Arc::clone(&h.file), h.encrypted),
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        let file = file_arc.lock();

        let result = if encrypted {
            let cipher = self.node_cipher(ino);
            file.metadata().and_then(|meta| {
                self.engine
                    .write_blocks(&cipher, &file, meta.len(), offset as u64, data)
            })
        } else {
            file.write_all_at(data, offset as u64).map(|()| data.len())
        };

        match result {
            Ok(n) => {
                let new_end = offset as u64 + n as u64;
                let mut nodes = self.nodes.write();
                if let Some(node) = nodes.get_mut(ino) {
                    if new_end > node.attrs.size {
                        node.attrs.size = new_end;
                    }
                }
                reply.written(n as u32);
            }
            Err(e) => {
                tracing::error!("write failed: {}", e);
                reply.error(io_error_to_libc(&e));
            }
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let _guard = self.big_lock.lock();
        if !self.handles.read().contains_key(&fh) {
            reply.error(libc::EBADF);
            return;
        }
        self.refresh_attrs(ino);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let _guard = self.big_lock.lock();
        self.handles.write().remove(&fh);

        let evict = {
            let mut nodes = self.nodes.write();
            if let Some(node) = nodes.get_mut(ino) {
                node.open_handles = node.open_handles.saturating_sub(1);
                node.hidden
                    && node.lookups == 0
                    && node.nlink_refs == 0
                    && node.open_handles == 0
            } else {
                false
            }
        };
        if evict {
            self.nodes.write().remove(ino);
            self.drop_node_state(ino);
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        if !self.settings.fsync {
            reply.ok();
            return;
        }
        let file_arc = {
            let handles = self.handles.read();
            match handles.get(&fh) {
                Some(h) => Arc::clone(&h.file),
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        let file = file_arc.lock();
        let result = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn fsyncdir(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        tracing::debug!("opendir(ino={})", ino);
        let _guard = self.big_lock.lock();

        match self.dir_snapshot(ino) {
            Ok(entries) => {
                let fh = self.alloc_fh();
                self.dir_handles.write().insert(fh, Arc::new(entries));
                reply.opened(fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles.write().remove(&fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);
        let _guard = self.big_lock.lock();

        // serve from the snapshot fixed at opendir; fall back to a fresh
        // one for transports that never opened the stream
        let snapshot = self.dir_handles.read().get(&fh).cloned();
        let entries = match snapshot {
            Some(entries) => entries,
            None => match self.dir_snapshot(ino) {
                Ok(entries) => Arc::new(entries),
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            },
        };

        for (idx, (entry_ino, kind, name)) in entries.iter().enumerate() {
            if (idx as i64) < offset {
                continue;
            }
            if reply.add(*entry_ino, (idx + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match nix::sys::statvfs::statvfs(self.layers[0].store.root()) {
            Ok(st) => {
                // reserve room for the fallback whiteout prefix
                let namemax =
                    (st.name_max() as u32).saturating_sub(WHITEOUT_PREFIX.len() as u32);
                reply.statfs(
                    st.blocks() as u64,
                    st.blocks_free() as u64,
                    st.blocks_available() as u64,
                    st.files() as u64,
                    st.files_free() as u64,
                    st.block_size() as u32,
                    namemax,
                    st.fragment_size() as u32,
                );
            }
            Err(e) => reply.error(e as i32),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let _guard = self.big_lock.lock();
        let Some(attrs) = self.refresh_attrs(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if mask == libc::F_OK || req.uid() == 0 {
            reply.ok();
            return;
        }

        let perm = attrs.perm as i32;
        let granted = if req.uid() == attrs.uid {
            (perm >> 6) & 0o7
        } else if req.gid() == attrs.gid {
            (perm >> 3) & 0o7
        } else {
            perm & 0o7
        };
        if mask & !granted != 0 {
            reply.error(libc::EACCES);
        } else {
            reply.ok();
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let _guard = self.big_lock.lock();
        if self.settings.noxattrs {
            reply.error(libc::ENOTSUP);
            return;
        }
        if copy_up::is_reserved_xattr(name) {
            reply.error(libc::EPERM);
            return;
        }
        if let Err(e) = self.copy_up(ino) {
            reply.error(e);
            return;
        }
        let Some(node) = self.node_snapshot(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = self.layers[node.layer].path(&node.path);
        match xattr::set(&path, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let _guard = self.big_lock.lock();
        if self.settings.noxattrs {
            reply.error(libc::ENOTSUP);
            return;
        }
        if copy_up::is_reserved_xattr(name) {
            reply.error(libc::ENODATA);
            return;
        }
        let Some(node) = self.node_snapshot(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.layers[node.layer].store.get_xattr(&node.path, name) {
            Ok(Some(value)) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if size >= value.len() as u32 {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Ok(None) => reply.error(libc::ENODATA),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let _guard = self.big_lock.lock();
        if self.settings.noxattrs {
            reply.error(libc::ENOTSUP);
            return;
        }
        let Some(node) = self.node_snapshot(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.layers[node.layer].store.list_xattr(&node.path) {
            Ok(names) => {
                let mut data = Vec::new();
                for name in names {
                    if copy_up::is_reserved_xattr(&name) {
                        continue;
                    }
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                }
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if size >= data.len() as u32 {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let _guard = self.big_lock.lock();
        if self.settings.noxattrs {
            reply.error(libc::ENOTSUP);
            return;
        }
        if copy_up::is_reserved_xattr(name) {
            reply.error(libc::EPERM);
            return;
        }
        if let Err(e) = self.copy_up(ino) {
            reply.error(e);
            return;
        }
        let Some(node) = self.node_snapshot(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = self.layers[node.layer].path(&node.path);
        match xattr::remove(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let guard = self.big_lock.lock();
        if mode != 0 {
            reply.error(libc::EOPNOTSUPP);
            return;
        }
        let (file_arc, encrypted) = {
            let handles = self.handles.read();
            match handles.get(&fh) {
                Some(h) => (Arc::clone(&h.file), h.encrypted),
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        drop(guard);

        let file = file_arc.lock();
        let target = offset as u64 + length as u64;
        let result = file.metadata().and_then(|meta| {
            let size = meta.len();
            if target <= size {
                return Ok(());
            }
            if encrypted {
                let cipher = self.node_cipher(ino);
                self.engine.pad_file(&cipher, &file, size, target, true)?;
            }
            if file.metadata()?.len() < target {
                file.set_len(target)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                let mut nodes = self.nodes.write();
                if let Some(node) = nodes.get_mut(ino) {
                    if target > node.attrs.size {
                        node.attrs.size = target;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }
}

/// Mount the overlay in the foreground on `mountpoint`; returns when the
/// filesystem is unmounted.
pub fn mount(settings: Settings, mountpoint: &Path) -> Result<()> {
    let fs = VeilFs::new(settings)?;
    let options = vec![
        MountOption::FSName("veilfs".to_string()),
        MountOption::AutoUnmount,
    ];
    fuser::mount2(fs, mountpoint, &options).map_err(|e| VeilError::Fuse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Scratch {
        _dir: TempDir,
        lower: PathBuf,
        upper: PathBuf,
        work: PathBuf,
    }

    fn scratch() -> Scratch {
        let dir = tempdir().unwrap();
        let lower = dir.path().join("lower");
        let upper = dir.path().join("upper");
        let work = dir.path().join("work");
        fs::create_dir_all(&lower).unwrap();
        fs::create_dir_all(&upper).unwrap();
        fs::create_dir_all(&work).unwrap();
        Scratch {
            _dir: dir,
            lower,
            upper,
            work,
        }
    }

    fn overlay(s: &Scratch) -> VeilFs {
        let settings = Settings {
            lowerdirs: vec![s.lower.clone()],
            upperdir: Some(s.upper.clone()),
            workdir: Some(s.work.clone()),
            ..Settings::default()
        };
        VeilFs::new(settings).unwrap()
    }

    fn read_only_overlay(s: &Scratch) -> VeilFs {
        let settings = Settings {
            lowerdirs: vec![s.lower.clone()],
            ..Settings::default()
        };
        VeilFs::new(settings).unwrap()
    }

    fn resolve_path(fs: &VeilFs, components: &[&str]) -> Option<u64> {
        let mut ino = FUSE_ROOT_ID;
        for name in components {
            ino = fs.resolve_child(ino, OsStr::new(name)).unwrap()?;
        }
        Some(ino)
    }

    #[test]
    fn lower_file_resolves_without_touching_upper() {
        let s = scratch();
        fs::create_dir(s.lower.join("a")).unwrap();
        fs::write(s.lower.join("a/x.txt"), b"hello\n").unwrap();
        let overlay = overlay(&s);

        let ino = resolve_path(&overlay, &["a", "x.txt"]).unwrap();
        let node = overlay.node_snapshot(ino).unwrap();
        assert_eq!(node.layer, 1); // the lower layer provides it
        assert_eq!(node.attrs.size, 6);

        // nothing appeared in the upper layer
        assert!(!s.upper.join("a").exists());
    }

    #[test]
    fn whiteout_marker_names_are_invalid_lookups() {
        let s = scratch();
        let overlay = overlay(&s);
        let node = overlay.node_snapshot(FUSE_ROOT_ID).unwrap();
        // scan_layers is never reached for marker names; the handler
        // rejects them, mirrored here via check_name
        assert_eq!(overlay.check_name(OsStr::new(".wh.x")), Err(libc::EINVAL));
        assert!(overlay.scan_layers(&node, OsStr::new("absent")).unwrap().is_none());
    }

    #[test]
    fn copy_up_encrypts_and_preserves_length_and_mtime() {
        let s = scratch();
        fs::create_dir(s.lower.join("a")).unwrap();
        fs::write(s.lower.join("a/x.txt"), b"hello\n").unwrap();
        let overlay = overlay(&s);

        let ino = resolve_path(&overlay, &["a", "x.txt"]).unwrap();
        overlay.copy_up(ino).unwrap();

        let upper_file = s.upper.join("a/x.txt");
        assert!(upper_file.exists());

        // ciphertext size equals plaintext size, but content differs
        let raw = fs::read(&upper_file).unwrap();
        assert_eq!(raw.len(), 6);
        assert_ne!(raw, b"hello\n");

        // mtime carried over from the lower file
        let src_meta = fs::metadata(s.lower.join("a/x.txt")).unwrap();
        let dst_meta = fs::metadata(&upper_file).unwrap();
        assert_eq!(src_meta.mtime(), dst_meta.mtime());

        // the node now reports the upper layer
        let node = overlay.node_snapshot(ino).unwrap();
        assert_eq!(Some(node.layer), overlay.upper_index());

        // and decodes back to the original bytes
        let file = fs::File::open(&upper_file).unwrap();
        let cipher = overlay.node_cipher(ino);
        let mut buf = vec![0u8; 16];
        let n = overlay.engine.read_blocks(&cipher, &file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn write_after_copy_up_reads_back_modified() {
        let s = scratch();
        fs::create_dir(s.lower.join("a")).unwrap();
        fs::write(s.lower.join("a/x.txt"), b"hello\n").unwrap();
        let overlay = overlay(&s);

        let ino = resolve_path(&overlay, &["a", "x.txt"]).unwrap();
        overlay.copy_up(ino).unwrap();

        let upper_file = s.upper.join("a/x.txt");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&upper_file)
            .unwrap();
        let cipher = overlay.node_cipher(ino);
        overlay
            .engine
            .write_blocks(&cipher, &file, 6, 0, b"H")
            .unwrap();

        let mut buf = vec![0u8; 16];
        let n = overlay.engine.read_blocks(&cipher, &file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello\n");
        assert_eq!(fs::metadata(&upper_file).unwrap().len(), 6);
    }

    #[test]
    fn unlink_covers_lower_name_with_whiteout() {
        let s = scratch();
        fs::create_dir(s.lower.join("a")).unwrap();
        fs::write(s.lower.join("a/x.txt"), b"hello\n").unwrap();
        let overlay = overlay(&s);

        // parent must exist on the upper layer before a whiteout can land
        let dir_ino = resolve_path(&overlay, &["a"]).unwrap();
        overlay.copy_up(dir_ino).unwrap();
        let dir = overlay.node_snapshot(dir_ino).unwrap();

        assert!(overlay.lower_exposes(&dir, OsStr::new("x.txt")));
        overlay
            .create_whiteout(&dir, OsStr::new("x.txt"), false)
            .unwrap();
        assert!(Whiteout::covers(&s.upper.join("a"), OsStr::new("x.txt")));

        // a fresh scan now sees the name as deleted
        match overlay.scan_layers(&dir, OsStr::new("x.txt")).unwrap() {
            Some(Discovered::Whiteout) => {}
            _ => panic!("expected whiteout coverage"),
        }
    }

    #[test]
    fn whiteout_is_noop_when_nothing_is_exposed() {
        let s = scratch();
        let overlay = overlay(&s);
        let root = overlay.node_snapshot(FUSE_ROOT_ID).unwrap();
        overlay
            .create_whiteout(&root, OsStr::new("ghost"), false)
            .unwrap();
        assert!(!Whiteout::covers(&s.upper, OsStr::new("ghost")));
    }

    #[test]
    fn opaque_parent_cuts_lower_exposure_off() {
        let s = scratch();
        fs::create_dir(s.lower.join("d")).unwrap();
        fs::write(s.lower.join("d/kept"), b"x").unwrap();
        let overlay = overlay(&s);

        let dir_ino = resolve_path(&overlay, &["d"]).unwrap();
        overlay.copy_up(dir_ino).unwrap();
        let dir = overlay.node_snapshot(dir_ino).unwrap();
        assert!(overlay.lower_exposes(&dir, OsStr::new("kept")));

        // once the upper side is opaque the lower entry is out of the
        // merge, so deleting needs no whiteout either
        whiteout::set_opaque(&s.upper.join("d")).unwrap();
        assert!(!overlay.lower_exposes(&dir, OsStr::new("kept")));
    }

    #[test]
    fn mkdir_over_lower_file_is_detected_as_existing() {
        let s = scratch();
        fs::create_dir(s.lower.join("a")).unwrap();
        fs::write(s.lower.join("a/sub"), b"i am a file").unwrap();
        let overlay = overlay(&s);

        let dir_ino = resolve_path(&overlay, &["a"]).unwrap();
        // the mkdir handler replies EEXIST when the name resolves
        assert!(overlay
            .resolve_child(dir_ino, OsStr::new("sub"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn fresh_directory_is_born_opaque_and_empty() {
        let s = scratch();
        let overlay = overlay(&s);

        let spec = copy_up::DirSpec {
            mode: 0o755,
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
            src: None,
            opaque: true,
        };
        overlay.create_directory(Path::new("./b"), spec).unwrap();

        let upper_b = s.upper.join("b");
        assert!(upper_b.is_dir());
        assert!(whiteout::is_opaque(&upper_b));

        // later-grown lower content stays hidden behind the opaque marker
        fs::create_dir(s.lower.join("b")).unwrap();
        fs::write(s.lower.join("b/surprise"), b"x").unwrap();
        let merged = overlay.merge_dir_at(Path::new("./b"), 0, None).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn merge_shadows_and_hides() {
        let s = scratch();
        fs::write(s.lower.join("both"), b"lower").unwrap();
        fs::write(s.lower.join("only_lower"), b"lower").unwrap();
        fs::write(s.lower.join("deleted"), b"lower").unwrap();
        fs::write(s.upper.join("both"), b"upper").unwrap();
        fs::File::create(s.upper.join(".wh.deleted")).unwrap();
        let overlay = overlay(&s);

        let root = overlay.node_snapshot(FUSE_ROOT_ID).unwrap();
        let merged = overlay.merge_dir(&root).unwrap();

        assert_eq!(merged.get(OsStr::new("both")).map(|(l, _)| *l), Some(0));
        assert_eq!(
            merged.get(OsStr::new("only_lower")).map(|(l, _)| *l),
            Some(1)
        );
        assert!(!merged.contains_key(OsStr::new("deleted")));
        assert!(!merged.contains_key(OsStr::new(".wh.deleted")));
    }

    #[test]
    fn hard_links_share_one_overlay_inode() {
        let s = scratch();
        fs::write(s.lower.join("a"), b"data").unwrap();
        fs::hard_link(s.lower.join("a"), s.lower.join("b")).unwrap();
        let overlay = overlay(&s);

        let a = resolve_path(&overlay, &["a"]).unwrap();
        let b = resolve_path(&overlay, &["b"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(overlay.node_snapshot(a).unwrap().nlink_refs, 2);
    }

    #[test]
    fn hard_link_then_copy_up_converges_on_one_node() {
        let s = scratch();
        fs::write(s.lower.join("f"), b"linked payload").unwrap();
        let overlay = overlay(&s);

        let ino = resolve_path(&overlay, &["f"]).unwrap();
        // the link handler promotes the source before linking
        overlay.copy_up(ino).unwrap();

        let (linked, attrs) = overlay
            .register_link(ino, FUSE_ROOT_ID, OsStr::new("g"))
            .unwrap();
        assert_eq!(linked, ino, "the new name must intern to the existing node");
        assert_eq!(attrs.nlink, 2);
        assert_eq!(overlay.node_snapshot(ino).unwrap().nlink_refs, 2);
        assert_eq!(resolve_path(&overlay, &["g"]), Some(ino));

        // promoting the other name is a no-op, not a second copy
        overlay.copy_up(linked).unwrap();

        // one backing file behind both upper names
        let f_meta = fs::metadata(s.upper.join("f")).unwrap();
        let g_meta = fs::metadata(s.upper.join("g")).unwrap();
        assert_eq!(f_meta.ino(), g_meta.ino());
        assert_eq!(f_meta.nlink(), 2);

        // and the shared content decodes through either name
        let file = fs::File::open(s.upper.join("g")).unwrap();
        let cipher = overlay.node_cipher(ino);
        let mut buf = vec![0u8; 32];
        let n = overlay.engine.read_blocks(&cipher, &file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"linked payload");
    }

    #[test]
    fn read_only_stack_refuses_promotion() {
        let s = scratch();
        fs::write(s.lower.join("f"), b"x").unwrap();
        let overlay = read_only_overlay(&s);

        let ino = resolve_path(&overlay, &["f"]).unwrap();
        assert_eq!(overlay.copy_up(ino), Err(libc::EROFS));
    }

    #[test]
    fn lower_directory_subtree_is_cross_device_for_rename() {
        let s = scratch();
        fs::create_dir(s.lower.join("d")).unwrap();
        fs::write(s.lower.join("d/f"), b"x").unwrap();
        let overlay = overlay(&s);

        let dir_ino = resolve_path(&overlay, &["d"]).unwrap();
        assert!(!overlay.subtree_all_upper(dir_ino).unwrap());

        // after promoting the directory itself, the child still pins the
        // subtree to the lower layer
        overlay.copy_up(dir_ino).unwrap();
        assert!(!overlay.subtree_all_upper(dir_ino).unwrap());
    }

    #[test]
    fn copy_up_carries_user_xattrs_and_origin() {
        let s = scratch();
        fs::write(s.lower.join("f"), b"payload").unwrap();
        if xattr::set(s.lower.join("f"), "user.note", b"kept").is_err() {
            // scratch filesystem without xattr support
            return;
        }
        let overlay = overlay(&s);

        let ino = resolve_path(&overlay, &["f"]).unwrap();
        overlay.copy_up(ino).unwrap();

        let upper_file = s.upper.join("f");
        assert_eq!(
            xattr::get(&upper_file, "user.note").unwrap().as_deref(),
            Some(b"kept".as_ref())
        );
        let origin = xattr::get(&upper_file, whiteout::ORIGIN_XATTR)
            .unwrap()
            .unwrap();
        assert_eq!(
            lookup::parse_origin_path(&origin),
            Some(PathBuf::from("./f"))
        );
    }

    #[test]
    fn readdir_snapshot_is_fixed_at_enumeration() {
        use std::ffi::OsString;

        let s = scratch();
        fs::write(s.lower.join("a"), b"1").unwrap();
        let overlay = overlay(&s);

        let snapshot = overlay.dir_snapshot(FUSE_ROOT_ID).unwrap();
        assert_eq!(snapshot[0].2, OsString::from("."));
        assert_eq!(snapshot[1].2, OsString::from(".."));
        assert!(snapshot.iter().any(|(_, _, n)| n.as_os_str() == OsStr::new("a")));

        // an entry grown after the table was built is not visible in it
        fs::write(s.lower.join("b"), b"2").unwrap();
        assert!(!snapshot.iter().any(|(_, _, n)| n.as_os_str() == OsStr::new("b")));

        let fresh = overlay.dir_snapshot(FUSE_ROOT_ID).unwrap();
        assert!(fresh.iter().any(|(_, _, n)| n.as_os_str() == OsStr::new("b")));
    }

    #[test]
    fn forget_evicts_unreferenced_nodes() {
        let s = scratch();
        fs::write(s.lower.join("f"), b"x").unwrap();
        let overlay = overlay(&s);

        let ino = resolve_path(&overlay, &["f"]).unwrap();
        overlay.bump_lookup(ino);
        // still referenced by the children map
        assert!(!overlay.nodes.write().forget(ino, 1));

        overlay.drop_tree_entry(FUSE_ROOT_ID, OsStr::new("f"), ino);
        assert!(overlay.node_snapshot(ino).is_none());
    }
}
