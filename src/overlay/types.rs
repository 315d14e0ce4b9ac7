use fuser::{FileAttr, FileType, FUSE_ROOT_ID};
use fxhash::hash64;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Which half of the layer stack a directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LayerKind {
    Upper,
    Lower,
}

/// One layer root. Index 0 is the upper layer when an upperdir is
/// configured; the remainder are lowers in precedence order (earlier
/// shadows later).
#[derive(Debug, Clone)]
pub(crate) struct Layer {
    pub index: usize,
    pub kind: LayerKind,
    pub store: crate::overlay::layer::DirLayer,
}

impl Layer {
    pub fn new(index: usize, kind: LayerKind, root: PathBuf) -> Self {
        Layer {
            index,
            kind,
            store: crate::overlay::layer::DirLayer::new(root),
        }
    }

    pub fn is_upper(&self) -> bool {
        self.kind == LayerKind::Upper
    }

    /// Absolute path of an overlay-relative path inside this layer.
    pub fn path(&self, rel: &std::path::Path) -> PathBuf {
        self.store.full_path(rel)
    }
}

/// A directory-entry identity within the overlay tree.
///
/// Whiteout nodes are tombstones: they sit in the children map so a later
/// lookup knows the name is deleted, but they are never surfaced in a
/// reply and carry no meaningful attributes.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub ino: u64,
    pub parent: u64,
    pub name: OsString,
    /// Overlay-relative path ("." for the root).
    pub path: PathBuf,
    /// Index of the layer currently providing this name's content.
    pub layer: usize,
    /// Deepest layer with a visible entry for this name. Lookup never
    /// descends past it; `Some(0)` on a merged stack with an upper layer
    /// means the entry is upper-only.
    pub last_layer: Option<usize>,
    pub attrs: FileAttr,
    pub whiteout: bool,
    /// Moved out of the tree pending destruction (deleted while open).
    pub hidden: bool,
    /// Identity of the backing file, used to intern hard links.
    pub src_dev: u64,
    pub src_ino: u64,
    /// Kernel lookup count; the node may only be evicted once this
    /// reaches zero via forget.
    pub lookups: u64,
    /// Directory references to this node (hard-link aliases share it).
    pub nlink_refs: u32,
    pub open_handles: u64,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.attrs.kind == FileType::Directory
    }
}

/// In-memory node graph: overlay ino -> Node, per-directory children maps,
/// and an interning table from backing `(dev, ino)` to the canonical
/// overlay inode so hard links resolve to one identity.
///
/// Children maps are keyed by a 64-bit FxHash of the entry name; the stored
/// name is compared byte-for-byte on lookup so a hash collision can never
/// alias two names.
#[derive(Debug, Default)]
pub(crate) struct NodeTable {
    nodes: HashMap<u64, Node>,
    children: HashMap<u64, HashMap<u64, (OsString, u64)>>,
    by_identity: HashMap<(u64, u64), u64>,
    next_ino: u64,
}

impl NodeTable {
    pub fn new() -> Self {
        NodeTable {
            nodes: HashMap::new(),
            children: HashMap::new(),
            by_identity: HashMap::new(),
            // FUSE reserves inode 1 for the root directory
            next_ino: 2,
        }
    }

    pub fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino = self.next_ino.wrapping_add(1);
        ino
    }

    /// Canonical overlay inode for a backing identity, if one is already
    /// registered. Whiteouts and hidden nodes never intern.
    pub fn canonical_ino(&self, dev: u64, ino: u64) -> Option<u64> {
        self.by_identity.get(&(dev, ino)).copied()
    }

    /// Register an additional backing identity for an existing node.
    /// Copy-up uses this so a promoted file answers to both its lower
    /// origin and its new upper identity.
    pub fn alias_identity(&mut self, dev: u64, ino: u64, node_ino: u64) {
        self.by_identity.entry((dev, ino)).or_insert(node_ino);
    }

    pub fn insert(&mut self, node: Node) {
        if node.ino != FUSE_ROOT_ID && !node.hidden {
            let name_hash = hash64(node.name.as_bytes());
            self.children
                .entry(node.parent)
                .or_default()
                .insert(name_hash, (node.name.clone(), node.ino));
        }
        if !node.whiteout {
            self.by_identity
                .entry((node.src_dev, node.src_ino))
                .or_insert(node.ino);
        }
        self.nodes.insert(node.ino, node);
    }

    pub fn peek(&self, ino: u64) -> Option<&Node> {
        self.nodes.get(&ino)
    }

    pub fn get_mut(&mut self, ino: u64) -> Option<&mut Node> {
        self.nodes.get_mut(&ino)
    }

    pub fn update_attrs(&mut self, ino: u64, attrs: FileAttr) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.attrs = attrs;
        }
    }

    pub fn update_size(&mut self, ino: u64, new_size: u64) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.attrs.size = new_size;
        }
    }

    /// Look up a child by name within a parent directory. Whiteout
    /// tombstones are returned too; callers decide how to surface them.
    pub fn lookup_child(&self, parent: u64, name: &OsStr) -> Option<u64> {
        let name_hash = hash64(name.as_bytes());
        self.children
            .get(&parent)
            .and_then(|map| map.get(&name_hash))
            .filter(|(stored, _)| stored.as_os_str() == name)
            .map(|&(_, ino)| ino)
            .filter(|ino| self.nodes.contains_key(ino))
    }

    pub fn add_child(&mut self, parent: u64, name: OsString, ino: u64) {
        let name_hash = hash64(name.as_bytes());
        self.children
            .entry(parent)
            .or_default()
            .insert(name_hash, (name, ino));
    }

    pub fn remove_child(&mut self, parent: u64, name: &OsStr) {
        let name_hash = hash64(name.as_bytes());
        if let Some(map) = self.children.get_mut(&parent) {
            if map
                .get(&name_hash)
                .is_some_and(|(stored, _)| stored.as_os_str() == name)
            {
                map.remove(&name_hash);
            }
        }
    }

    /// Drop `n` kernel references. Returns true when the node has no
    /// lookups, no directory references, and no open handles left, i.e.
    /// it can be evicted.
    pub fn forget(&mut self, ino: u64, n: u64) -> bool {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.lookups = node.lookups.saturating_sub(n);
            node.lookups == 0 && node.nlink_refs == 0 && node.open_handles == 0
        } else {
            false
        }
    }

    /// Remove a node entirely, unhooking it from its parent's children
    /// map and every identity it was interned under.
    pub fn remove(&mut self, ino: u64) -> Option<Node> {
        let node = self.nodes.remove(&ino)?;
        let name_hash = hash64(node.name.as_bytes());
        if let Some(map) = self.children.get_mut(&node.parent) {
            if map.get(&name_hash).is_some_and(|&(_, i)| i == ino) {
                map.remove(&name_hash);
            }
        }
        self.by_identity.retain(|_, &mut i| i != ino);
        self.children.remove(&ino);
        Some(node)
    }

    /// Rebuild the overlay-relative path of a node and, recursively, of
    /// every node below it. Called after rename moves a directory.
    pub fn update_paths(&mut self, ino: u64) {
        let Some(node) = self.nodes.get(&ino) else {
            return;
        };
        let parent_path = match self.nodes.get(&node.parent) {
            Some(p) if node.ino != FUSE_ROOT_ID => p.path.clone(),
            _ => return,
        };
        let new_path = parent_path.join(&node.name);
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.path = new_path;
        }
        let child_inos: Vec<u64> = self
            .children
            .get(&ino)
            .map(|m| m.values().map(|&(_, i)| i).collect())
            .unwrap_or_default();
        for child in child_inos {
            self.update_paths(child);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn attrs(ino: u64, kind: FileType) -> FileAttr {
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn node(ino: u64, parent: u64, name: &str, src_ino: u64) -> Node {
        Node {
            ino,
            parent,
            name: OsString::from(name),
            path: PathBuf::from(name),
            layer: 0,
            last_layer: Some(0),
            attrs: attrs(ino, FileType::RegularFile),
            whiteout: false,
            hidden: false,
            src_dev: 1,
            src_ino,
            lookups: 0,
            nlink_refs: 1,
            open_handles: 0,
        }
    }

    #[test]
    fn insert_and_lookup_child() {
        let mut table = NodeTable::new();
        table.insert(node(10, FUSE_ROOT_ID, "a.txt", 100));

        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("a.txt")), Some(10));
        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("b.txt")), None);
    }

    #[test]
    fn identity_interning_shares_inode() {
        let mut table = NodeTable::new();
        table.insert(node(10, FUSE_ROOT_ID, "a", 100));
        // same backing (dev, ino): a hard link
        assert_eq!(table.canonical_ino(1, 100), Some(10));
        assert_eq!(table.canonical_ino(1, 101), None);
    }

    #[test]
    fn lookup_rejects_name_hash_collision() {
        let mut table = NodeTable::new();
        table.insert(node(10, FUSE_ROOT_ID, "a", 100));
        // Force a bogus entry under the same hash slot to prove the
        // byte-equality check guards lookups.
        let hash = hash64(OsStr::new("a").as_bytes());
        table
            .children
            .get_mut(&FUSE_ROOT_ID)
            .unwrap()
            .insert(hash, (OsString::from("other"), 10));
        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("a")), None);
    }

    #[test]
    fn forget_counts_down_to_eviction() {
        let mut table = NodeTable::new();
        let mut n = node(10, FUSE_ROOT_ID, "a", 100);
        n.lookups = 3;
        n.nlink_refs = 0;
        table.insert(n);

        assert!(!table.forget(10, 2));
        assert!(table.forget(10, 1));
        table.remove(10);
        assert_eq!(table.len(), 0);
        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("a")), None);
    }

    #[test]
    fn update_paths_rewrites_subtree() {
        let mut table = NodeTable::new();
        let mut root = node(FUSE_ROOT_ID, 0, "", 1);
        root.path = PathBuf::from(".");
        root.attrs = attrs(FUSE_ROOT_ID, FileType::Directory);
        table.insert(root);

        let mut dir = node(10, FUSE_ROOT_ID, "dir", 100);
        dir.path = PathBuf::from("./dir");
        dir.attrs = attrs(10, FileType::Directory);
        table.insert(dir);

        let mut file = node(11, 10, "f", 101);
        file.path = PathBuf::from("./dir/f");
        table.insert(file);

        // simulate a rename of "dir" to "renamed"
        table.remove_child(FUSE_ROOT_ID, OsStr::new("dir"));
        table.add_child(FUSE_ROOT_ID, OsString::from("renamed"), 10);
        if let Some(n) = table.get_mut(10) {
            n.name = OsString::from("renamed");
        }
        table.update_paths(10);

        assert_eq!(table.peek(10).unwrap().path, PathBuf::from("./renamed"));
        assert_eq!(table.peek(11).unwrap().path, PathBuf::from("./renamed/f"));
    }

    #[test]
    fn whiteout_nodes_do_not_intern_identity() {
        let mut table = NodeTable::new();
        let mut wh = node(10, FUSE_ROOT_ID, "gone", 0);
        wh.whiteout = true;
        wh.src_dev = 0;
        table.insert(wh);
        assert_eq!(table.canonical_ino(0, 0), None);
        // but it still occupies the name
        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("gone")), Some(10));
    }
}
