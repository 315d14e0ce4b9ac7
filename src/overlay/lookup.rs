//! Multi-layer lookup and directory merging.
//!
//! A name is resolved by walking the layer stack from the parent's
//! providing layer downward, stopping at whiteouts, opaque directories,
//! and the parent's recorded last layer. Directories found on several
//! layers merge; anything else shadows everything below it.

use std::collections::{BTreeMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;

use crate::overlay::convert::metadata_to_fileattr;
use crate::overlay::layer::LayerStore;
use crate::overlay::types::Node;
use crate::overlay::whiteout::{self, Whiteout, ORIGIN_XATTR, OPAQUE_WHITEOUT};
use crate::overlay::VeilFs;
use fuser::{FileAttr, FileType};

/// Outcome of walking the stack for one name.
pub(crate) enum Discovered {
    /// A visible entry: the providing layer, the deepest layer taking
    /// part in a directory merge, and the providing layer's stat.
    Entry {
        layer: usize,
        last_layer: usize,
        meta: Metadata,
    },
    /// The name is covered by a whiteout.
    Whiteout,
}

impl VeilFs {
    /// Walk the layers for `(parent, name)`. Returns None when no layer
    /// has a visible entry and nothing covers the name.
    pub(crate) fn scan_layers(
        &self,
        parent: &Node,
        name: &OsStr,
    ) -> io::Result<Option<Discovered>> {
        self.scan_layers_from(parent, name, parent.layer)
    }

    /// The same walk starting at an arbitrary layer; the parent's
    /// recorded last layer still cuts the descent short.
    pub(crate) fn scan_layers_from(
        &self,
        parent: &Node,
        name: &OsStr,
        start: usize,
    ) -> io::Result<Option<Discovered>> {
        let rel = parent.path.join(name);
        let wh_rel = parent.path.join(Whiteout::marker_name(name));
        let end = parent
            .last_layer
            .unwrap_or(self.layers.len().saturating_sub(1));

        let mut found: Option<(usize, Metadata)> = None;
        let mut last = start;

        for idx in start..=end.min(self.layers.len().saturating_sub(1)) {
            let layer = &self.layers[idx];
            match layer.store.stat_at(&rel) {
                Ok(meta) => {
                    if Whiteout::is_whiteout_device(&meta) {
                        if found.is_none() {
                            return Ok(Some(Discovered::Whiteout));
                        }
                        break;
                    }
                    match &found {
                        None => {
                            let is_dir = meta.is_dir();
                            let opaque = is_dir && whiteout::is_opaque(&layer.path(&rel));
                            found = Some((idx, meta));
                            last = idx;
                            if !is_dir || opaque {
                                break;
                            }
                        }
                        Some((_, first)) => {
                            if first.is_dir() && meta.is_dir() {
                                last = idx;
                                if whiteout::is_opaque(&layer.path(&rel)) {
                                    break;
                                }
                            } else {
                                // a non-directory below a merged directory
                                // takes no part in the merge
                                break;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if layer.store.file_exists(&wh_rel) {
                        if found.is_none() {
                            return Ok(Some(Discovered::Whiteout));
                        }
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(found.map(|(layer, meta)| Discovered::Entry {
            layer,
            last_layer: last,
            meta,
        }))
    }

    /// True when removing the upper entry for `name` would still leave
    /// it visible from a lower layer. This is the same walk, whiteout
    /// handling and opacity cutoff as [`Self::scan_layers`], restricted
    /// to the lower half of the stack, so the whiteout-creation decision
    /// cannot diverge from the merged view.
    pub(crate) fn lower_exposes(&self, parent: &Node, name: &OsStr) -> bool {
        let Some(upper) = self.upper_index() else {
            return false;
        };
        // an upper-only or opaque parent cuts every lower layer off
        if parent.last_layer == Some(upper) {
            return false;
        }
        let upper_parent = self.layers[upper].path(&parent.path);
        if upper_parent.is_dir() && whiteout::is_opaque(&upper_parent) {
            return false;
        }
        matches!(
            self.scan_layers_from(parent, name, upper + 1),
            Ok(Some(Discovered::Entry { .. }))
        )
    }

    /// Backing identity used for hard-link interning. An upper entry
    /// carrying an origin xattr keeps the identity of the lower file it
    /// was copied up from.
    pub(crate) fn backing_identity(
        &self,
        layer: usize,
        rel: &std::path::Path,
        meta: &Metadata,
    ) -> (u64, u64) {
        if self.layers[layer].is_upper() && !self.settings.noxattrs {
            if let Ok(Some(value)) = self.layers[layer]
                .store
                .get_xattr(rel, OsStr::new(ORIGIN_XATTR))
            {
                if let Some(origin) = parse_origin_path(&value) {
                    for lower in self.layers.iter().filter(|l| !l.is_upper()) {
                        if let Ok(origin_meta) = lower.store.stat_at(&origin) {
                            return (origin_meta.dev(), origin_meta.ino());
                        }
                    }
                }
            }
        }
        (meta.dev(), meta.ino())
    }

    /// Attributes as presented to the kernel: override-stat applied for
    /// upper entries, ids mapped into the container's view.
    pub(crate) fn attrs_for(
        &self,
        layer: usize,
        rel: &std::path::Path,
        meta: &Metadata,
        ino: u64,
    ) -> FileAttr {
        let mut attrs = metadata_to_fileattr(meta, ino);

        if self.layers[layer].is_upper() {
            let full = self.layers[layer].path(rel);
            let (uid, gid, perm) =
                crate::overlay::idmap::effective_stat(&full, meta, self.settings.xattr_permissions);
            attrs.uid = uid;
            attrs.gid = gid;
            attrs.perm = (perm & 0o7777) as u16;
        }

        attrs.uid = self.idmap.uid_to_container(attrs.uid);
        attrs.gid = self.idmap.gid_to_container(attrs.gid);

        if self.settings.static_nlink && attrs.kind == FileType::Directory {
            attrs.nlink = 1;
        }
        attrs
    }

    /// Materialize a discovered entry into the node table, interning
    /// hard links by backing identity, and return `(ino, attrs)`.
    pub(crate) fn register_entry(
        &self,
        parent_ino: u64,
        name: &OsStr,
        layer: usize,
        last_layer: usize,
        meta: &Metadata,
    ) -> (u64, FileAttr) {
        let (parent_path, rel) = {
            let nodes = self.nodes.read();
            let parent = nodes.peek(parent_ino).expect("parent resolved by caller");
            (parent.path.clone(), parent.path.join(name))
        };
        let (src_dev, src_ino) = self.backing_identity(layer, &rel, meta);

        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.canonical_ino(src_dev, src_ino) {
            // a hard-link alias: another name already carries this
            // identity; hook the new name to the same overlay inode
            if nodes.lookup_child(parent_ino, name) != Some(existing) {
                nodes.add_child(parent_ino, name.to_os_string(), existing);
                if let Some(node) = nodes.get_mut(existing) {
                    node.nlink_refs += 1;
                }
            }
            let attrs = nodes.peek(existing).map(|n| n.attrs);
            if let Some(attrs) = attrs {
                return (existing, attrs);
            }
        }

        let ino = nodes.alloc_ino();
        let attrs = self.attrs_for(layer, &rel, meta, ino);
        nodes.insert(Node {
            ino,
            parent: parent_ino,
            name: name.to_os_string(),
            path: parent_path.join(name),
            layer,
            last_layer: Some(last_layer),
            attrs,
            whiteout: false,
            hidden: false,
            src_dev,
            src_ino,
            lookups: 0,
            nlink_refs: 1,
            open_handles: 0,
        });
        (ino, attrs)
    }

    /// Insert a whiteout tombstone so repeated lookups of a deleted name
    /// short-circuit without touching the layers again.
    pub(crate) fn register_whiteout_node(&self, parent_ino: u64, name: &OsStr) {
        let parent_path = {
            let nodes = self.nodes.read();
            match nodes.peek(parent_ino) {
                Some(p) => p.path.clone(),
                None => return,
            }
        };
        let mut nodes = self.nodes.write();
        let ino = nodes.alloc_ino();
        nodes.insert(Node {
            ino,
            parent: parent_ino,
            name: name.to_os_string(),
            path: parent_path.join(name),
            layer: 0,
            last_layer: None,
            attrs: crate::overlay::sentinel_attrs(ino),
            whiteout: true,
            hidden: false,
            src_dev: 0,
            src_ino: 0,
            lookups: 0,
            nlink_refs: 1,
            open_handles: 0,
        });
    }

    /// Merge the directory's entries across its layer range, honoring
    /// whiteouts and opaque markers. Returns name -> (layer, stat) in
    /// name order.
    pub(crate) fn merge_dir(
        &self,
        dir: &Node,
    ) -> io::Result<BTreeMap<OsString, (usize, Metadata)>> {
        self.merge_dir_at(&dir.path, dir.layer, dir.last_layer)
    }

    pub(crate) fn merge_dir_at(
        &self,
        path: &std::path::Path,
        start_layer: usize,
        last_layer: Option<usize>,
    ) -> io::Result<BTreeMap<OsString, (usize, Metadata)>> {
        let mut merged: BTreeMap<OsString, (usize, Metadata)> = BTreeMap::new();
        let mut hidden: HashSet<OsString> = HashSet::new();

        let start = start_layer;
        let end = last_layer
            .unwrap_or(self.layers.len().saturating_sub(1))
            .min(self.layers.len().saturating_sub(1));

        for idx in start..=end {
            let layer = &self.layers[idx];
            let names = match layer.store.read_dir(path) {
                Ok(names) => names,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            // a .wh. marker hides the name in deeper layers only; an
            // entry in its own layer still wins, so markers are applied
            // after this layer's entries are merged
            let mut opaque_here = false;
            let mut marker_targets: Vec<OsString> = Vec::new();
            for name in names {
                if name == OsStr::new(OPAQUE_WHITEOUT) {
                    opaque_here = true;
                    continue;
                }
                if let Some(target) = Whiteout::extract_target(&name) {
                    marker_targets.push(target);
                    continue;
                }
                if hidden.contains(&name) || merged.contains_key(&name) {
                    continue;
                }
                let meta = match layer.store.stat_at(&path.join(&name)) {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                if Whiteout::is_whiteout_device(&meta) {
                    hidden.insert(name);
                    continue;
                }
                merged.insert(name, (idx, meta));
            }
            hidden.extend(marker_targets);

            if opaque_here || whiteout::is_opaque(&layer.path(path)) {
                break;
            }
        }

        Ok(merged)
    }
}

/// The origin xattr holds either an overlay-relative path string or the
/// kernel's binary file-handle record `{version, magic=0xfb, len, flags,
/// type, uuid[16], fid[]}`. Only the path form can be chased without
/// open_by_handle_at; the binary form is recognized and skipped.
pub(crate) fn parse_origin_path(value: &[u8]) -> Option<std::path::PathBuf> {
    if value.len() >= 2 && value[0] == 0 && value[1] == 0xfb {
        return None;
    }
    let text = std::str::from_utf8(value).ok()?;
    let trimmed = text.trim_end_matches('\0');
    if trimmed.is_empty() {
        None
    } else {
        Some(std::path::PathBuf::from(trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_path_form_parses() {
        assert_eq!(
            parse_origin_path(b"./a/x.txt"),
            Some(std::path::PathBuf::from("./a/x.txt"))
        );
        assert_eq!(parse_origin_path(b""), None);
    }

    #[test]
    fn origin_binary_form_is_recognized_not_chased() {
        // version 0, magic 0xfb, then header bytes
        let record = [0u8, 0xfb, 0x1d, 0, 1];
        assert_eq!(parse_origin_path(&record), None);
    }
}
