//! Host/container id mapping and the xattr permission override.
//!
//! When the backing store cannot express ownership (unprivileged runs),
//! the authoritative `(uid, gid, mode)` of an upper-layer entry is kept
//! as an ASCII `"uid:gid:octal_mode"` triple in an extended attribute,
//! and stat results are overridden from it.

use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::config::{MappingEntry, XattrPermissions};

pub const XATTR_OVERRIDE_STAT: &str = "user.overlay.override_stat";
pub const XATTR_PRIVILEGED_OVERRIDE_STAT: &str = "trusted.overlay.override_stat";

const OVERFLOW_UID_FILE: &str = "/proc/sys/kernel/overflowuid";
const OVERFLOW_GID_FILE: &str = "/proc/sys/kernel/overflowgid";
const DEFAULT_OVERFLOW_ID: u32 = 65534;

fn read_overflow_id(file: &str) -> u32 {
    std::fs::read_to_string(file)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_OVERFLOW_ID)
}

/// Maps ids between the host and the mounted namespace, with optional
/// squashing to constants. Ranges are scanned linearly, first match wins;
/// unmatched ids collapse to the kernel overflow id.
#[derive(Debug, Clone)]
pub struct IdMapper {
    uid_mappings: Vec<MappingEntry>,
    gid_mappings: Vec<MappingEntry>,
    squash_to_root: bool,
    squash_to_uid: Option<u32>,
    squash_to_gid: Option<u32>,
    overflow_uid: u32,
    overflow_gid: u32,
}

impl IdMapper {
    pub fn new(
        uid_mappings: Vec<MappingEntry>,
        gid_mappings: Vec<MappingEntry>,
        squash_to_root: bool,
        squash_to_uid: Option<u32>,
        squash_to_gid: Option<u32>,
    ) -> Self {
        IdMapper {
            uid_mappings,
            gid_mappings,
            squash_to_root,
            squash_to_uid,
            squash_to_gid,
            overflow_uid: read_overflow_id(OVERFLOW_UID_FILE),
            overflow_gid: read_overflow_id(OVERFLOW_GID_FILE),
        }
    }

    fn map(mappings: &[MappingEntry], id: u32, direct: bool, overflow: u32) -> u32 {
        if mappings.is_empty() {
            return id;
        }
        for m in mappings {
            let (from, to) = if direct {
                (m.inner, m.host)
            } else {
                (m.host, m.inner)
            };
            if id >= from && id < from.saturating_add(m.len) {
                return to + (id - from);
            }
        }
        overflow
    }

    /// Container uid -> host uid (used when applying client-supplied ids).
    pub fn uid_to_host(&self, uid: u32) -> u32 {
        Self::map(&self.uid_mappings, uid, true, self.overflow_uid)
    }

    /// Host uid -> container uid (used when presenting stat results).
    pub fn uid_to_container(&self, uid: u32) -> u32 {
        if self.squash_to_root {
            return 0;
        }
        if let Some(forced) = self.squash_to_uid {
            return forced;
        }
        Self::map(&self.uid_mappings, uid, false, self.overflow_uid)
    }

    pub fn gid_to_host(&self, gid: u32) -> u32 {
        Self::map(&self.gid_mappings, gid, true, self.overflow_gid)
    }

    pub fn gid_to_container(&self, gid: u32) -> u32 {
        if self.squash_to_root {
            return 0;
        }
        if let Some(forced) = self.squash_to_gid {
            return forced;
        }
        Self::map(&self.gid_mappings, gid, false, self.overflow_gid)
    }

    /// Whether chown results should be swallowed (ownership is forced).
    pub fn squashed(&self) -> bool {
        self.squash_to_root || self.squash_to_uid.is_some() || self.squash_to_gid.is_some()
    }
}

/// The xattr name carrying the override triple for a given mode, or None
/// when the override mechanism is off.
pub fn override_xattr_name(mode: XattrPermissions) -> Option<&'static str> {
    match mode {
        XattrPermissions::Off => None,
        XattrPermissions::Privileged => Some(XATTR_PRIVILEGED_OVERRIDE_STAT),
        XattrPermissions::Unprivileged => Some(XATTR_OVERRIDE_STAT),
    }
}

/// Parse `"uid:gid:octal_mode"`.
pub fn parse_override(value: &[u8]) -> Option<(u32, u32, u32)> {
    let text = std::str::from_utf8(value).ok()?;
    let mut parts = text.trim_end_matches('\0').splitn(3, ':');
    let uid = parts.next()?.parse().ok()?;
    let gid = parts.next()?.parse().ok()?;
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    Some((uid, gid, mode))
}

/// Read the override triple from a path, if the mechanism is on and the
/// attribute is present and well-formed.
pub fn read_override(path: &Path, mode: XattrPermissions) -> Option<(u32, u32, u32)> {
    let name = override_xattr_name(mode)?;
    let value = xattr::get(path, name).ok()??;
    parse_override(&value)
}

/// Persist the override triple on a path. EPERM is swallowed in
/// unprivileged mode, matching the degraded environments the mode exists
/// for.
pub fn write_override(
    path: &Path,
    mode: XattrPermissions,
    uid: u32,
    gid: u32,
    file_mode: u32,
) -> io::Result<()> {
    let Some(name) = override_xattr_name(mode) else {
        return Ok(());
    };
    let value = format!("{}:{}:{:o}", uid, gid, file_mode);
    match xattr::set(path, name, value.as_bytes()) {
        Ok(()) => Ok(()),
        Err(e)
            if mode == XattrPermissions::Unprivileged
                && e.raw_os_error() == Some(libc::EPERM) =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Apply the override (when present) on top of a raw stat result,
/// returning the effective `(uid, gid, perm)` triple.
pub fn effective_stat(
    path: &Path,
    meta: &Metadata,
    mode: XattrPermissions,
) -> (u32, u32, u32) {
    if let Some((uid, gid, file_mode)) = read_override(path, mode) {
        (uid, gid, file_mode & 0o7777)
    } else {
        (meta.uid(), meta.gid(), meta.mode() & 0o7777)
    }
}
