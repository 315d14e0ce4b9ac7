//! Mount-option parsing.
//!
//! Options arrive as `-o key=value[,key=value...]` strings in the style
//! of mount(8). Everything the mount helper passes through is recognized
//! here; unknown keys are rejected so a typo fails loudly at mount time
//! instead of silently changing semantics.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, VeilError};

/// One `host:inner:len` id-mapping range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry {
    pub host: u32,
    pub inner: u32,
    pub len: u32,
}

/// Where authoritative ownership/mode of upper entries is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XattrPermissions {
    #[default]
    Off,
    /// `trusted.overlay.override_stat`
    Privileged,
    /// `user.overlay.override_stat`
    Unprivileged,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub lowerdirs: Vec<PathBuf>,
    pub upperdir: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub uid_mappings: Vec<MappingEntry>,
    pub gid_mappings: Vec<MappingEntry>,
    pub squash_to_root: bool,
    pub squash_to_uid: Option<u32>,
    pub squash_to_gid: Option<u32>,
    pub xattr_permissions: XattrPermissions,
    pub threaded: bool,
    pub fsync: bool,
    pub fast_ino: bool,
    pub writeback: bool,
    pub noxattrs: bool,
    pub static_nlink: bool,
    pub plugins: Vec<PathBuf>,
    /// Kernel attribute/entry cache TTL; zero disables caching.
    pub timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            lowerdirs: Vec::new(),
            upperdir: None,
            workdir: None,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            squash_to_root: false,
            squash_to_uid: None,
            squash_to_gid: None,
            xattr_permissions: XattrPermissions::Off,
            threaded: true,
            fsync: true,
            fast_ino: false,
            writeback: true,
            noxattrs: false,
            static_nlink: false,
            plugins: Vec::new(),
            timeout: Duration::from_secs(1),
        }
    }
}

impl Settings {
    pub fn has_upper(&self) -> bool {
        self.upperdir.is_some()
    }

    /// Parse a list of `-o` option strings into settings and validate the
    /// combination.
    pub fn parse(option_strings: &[String]) -> Result<Settings> {
        let mut s = Settings::default();

        for raw in option_strings {
            for opt in raw.split(',').filter(|o| !o.is_empty()) {
                let (key, value) = match opt.split_once('=') {
                    Some((k, v)) => (k, Some(v)),
                    None => (opt, None),
                };
                s.apply(key, value)?;
            }
        }

        if s.upperdir.is_some() && s.workdir.is_none() {
            return Err(VeilError::Config(
                "upperdir requires a workdir".to_string(),
            ));
        }
        if s.lowerdirs.is_empty() {
            return Err(VeilError::Config("no lowerdir specified".to_string()));
        }
        Ok(s)
    }

    fn apply(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        let want = |key: &str, value: Option<&str>| -> Result<String> {
            value
                .map(str::to_string)
                .ok_or_else(|| VeilError::Config(format!("option {key} requires a value")))
        };

        match key {
            "lowerdir" => {
                self.lowerdirs = want(key, value)?
                    .split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect();
            }
            "upperdir" => self.upperdir = Some(PathBuf::from(want(key, value)?)),
            "workdir" => self.workdir = Some(PathBuf::from(want(key, value)?)),
            "redirect_dir" => {
                if want(key, value)? != "off" {
                    return Err(VeilError::Config(
                        "redirect_dir is only supported as \"off\"".to_string(),
                    ));
                }
            }
            "uidmapping" => self.uid_mappings = parse_mappings(&want(key, value)?)?,
            "gidmapping" => self.gid_mappings = parse_mappings(&want(key, value)?)?,
            "squash_to_root" => self.squash_to_root = true,
            "squash_to_uid" => self.squash_to_uid = Some(parse_num(key, &want(key, value)?)?),
            "squash_to_gid" => self.squash_to_gid = Some(parse_num(key, &want(key, value)?)?),
            "xattr_permissions" => {
                self.xattr_permissions = match want(key, value)?.as_str() {
                    "0" => XattrPermissions::Off,
                    "1" => XattrPermissions::Privileged,
                    "2" => XattrPermissions::Unprivileged,
                    other => {
                        return Err(VeilError::Config(format!(
                            "invalid xattr_permissions mode: {other}"
                        )))
                    }
                };
            }
            "threaded" => self.threaded = parse_flag(key, value)?,
            "fsync" => self.fsync = parse_flag(key, value)?,
            "volatile" => self.fsync = false,
            "fast_ino" => self.fast_ino = parse_flag(key, value)?,
            "writeback" => self.writeback = parse_flag(key, value)?,
            "noxattrs" => self.noxattrs = parse_flag(key, value)?,
            "static_nlink" => self.static_nlink = true,
            "plugins" => {
                self.plugins = want(key, value)?
                    .split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect();
            }
            "timeout" => {
                let secs: f64 = want(key, value)?
                    .parse()
                    .map_err(|_| VeilError::Config("invalid timeout".to_string()))?;
                if !(0.0..=86400.0).contains(&secs) {
                    return Err(VeilError::Config("timeout out of range".to_string()));
                }
                self.timeout = Duration::from_secs_f64(secs);
            }
            other => {
                return Err(VeilError::Config(format!("unknown option: {other}")));
            }
        }
        Ok(())
    }
}

fn parse_num(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| VeilError::Config(format!("invalid numeric value for {key}: {value}")))
}

/// Flag options accept an optional `=0`/`=1`; a bare key means enabled.
fn parse_flag(key: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None => Ok(true),
        Some("0") => Ok(false),
        Some("1") => Ok(true),
        Some(other) => Err(VeilError::Config(format!(
            "invalid value for {key}: {other}"
        ))),
    }
}

/// `host:inner:len[:host:inner:len...]`
fn parse_mappings(s: &str) -> Result<Vec<MappingEntry>> {
    let fields: Vec<&str> = s.split(':').collect();
    if fields.is_empty() || fields.len() % 3 != 0 {
        return Err(VeilError::Mapping(s.to_string()));
    }
    let mut out = Vec::with_capacity(fields.len() / 3);
    for chunk in fields.chunks(3) {
        let parse =
            |f: &str| -> Result<u32> { f.parse().map_err(|_| VeilError::Mapping(s.to_string())) };
        out.push(MappingEntry {
            host: parse(chunk[0])?,
            inner: parse(chunk[1])?,
            len: parse(chunk[2])?,
        });
    }
    Ok(out)
}
