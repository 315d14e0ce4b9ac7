//! On-disk marker encodings and the permission-override attribute.

use std::ffi::OsStr;

use tempfile::tempdir;
use veilfs::overlay::idmap;
use veilfs::overlay::whiteout::{self, Whiteout};
use veilfs::{Settings, XattrPermissions};

#[test]
fn fallback_whiteout_hides_and_unhides() {
    let dir = tempdir().unwrap();
    let name = OsStr::new("victim.txt");

    Whiteout::create(dir.path(), name, false).unwrap();
    assert!(dir.path().join(".wh.victim.txt").exists());
    assert!(Whiteout::covers(dir.path(), name));

    Whiteout::delete(dir.path(), name).unwrap();
    assert!(!Whiteout::covers(dir.path(), name));
    // deleting again stays quiet
    Whiteout::delete(dir.path(), name).unwrap();
}

#[test]
fn device_whiteout_when_mknod_is_permitted() {
    let dir = tempdir().unwrap();
    if !whiteout::probe_can_mknod(dir.path(), "probe") {
        return; // unprivileged environment
    }

    let name = OsStr::new("gone");
    Whiteout::create(dir.path(), name, true).unwrap();

    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    let meta = std::fs::symlink_metadata(dir.path().join(name)).unwrap();
    assert!(meta.file_type().is_char_device());
    assert_eq!(meta.rdev(), 0);
    assert!(Whiteout::covers(dir.path(), name));

    // idempotent over an existing whiteout
    Whiteout::create(dir.path(), name, true).unwrap();
    Whiteout::delete(dir.path(), name).unwrap();
    assert!(!Whiteout::covers(dir.path(), name));
}

#[test]
fn opaque_marker_ladder_lands_somewhere() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("d");
    std::fs::create_dir(&target).unwrap();

    assert!(!whiteout::is_opaque(&target));
    whiteout::set_opaque(&target).unwrap();
    assert!(whiteout::is_opaque(&target));
}

#[test]
fn override_stat_attribute_roundtrip() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, b"x").unwrap();

    if idmap::write_override(&file, XattrPermissions::Unprivileged, 1000, 1000, 0o751).is_err() {
        return; // no user xattr support on the scratch filesystem
    }
    match idmap::read_override(&file, XattrPermissions::Unprivileged) {
        Some(triple) => assert_eq!(triple, (1000, 1000, 0o751)),
        None => {} // EPERM swallowed by design in unprivileged mode
    }
}

#[test]
fn option_string_drives_the_mount_setup() {
    let dir = tempdir().unwrap();
    let lower = dir.path().join("l");
    std::fs::create_dir(&lower).unwrap();

    let opts = format!(
        "lowerdir={},timeout=2.5,xattr_permissions=2,squash_to_root",
        lower.display()
    );
    let settings = Settings::parse(&[opts]).unwrap();
    assert_eq!(settings.lowerdirs, vec![lower]);
    assert_eq!(settings.timeout, std::time::Duration::from_secs_f64(2.5));
    assert_eq!(settings.xattr_permissions, XattrPermissions::Unprivileged);
    assert!(settings.squash_to_root);
    assert!(!settings.has_upper());
}

#[test]
fn marker_name_arithmetic() {
    assert_eq!(
        Whiteout::marker_name(OsStr::new("x")),
        std::ffi::OsString::from(".wh.x")
    );
    assert_eq!(
        Whiteout::extract_target(OsStr::new(".wh.x")).as_deref(),
        Some(OsStr::new("x"))
    );
    assert!(Whiteout::is_marker_name(OsStr::new(".wh..wh..opq")));
    assert!(!Whiteout::is_marker_name(OsStr::new("plain")));
}
