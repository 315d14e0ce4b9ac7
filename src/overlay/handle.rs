use parking_lot::Mutex;
use std::fs::File;
use std::sync::Arc;

/// One open file. `encrypted` records whether IO through this handle is
/// routed via the block cipher engine (upper-layer regular files) or
/// passed through in the clear (lower-layer reads).
#[derive(Debug)]
pub(crate) struct FileHandle {
    pub file: Arc<Mutex<File>>,
    pub encrypted: bool,
}
