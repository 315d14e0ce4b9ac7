use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VeilError>;

#[derive(Error, Debug)]
pub enum VeilError {
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FUSE error: {0}")]
    Fuse(String),

    #[error("Invalid id mapping: {0}")]
    Mapping(String),
}
