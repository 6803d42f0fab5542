use std::path::PathBuf;

use thiserror::Error;
use wsterm_core::BridgeError;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("failed to read realm file {path}: {source}")]
    RealmRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse realm file {path}: {message}")]
    RealmParse { path: PathBuf, message: String },

    #[error("could not listen on address {addr}: {source}")]
    Listen {
        addr: String,
        source: std::io::Error,
    },
}

impl AppError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RealmRead { .. } | Self::RealmParse { .. } => 2,
            Self::Listen { .. } => 3,
            _ => 1,
        }
    }
}
