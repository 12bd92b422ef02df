use std::path::PathBuf;

use aero_cmd_stream::{CommandStreamError, WriteError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("step {step}: unknown stream {name:?}")]
    UnknownStream { step: usize, name: String },

    #[error("step {step}: stream {name:?} already exists")]
    DuplicateStream { step: usize, name: String },

    #[error("step {step}: unknown sync point {name:?}")]
    UnknownSyncPoint { step: usize, name: String },

    #[error("step {step}: stream {name:?} has no ring")]
    NoRing { step: usize, name: String },

    #[error("step {step}: {source}")]
    Write {
        step: usize,
        #[source]
        source: WriteError,
    },

    #[error("step {step}: {source}")]
    Channel {
        step: usize,
        #[source]
        source: CommandStreamError,
    },
}
