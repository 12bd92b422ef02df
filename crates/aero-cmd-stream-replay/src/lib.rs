//! Replays JSON workload scripts through a [`ChannelManager`](aero_cmd_stream::ChannelManager)
//! backed by the headless software backend, producing the client-visible message log.
#![forbid(unsafe_code)]

mod error;
mod replay;
pub mod script;

use std::path::Path;

use aero_cmd_stream::ChannelConfig;

pub use error::ReplayError;
pub use replay::{replay_script, LogEntry, LogRecord, ReplayLog, Replayer};
pub use script::{Script, ScriptCommand, Step};

fn read(path: &Path) -> Result<String, ReplayError> {
    std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_script(path: &Path) -> Result<Script, ReplayError> {
    Script::from_json(&read(path)?).map_err(|source| ReplayError::Parse {
        what: "script",
        source,
    })
}

/// Loads a channel configuration; missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<ChannelConfig, ReplayError> {
    ChannelConfig::from_json(&read(path)?).map_err(|source| ReplayError::Parse {
        what: "config",
        source,
    })
}
