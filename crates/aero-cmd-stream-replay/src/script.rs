//! JSON workload scripts.
//!
//! Streams and sync points are referred to by name; the replayer maps names to the ids the
//! channel hands out.

use aero_cmd_stream::{ContextAttributes, LossReason, SurfaceRequest};
use serde::Deserialize;

pub const DEFAULT_RING_ID: i32 = 1;
pub const DEFAULT_RING_ENTRIES: u32 = 1024;
pub const DEFAULT_CLIENT: u32 = 1;

fn default_ring_id() -> i32 {
    DEFAULT_RING_ID
}

fn default_ring_entries() -> u32 {
    DEFAULT_RING_ENTRIES
}

fn default_client() -> u32 {
    DEFAULT_CLIENT
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    CreateChannel {
        client: u32,
    },
    RemoveChannel {
        client: u32,
    },
    CreateStream {
        name: String,
        #[serde(default = "default_client")]
        client: u32,
        /// Name of an existing stream whose share group to join.
        #[serde(default)]
        share_group: Option<String>,
        #[serde(default)]
        surface: Option<SurfaceRequest>,
        #[serde(default)]
        attributes: ContextAttributes,
        #[serde(default = "default_true")]
        visible: bool,
    },
    Initialize {
        stream: String,
    },
    /// Registers a zeroed ring buffer and prepares a command writer for it.
    CreateRing {
        stream: String,
        #[serde(default = "default_ring_id")]
        id: i32,
        #[serde(default = "default_ring_entries")]
        entries: u32,
    },
    CreateTransferBuffer {
        stream: String,
        id: i32,
        size: u32,
        #[serde(default)]
        fill: u8,
    },
    SetGetBuffer {
        stream: String,
        #[serde(default = "default_ring_id")]
        buffer_id: i32,
    },
    /// Writes commands into the ring and flushes them with the next flush count.
    Submit {
        stream: String,
        commands: Vec<ScriptCommand>,
    },
    /// Flush with an explicit put offset and counter, for reordering scenarios.
    Flush {
        stream: String,
        put_offset: u32,
        flush_count: u32,
    },
    InsertSyncPoint {
        stream: String,
        name: String,
    },
    RetireSyncPoint {
        stream: String,
        name: String,
    },
    WaitSyncPoint {
        stream: String,
        name: String,
    },
    SignalSyncPoint {
        stream: String,
        name: String,
        signal_id: u32,
    },
    SetVisible {
        stream: String,
        visible: bool,
    },
    SetMemoryCallback {
        stream: String,
        enabled: bool,
    },
    Echo {
        stream: String,
        id: u32,
    },
    Advance {
        ms: u64,
    },
    DestroyStream {
        stream: String,
    },
}

/// One command written into a ring by a `submit` step.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptCommand {
    Noop,
    SetToken(u32),
    /// Waits on a named sync point.
    WaitSyncPoint(String),
    BeginQuery(u32),
    EndQuery(u32),
    Alloc {
        id: u32,
        size: u32,
    },
    Free {
        id: u32,
    },
    Upload {
        shm_id: u32,
        offset: u32,
        size: u32,
    },
    CacheShader {
        key: u32,
    },
    LoseContext(LossReason),
    Raw {
        opcode: u16,
        #[serde(default)]
        args: Vec<u32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn steps_fill_in_defaults() {
        let script = Script::from_json(
            r#"{"steps": [
                {"op": "create_stream", "name": "a"},
                {"op": "create_ring", "stream": "a"},
                {"op": "submit", "stream": "a", "commands": ["noop", {"set_token": 3},
                    {"wait_sync_point": "gate"}, {"alloc": {"id": 1, "size": 64}},
                    {"lose_context": "guilty"}, {"raw": {"opcode": 300}}]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            script.steps[0],
            Step::CreateStream {
                name: "a".into(),
                client: DEFAULT_CLIENT,
                share_group: None,
                surface: None,
                attributes: ContextAttributes::default(),
                visible: true,
            }
        );
        assert_eq!(
            script.steps[1],
            Step::CreateRing {
                stream: "a".into(),
                id: DEFAULT_RING_ID,
                entries: DEFAULT_RING_ENTRIES,
            }
        );
        let Step::Submit { commands, .. } = &script.steps[2] else {
            panic!("expected submit");
        };
        assert_eq!(
            commands,
            &vec![
                ScriptCommand::Noop,
                ScriptCommand::SetToken(3),
                ScriptCommand::WaitSyncPoint("gate".into()),
                ScriptCommand::Alloc { id: 1, size: 64 },
                ScriptCommand::LoseContext(LossReason::Guilty),
                ScriptCommand::Raw {
                    opcode: 300,
                    args: vec![]
                },
            ]
        );
    }

    #[test]
    fn unknown_ops_are_rejected() {
        assert!(Script::from_json(r#"{"steps": [{"op": "explode"}]}"#).is_err());
    }
}
