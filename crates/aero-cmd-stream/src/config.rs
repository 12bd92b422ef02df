use std::time::Duration;

use aero_gpu_memory::MemoryManagerConfig;
use serde::{Deserialize, Serialize};

/// How a stream's logical context maps onto driver contexts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualizationMode {
    Never,
    Always,
    /// Virtualize when the context provider prefers it.
    #[default]
    Auto,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// A flush count is "ahead" of the last accepted one when their wrapping difference is
    /// non-zero and below this value. Best-effort tolerance for transport reordering.
    pub flush_reorder_window: u32,
    /// Self-poll delay while work remains but no idle work is available.
    pub poll_delay_busy_ms: u64,
    /// Self-poll delay while the handler has idle work.
    pub poll_delay_idle_work_ms: u64,
    /// Longest a busy stream goes without an idle pass.
    pub max_time_since_idle_ms: u64,
    pub virtualization: VirtualizationMode,
    /// Overrides the context provider's `loses_all_contexts_on_loss`.
    pub lose_share_group_on_loss: Option<bool>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_reorder_window: 0x8000_0000,
            poll_delay_busy_ms: 2,
            poll_delay_idle_work_ms: 0,
            max_time_since_idle_ms: 10,
            virtualization: VirtualizationMode::Auto,
            lose_share_group_on_loss: None,
        }
    }
}

impl StreamConfig {
    pub fn flush_is_ahead(&self, last_accepted: u32, flush_count: u32) -> bool {
        let diff = flush_count.wrapping_sub(last_accepted);
        diff != 0 && diff < self.flush_reorder_window
    }

    pub fn poll_delay_busy(&self) -> Duration {
        Duration::from_millis(self.poll_delay_busy_ms)
    }

    pub fn poll_delay_idle_work(&self) -> Duration {
        Duration::from_millis(self.poll_delay_idle_work_ms)
    }

    pub fn max_time_since_idle(&self) -> Duration {
        Duration::from_millis(self.max_time_since_idle_ms)
    }
}

/// Everything a [`crate::ChannelManager`] needs to know up front.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub stream: StreamConfig,
    pub memory: MemoryManagerConfig,
}

impl ChannelConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
