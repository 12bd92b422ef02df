//! Message surface between a producer and the channel.

use aero_gpu_memory::{ManagedMemoryStats, MemoryAllocation};
use aero_sync_point::SyncPoint;
use serde::Serialize;

use crate::command_buffer::CommandBufferState;
use crate::context::{Capabilities, ContextAttributes, SurfaceRequest};
use crate::error::ErrorState;
use crate::ids::StreamId;
use crate::shared_memory::SharedMemory;

#[derive(Clone, Debug)]
pub enum Request {
    Initialize { shared_state: SharedMemory },
    SetGetBuffer { buffer_id: i32 },
    /// Fire-and-forget.
    AsyncFlush { put_offset: u32, flush_count: u32 },
    RegisterTransferBuffer { id: i32, buffer: SharedMemory, size: u32 },
    DestroyTransferBuffer { id: i32 },
    GetState,
    /// Unordered: answered even while the stream waits on a sync point.
    GetStateFast,
    InsertSyncPoint,
    RetireSyncPoint { sync_point: SyncPoint },
    WaitSyncPoint { sync_point: SyncPoint },
    SignalSyncPoint { sync_point: SyncPoint, signal_id: u32 },
    SignalQuery { query_id: u32, signal_id: u32 },
    SetSurfaceVisible { visible: bool },
    SetMemoryAllocationChangedCallback { has_callback: bool },
    SetManagedMemoryStats { stats: ManagedMemoryStats },
    Echo { id: u32 },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Initialize { .. } => "initialize",
            Request::SetGetBuffer { .. } => "set_get_buffer",
            Request::AsyncFlush { .. } => "async_flush",
            Request::RegisterTransferBuffer { .. } => "register_transfer_buffer",
            Request::DestroyTransferBuffer { .. } => "destroy_transfer_buffer",
            Request::GetState => "get_state",
            Request::GetStateFast => "get_state_fast",
            Request::InsertSyncPoint => "insert_sync_point",
            Request::RetireSyncPoint { .. } => "retire_sync_point",
            Request::WaitSyncPoint { .. } => "wait_sync_point",
            Request::SignalSyncPoint { .. } => "signal_sync_point",
            Request::SignalQuery { .. } => "signal_query",
            Request::SetSurfaceVisible { .. } => "set_surface_visible",
            Request::SetMemoryAllocationChangedCallback { .. } => {
                "set_memory_allocation_changed_callback"
            }
            Request::SetManagedMemoryStats { .. } => "set_managed_memory_stats",
            Request::Echo { .. } => "echo",
        }
    }

    /// Handled immediately even while earlier requests of the stream are deferred.
    pub fn bypasses_deferral(&self) -> bool {
        matches!(
            self,
            Request::GetStateFast
                | Request::RegisterTransferBuffer { .. }
                | Request::DestroyTransferBuffer { .. }
        )
    }

    /// Whether the producer waits for an answer. Deferred requests that expect none are
    /// replayed silently unless they fail.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Request::Initialize { .. }
                | Request::SetGetBuffer { .. }
                | Request::RegisterTransferBuffer { .. }
                | Request::DestroyTransferBuffer { .. }
                | Request::GetState
                | Request::GetStateFast
                | Request::InsertSyncPoint
                | Request::WaitSyncPoint { .. }
        )
    }

    /// Must not run before everything flushed ahead of it has been decoded.
    pub fn waits_for_decode(&self) -> bool {
        matches!(self, Request::RetireSyncPoint { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Initialize {
        success: bool,
        capabilities: Option<Capabilities>,
    },
    Ack,
    State {
        state: CommandBufferState,
    },
    SyncPoint {
        sync_point: SyncPoint,
    },
    WaitSyncPoint {
        scheduled: bool,
    },
}

/// Asynchronous channel → producer traffic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Reply to a request that had been deferred.
    Reply { request: String, reply: Reply },
    /// A deferred request failed when it was finally handled.
    Rejected { request: String, error: String },
    SignalAck { signal_id: u32 },
    /// Sent once when an error latches. The stream is gone after this.
    Destroyed { error: ErrorState },
    SetMemoryAllocation { allocation: MemoryAllocation },
    EchoAck { id: u32 },
    CacheShader { key: String, blob: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientMessage {
    pub stream: StreamId,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Replied(Reply),
    /// Queued until the stream is scheduled; the reply arrives as [`ClientEvent::Reply`].
    Deferred,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateStreamParams {
    pub surface: SurfaceRequest,
    pub attributes: ContextAttributes,
    /// Join the share group of this existing stream.
    pub share_group: Option<StreamId>,
    pub visible: bool,
}

impl Default for CreateStreamParams {
    fn default() -> Self {
        Self {
            surface: SurfaceRequest::Offscreen {
                width: 1,
                height: 1,
            },
            attributes: ContextAttributes::default(),
            share_group: None,
            visible: true,
        }
    }
}
