//! GPU command-stream host.
//!
//! An untrusted producer writes commands into a shared ring and talks to the host through a
//! channel. For every stream the host keeps a [`CommandStreamController`] that validates
//! requests, decodes the ring with a [`CommandDecoder`] against a rendering context, and lets a
//! [`Scheduler`] suspend decoding while the stream waits on another stream's
//! [`SyncPoint`](aero_sync_point::SyncPoint).
//!
//! Nothing here blocks a thread. Work that completes elsewhere (sync-point retirement, memory
//! budget pushes, delayed polls) is posted as a [`ChannelTask`] and run by
//! [`ChannelManager::run_tasks`] with an explicit clock.
#![forbid(unsafe_code)]

mod channel;
mod command;
mod command_buffer;
mod config;
mod context;
mod controller;
mod decoder;
mod error;
mod ids;
mod mailbox;
mod messages;
mod scheduler;
mod shared_memory;
pub mod software;
mod stats;
mod task;
mod watchdog;

pub use channel::ChannelManager;
pub use command::{
    opcode, CommandHeader, CommandWriter, WriteError, MAX_COMMAND_ENTRIES, MAX_OPCODE,
};
pub use command_buffer::{CommandBufferService, CommandBufferState};
pub use config::{ChannelConfig, StreamConfig, VirtualizationMode};
pub use context::{
    Capabilities, ContextAttributes, ContextProvider, DirectContext, GraphicsContext,
    LogicalContext, PhysicalContext, ShareGroup, SharedPhysicalContext, SurfaceHandle,
    SurfaceProvider, SurfaceRequest, VirtualContext,
};
pub use controller::{
    CommandStreamController, DestructionObserver, GpuBackend, Outbox, StreamServices,
};
pub use decoder::{
    CommandAction, CommandDecoder, CommandHandler, DecodedCommand, DecoderEvent, ExecContext,
    HandlerFactory,
};
pub use error::{
    CommandStreamError, ContextError, DecodeError, ErrorState, LossReason, ParseError, Result,
    StreamFault,
};
pub use ids::{ClientId, ShareGroupId, StreamId};
pub use messages::{ClientEvent, ClientMessage, CreateStreamParams, Dispatch, Reply, Request};
pub use mailbox::Mailbox;
pub use scheduler::{DecodeRun, Scheduler, SchedulingState};
pub use shared_memory::{
    read_shared_state, write_shared_state, SharedMemory, TransferBuffer, TransferBufferRegistry,
    SHARED_STATE_MIN_BYTES, SHARED_STATE_WORDS,
};
pub use stats::{ProcessStats, ProcessStatsSnapshot};
pub use task::{ChannelTask, TaskQueue, TaskSender};
pub use watchdog::{CountingWatchdog, NullWatchdog, Watchdog};

pub use aero_gpu_memory::{ManagedMemoryStats, MemoryAllocation};
pub use aero_sync_point::{ProducerId, SyncPoint, SyncPointManager};
