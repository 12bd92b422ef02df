//! Per-stream message handling.
//!
//! A [`CommandStreamController`] validates producer requests, owns the ring state, decoder and
//! scheduler once initialized, and turns decode outcomes into client messages. It runs on the
//! channel loop only; everything that happens elsewhere reaches it as a [`ChannelTask`].

use std::fmt;
use std::sync::Arc;

use aero_gpu_memory::{
    AllocationSink, ClientState, ManagedMemoryStats, MemoryAllocation, MemoryBudgetManager,
};
use aero_sync_point::{SyncPoint, SyncPointManager, SyncPointState};

use crate::command_buffer::{CommandBufferService, CommandBufferState};
use crate::config::{StreamConfig, VirtualizationMode};
use crate::context::{
    Capabilities, ContextProvider, DirectContext, LogicalContext, ShareGroup, SurfaceProvider,
    VirtualContext,
};
use crate::decoder::{CommandDecoder, DecoderEvent, HandlerFactory};
use crate::error::{CommandStreamError, ContextError, ErrorState, LossReason, Result};
use crate::ids::{ClientId, StreamId};
use crate::messages::{ClientEvent, ClientMessage, CreateStreamParams, Reply, Request};
use crate::mailbox::Mailbox;
use crate::scheduler::{DecodeRun, Scheduler, SchedulingState};
use crate::shared_memory::{SharedMemory, TransferBufferRegistry};
use crate::stats::ProcessStats;
use crate::task::{ChannelTask, TaskSender};
use crate::watchdog::Watchdog;

/// Client-bound messages, in emission order.
pub type Outbox = Arc<Mailbox<ClientMessage>>;

/// The pluggable pieces that turn a stream into real rendering.
#[derive(Clone)]
pub struct GpuBackend {
    pub surfaces: Arc<dyn SurfaceProvider>,
    pub contexts: Arc<dyn ContextProvider>,
    pub handlers: Arc<dyn HandlerFactory>,
}

impl fmt::Debug for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBackend").finish_non_exhaustive()
    }
}

/// Process-wide services every controller is wired to.
#[derive(Clone)]
pub struct StreamServices {
    pub sync_points: Arc<SyncPointManager>,
    pub memory: Arc<MemoryBudgetManager>,
    pub stats: Arc<ProcessStats>,
    pub watchdog: Arc<dyn Watchdog>,
    pub backend: GpuBackend,
    pub tasks: TaskSender,
    pub outbox: Outbox,
}

/// Notified once, right before a stream's decoder and context are destroyed.
pub trait DestructionObserver: Send {
    fn on_will_destroy(&mut self, stream: StreamId);
}

struct StreamAllocationSink {
    stream: StreamId,
    tasks: TaskSender,
}

impl AllocationSink for StreamAllocationSink {
    fn set_memory_allocation(&self, allocation: MemoryAllocation) {
        self.tasks.post(ChannelTask::MemoryAllocationChanged {
            stream: self.stream,
            allocation,
        });
    }
}

/// Everything Initialize builds. Exists completely or not at all.
struct Engine {
    command_buffer: CommandBufferService,
    decoder: CommandDecoder,
    scheduler: Scheduler,
    memory_client: ClientState,
}

#[derive(Debug, thiserror::Error)]
enum InitializeError {
    #[error(transparent)]
    Request(#[from] CommandStreamError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

pub struct CommandStreamController {
    id: StreamId,
    client: ClientId,
    params: CreateStreamParams,
    config: StreamConfig,
    services: StreamServices,
    share_group: Arc<ShareGroup>,
    transfer_buffers: TransferBufferRegistry,
    engine: Option<Engine>,
    last_flush_count: u32,
    has_memory_callback: bool,
    last_memory_allocation: Option<MemoryAllocation>,
    destruction_observers: Vec<Box<dyn DestructionObserver>>,
    destroyed_sent: bool,
    loss_to_propagate: Option<LossReason>,
    destroyed: bool,
}

impl fmt::Debug for CommandStreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStreamController")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("initialized", &self.engine.is_some())
            .field("state", &self.state())
            .finish()
    }
}

impl CommandStreamController {
    pub fn new(
        id: StreamId,
        client: ClientId,
        params: CreateStreamParams,
        config: StreamConfig,
        services: StreamServices,
        share_group: Arc<ShareGroup>,
    ) -> Self {
        services.stats.inc_streams_created();
        Self {
            id,
            client,
            params,
            config,
            services,
            share_group,
            transfer_buffers: TransferBufferRegistry::new(),
            engine: None,
            last_flush_count: 0,
            has_memory_callback: false,
            last_memory_allocation: None,
            destruction_observers: Vec::new(),
            destroyed_sent: false,
            loss_to_propagate: None,
            destroyed: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn share_group(&self) -> &Arc<ShareGroup> {
        &self.share_group
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Error latched; a `Destroyed` went out and teardown is pending.
    pub fn is_lost(&self) -> bool {
        self.destroyed_sent
    }

    pub fn scheduling_state(&self) -> SchedulingState {
        self.engine
            .as_ref()
            .map(|engine| engine.scheduler.state())
            .unwrap_or(SchedulingState::Scheduled)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduling_state() == SchedulingState::Scheduled
    }

    pub fn has_more_work(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|engine| engine.scheduler.has_more_work(&engine.command_buffer))
    }

    pub fn state(&self) -> CommandBufferState {
        self.engine
            .as_ref()
            .map(|engine| engine.command_buffer.state())
            .unwrap_or_default()
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.engine
            .as_ref()
            .map(|engine| engine.decoder.capabilities())
    }

    pub fn is_virtualized(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|engine| engine.decoder.is_virtualized())
    }

    pub fn recoverable_errors(&self) -> u64 {
        self.engine
            .as_ref()
            .map(|engine| engine.decoder.recoverable_errors())
            .unwrap_or(0)
    }

    pub fn transfer_buffer_count(&self) -> usize {
        self.transfer_buffers.len()
    }

    pub fn add_destruction_observer(&mut self, observer: Box<dyn DestructionObserver>) {
        self.destruction_observers.push(observer);
    }

    /// Loss the channel still has to propagate to the share group. Taken once.
    pub fn take_loss_to_propagate(&mut self) -> Option<LossReason> {
        self.loss_to_propagate.take()
    }

    fn emit(&self, event: ClientEvent) {
        self.services.outbox.post(ClientMessage {
            stream: self.id,
            event,
        });
    }

    fn engine(&self) -> Result<&Engine> {
        if self.destroyed_sent {
            return Err(CommandStreamError::StreamLost);
        }
        self.engine.as_ref().ok_or(CommandStreamError::NotInitialized)
    }

    fn engine_mut(&mut self) -> Result<&mut Engine> {
        if self.destroyed_sent {
            return Err(CommandStreamError::StreamLost);
        }
        self.engine.as_mut().ok_or(CommandStreamError::NotInitialized)
    }

    /// Handles one request in order. Fire-and-forget requests answer [`Reply::Ack`].
    pub fn handle_request(&mut self, now_ns: u64, request: Request) -> Result<Reply> {
        match request {
            Request::Initialize { shared_state } => self.initialize(shared_state),
            Request::SetGetBuffer { buffer_id } => self.set_get_buffer(buffer_id),
            Request::AsyncFlush {
                put_offset,
                flush_count,
            } => self
                .async_flush(now_ns, put_offset, flush_count)
                .map(|()| Reply::Ack),
            Request::RegisterTransferBuffer { id, buffer, size } => {
                self.register_transfer_buffer(id, buffer, size)
            }
            Request::DestroyTransferBuffer { id } => self.destroy_transfer_buffer(id),
            Request::GetState | Request::GetStateFast => Ok(Reply::State {
                state: self.state(),
            }),
            Request::InsertSyncPoint => self.insert_sync_point(),
            Request::RetireSyncPoint { sync_point } => self.retire_sync_point(sync_point),
            Request::WaitSyncPoint { sync_point } => self
                .wait_sync_point(sync_point)
                .map(|scheduled| Reply::WaitSyncPoint { scheduled }),
            Request::SignalSyncPoint {
                sync_point,
                signal_id,
            } => self
                .signal_sync_point(sync_point, signal_id)
                .map(|()| Reply::Ack),
            Request::SignalQuery {
                query_id,
                signal_id,
            } => self
                .signal_query(now_ns, query_id, signal_id)
                .map(|()| Reply::Ack),
            Request::SetSurfaceVisible { visible } => self.set_surface_visible(visible),
            Request::SetMemoryAllocationChangedCallback { has_callback } => {
                self.set_memory_allocation_changed_callback(has_callback)
            }
            Request::SetManagedMemoryStats { stats } => self.set_managed_memory_stats(stats),
            Request::Echo { id } => {
                self.emit(ClientEvent::EchoAck { id });
                Ok(Reply::Ack)
            }
        }
    }

    /// Builds the ring state, surface, context, decoder and scheduler. Any failure leaves the
    /// stream exactly as it was and produces a single failure reply.
    pub fn initialize(&mut self, shared_state: SharedMemory) -> Result<Reply> {
        if self.engine.is_some() {
            return Err(CommandStreamError::AlreadyInitialized);
        }
        if self.destroyed_sent || self.destroyed {
            return Err(CommandStreamError::StreamLost);
        }
        match self.build_engine(shared_state) {
            Ok(mut engine) => {
                engine.command_buffer.report_state();
                let capabilities = engine.decoder.capabilities().clone();
                tracing::info!(
                    stream = %self.id,
                    client = %self.client,
                    virtualized = capabilities.virtualized,
                    "stream initialized"
                );
                self.engine = Some(engine);
                Ok(Reply::Initialize {
                    success: true,
                    capabilities: Some(capabilities),
                })
            }
            Err(err) => {
                tracing::error!(stream = %self.id, "initialize failed: {err}");
                Ok(Reply::Initialize {
                    success: false,
                    capabilities: None,
                })
            }
        }
    }

    fn use_virtual_context(&self) -> bool {
        match self.config.virtualization {
            VirtualizationMode::Never => false,
            VirtualizationMode::Always => true,
            VirtualizationMode::Auto => self
                .services
                .backend
                .contexts
                .prefers_virtualized_contexts(),
        }
    }

    fn build_engine(&self, shared_state: SharedMemory) -> Result<Engine, InitializeError> {
        let command_buffer = CommandBufferService::new(shared_state)?;
        let backend = &self.services.backend;
        let surface = backend.surfaces.create_surface(&self.params.surface)?;

        let mut created_physical = false;
        let context: Box<dyn LogicalContext> = if self.use_virtual_context() {
            let (physical, created) = self
                .share_group
                .physical_or_create(backend.contexts.as_ref())?;
            created_physical = created;
            Box::new(VirtualContext::new(
                physical,
                self.id,
                surface,
                Arc::clone(&self.services.stats),
            ))
        } else {
            Box::new(DirectContext::new(backend.contexts.create_context()?, surface))
        };

        let decoder = CommandDecoder::initialize(
            self.id,
            context,
            backend.handlers.create_handler(self.id),
            self.services
                .memory
                .create_tracking_group(u64::from(self.client.0)),
            &self.params.attributes,
            Arc::clone(&self.services.stats),
        );
        let decoder = match decoder {
            Ok(decoder) => decoder,
            Err(err) => {
                if created_physical {
                    self.share_group.clear_physical();
                }
                return Err(err.into());
            }
        };

        let scheduler = Scheduler::new(
            self.id,
            self.config.clone(),
            Arc::clone(&self.services.sync_points),
            self.services.tasks.clone(),
            Arc::clone(&self.services.stats),
            Arc::clone(&self.services.watchdog),
        );
        let memory_client = self.services.memory.create_client_state(
            Arc::new(StreamAllocationSink {
                stream: self.id,
                tasks: self.services.tasks.clone(),
            }),
            self.params.visible,
            self.has_memory_callback,
        );

        Ok(Engine {
            command_buffer,
            decoder,
            scheduler,
            memory_client,
        })
    }

    pub fn set_get_buffer(&mut self, buffer_id: i32) -> Result<Reply> {
        let memory = self
            .transfer_buffers
            .get(buffer_id)
            .map(|buffer| buffer.memory.clone())
            .ok_or_else(|| {
                CommandStreamError::invalid(format!("unknown transfer buffer {buffer_id}"))
            })?;
        let engine = self.engine_mut()?;
        if engine.command_buffer.set_get_buffer(buffer_id, memory) {
            engine.command_buffer.report_state();
        }
        Ok(Reply::Ack)
    }

    pub fn async_flush(&mut self, now_ns: u64, put_offset: u32, flush_count: u32) -> Result<()> {
        let engine = self.engine()?;
        if engine.command_buffer.ring().is_none() {
            return Err(CommandStreamError::invalid("flush before a ring was bound"));
        }
        if !self.config.flush_is_ahead(self.last_flush_count, flush_count) {
            tracing::debug!(
                stream = %self.id,
                flush_count,
                last = self.last_flush_count,
                "dropping stale flush"
            );
            self.services.stats.inc_flushes_dropped();
            return Ok(());
        }
        self.last_flush_count = flush_count;

        let flushed = self
            .engine_mut()
            .map(|engine| engine.command_buffer.flush(put_offset))?;
        if let Err(err) = flushed {
            tracing::warn!(stream = %self.id, put_offset, "bad flush: {err}");
            if let Some(engine) = self.engine.as_mut() {
                engine.command_buffer.set_error(ErrorState::Parse(err));
            }
            self.on_fault();
            return Ok(());
        }

        self.run_decoder();
        self.schedule_delayed_work(now_ns);
        Ok(())
    }

    /// Decodes whatever is available, then reports state once caught up and handles faults.
    fn run_decoder(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if !engine.scheduler.is_scheduled() || !engine.scheduler.has_more_work(&engine.command_buffer)
        {
            return;
        }
        if !engine.decoder.make_current() {
            engine.command_buffer.set_context_lost(LossReason::Unknown);
            self.on_fault();
            return;
        }

        let run: DecodeRun = engine.scheduler.put_changed(
            &mut engine.command_buffer,
            &mut engine.decoder,
            &self.transfer_buffers,
        );
        if let Some(reason) = engine.decoder.reset_status() {
            engine.command_buffer.set_context_lost(reason);
        }
        let events = engine.decoder.take_events();
        let caught_up = !engine.command_buffer.has_unprocessed_commands();
        let error = engine.command_buffer.error();
        if caught_up || error.is_error() {
            engine.command_buffer.report_state();
        }
        tracing::trace!(
            stream = %self.id,
            commands = run.commands,
            fenced = run.fenced,
            "decode run"
        );

        for DecoderEvent::CacheShader { key, blob } in events {
            self.emit(ClientEvent::CacheShader { key, blob });
        }
        if error.is_error() {
            self.on_fault();
        }
    }

    fn has_pending_work(&self) -> (bool, bool) {
        let Some(engine) = self.engine.as_ref() else {
            return (false, false);
        };
        if self.destroyed_sent {
            return (false, false);
        }
        let scheduled = engine.scheduler.is_scheduled();
        let idle_work = scheduled && engine.decoder.has_more_idle_work();
        let pending = (scheduled && engine.scheduler.has_more_work(&engine.command_buffer))
            || engine.decoder.has_pending_queries()
            || idle_work;
        (pending, idle_work)
    }

    fn schedule_delayed_work(&mut self, now_ns: u64) {
        let (pending, idle_work) = self.has_pending_work();
        let delay = self.config.poll_delay_busy();
        if let Some(engine) = self.engine.as_mut() {
            engine
                .scheduler
                .schedule_delayed_work(now_ns, delay, pending, idle_work);
        }
    }

    /// Runs a posted self-poll: query completion, leftover decoding and, when the stream has
    /// been idle, one pass of idle work.
    pub fn poll_work(&mut self, now_ns: u64, generation: u64) {
        if self.destroyed_sent {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if !engine.scheduler.begin_poll(generation) {
            return;
        }
        if !engine.decoder.make_current() {
            engine.command_buffer.set_context_lost(LossReason::Unknown);
            self.on_fault();
            return;
        }

        for signal_id in engine.decoder.process_pending_queries() {
            self.services.outbox.post(ClientMessage {
                stream: self.id,
                event: ClientEvent::SignalAck { signal_id },
            });
        }

        self.run_decoder();
        if self.destroyed_sent {
            return;
        }

        if let Some(engine) = self.engine.as_mut() {
            if engine.scheduler.should_run_idle_work(now_ns) && engine.decoder.has_more_idle_work()
            {
                engine.decoder.perform_idle_work(&self.transfer_buffers);
                self.services.stats.inc_idle_passes();
                tracing::trace!(stream = %self.id, "idle pass");
                if let Some(reason) = engine.decoder.reset_status() {
                    engine.command_buffer.set_context_lost(reason);
                    self.on_fault();
                    return;
                }
            }
        }
        self.schedule_delayed_work(now_ns);
    }

    pub fn register_transfer_buffer(
        &mut self,
        id: i32,
        buffer: SharedMemory,
        size: u32,
    ) -> Result<Reply> {
        self.transfer_buffers.register(id, buffer, size)?;
        Ok(Reply::Ack)
    }

    pub fn destroy_transfer_buffer(&mut self, id: i32) -> Result<Reply> {
        if let Some(engine) = self.engine.as_ref() {
            if engine.command_buffer.get_buffer_id() == Some(id) {
                tracing::debug!(stream = %self.id, id, "destroying the bound ring buffer");
            }
        }
        self.transfer_buffers.destroy(id)?;
        Ok(Reply::Ack)
    }

    pub fn insert_sync_point(&mut self) -> Result<Reply> {
        self.engine()?;
        let sync_point = self
            .services
            .sync_points
            .generate_sync_point(self.id.producer());
        Ok(Reply::SyncPoint { sync_point })
    }

    /// Retires the oldest token this stream produced. Anything else is rejected rather than
    /// tripping the manager's ordering check.
    pub fn retire_sync_point(&mut self, sync_point: SyncPoint) -> Result<Reply> {
        self.engine()?;
        let oldest = self
            .services
            .sync_points
            .oldest_outstanding(self.id.producer());
        if oldest != Some(sync_point) {
            return Err(CommandStreamError::invalid(format!(
                "{sync_point} is not the oldest outstanding sync point of {}",
                self.id
            )));
        }
        self.services.sync_points.retire_sync_point(sync_point);
        Ok(Reply::Ack)
    }

    pub fn wait_sync_point(&mut self, sync_point: SyncPoint) -> Result<bool> {
        let state = self.services.sync_points.state(sync_point);
        if state == SyncPointState::Unknown {
            return Err(CommandStreamError::invalid(format!(
                "{sync_point} was never issued"
            )));
        }
        let engine = self.engine_mut()?;
        if state == SyncPointState::Retired {
            return Ok(true);
        }
        Ok(engine.scheduler.wait_sync_point(sync_point))
    }

    pub fn on_sync_point_retired(&mut self, now_ns: u64) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if engine.scheduler.on_sync_point_retired() {
            tracing::debug!(stream = %self.id, "rescheduled");
            self.run_decoder();
        }
        self.schedule_delayed_work(now_ns);
    }

    pub fn signal_sync_point(&mut self, sync_point: SyncPoint, signal_id: u32) -> Result<()> {
        if self.services.sync_points.state(sync_point) == SyncPointState::Unknown {
            return Err(CommandStreamError::invalid(format!(
                "{sync_point} was never issued"
            )));
        }
        self.engine()?;
        let tasks = self.services.tasks.clone();
        let stream = self.id;
        self.services.sync_points.add_sync_point_callback(
            sync_point,
            Box::new(move || tasks.post(ChannelTask::SignalAck { stream, signal_id })),
        );
        Ok(())
    }

    pub fn signal_query(&mut self, now_ns: u64, query_id: u32, signal_id: u32) -> Result<()> {
        let engine = self.engine_mut()?;
        if let Some(signal_id) = engine.decoder.signal_query(query_id, signal_id) {
            self.emit(ClientEvent::SignalAck { signal_id });
        } else {
            self.schedule_delayed_work(now_ns);
        }
        Ok(())
    }

    pub fn set_surface_visible(&mut self, visible: bool) -> Result<Reply> {
        self.engine()?.memory_client.set_visible(visible);
        Ok(Reply::Ack)
    }

    pub fn set_memory_allocation_changed_callback(&mut self, has_callback: bool) -> Result<Reply> {
        self.has_memory_callback = has_callback;
        if !has_callback {
            self.last_memory_allocation = None;
        }
        if let Some(engine) = self.engine.as_ref() {
            engine.memory_client.set_has_callback(has_callback);
        }
        Ok(Reply::Ack)
    }

    pub fn set_managed_memory_stats(&mut self, stats: ManagedMemoryStats) -> Result<Reply> {
        self.engine()?.memory_client.set_managed_memory_stats(stats);
        Ok(Reply::Ack)
    }

    /// Applies a budget push. Forwarded to the handler and the client only when it differs
    /// from the last one forwarded.
    pub fn on_memory_allocation(&mut self, allocation: MemoryAllocation) {
        if !self.has_memory_callback || self.last_memory_allocation == Some(allocation) {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        engine.decoder.set_memory_allocation(&allocation);
        self.last_memory_allocation = Some(allocation);
        self.emit(ClientEvent::SetMemoryAllocation { allocation });
    }

    /// Marks the stream lost because a sibling in its share group lost its context.
    pub fn mark_context_lost(&mut self, reason: LossReason) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if engine.command_buffer.set_context_lost(reason) {
            engine.command_buffer.report_state();
            self.on_fault();
        }
    }

    /// An error latched: send the single `Destroyed`, then ask the channel for teardown.
    fn on_fault(&mut self) {
        if self.destroyed_sent {
            return;
        }
        let error = self.state().error;
        if !error.is_error() {
            return;
        }
        self.destroyed_sent = true;
        if let Some(engine) = self.engine.as_mut() {
            engine.command_buffer.report_state();
        }
        if let Some(reason) = error.loss_reason() {
            self.services.stats.inc_contexts_lost();
            let lose_all = self.config.lose_share_group_on_loss.unwrap_or_else(|| {
                self.services
                    .backend
                    .contexts
                    .loses_all_contexts_on_loss()
            });
            if lose_all {
                self.loss_to_propagate = Some(reason);
            }
        }
        tracing::warn!(stream = %self.id, ?error, "stream lost");
        self.emit(ClientEvent::Destroyed { error });
        self.services
            .tasks
            .post(ChannelTask::Teardown { stream: self.id });
    }

    /// Ordered teardown. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let retired = self
            .services
            .sync_points
            .retire_all_for_producer(self.id.producer());
        if retired > 0 {
            tracing::debug!(stream = %self.id, retired, "force-retired outstanding sync points");
            self.services
                .stats
                .add_sync_points_force_retired(retired as u64);
        }

        let engine = self.engine.take();
        let mut observers = std::mem::take(&mut self.destruction_observers);
        match engine {
            Some(Engine {
                command_buffer,
                mut decoder,
                scheduler,
                memory_client,
            }) => {
                drop(scheduler);
                let have_context = decoder.make_current();
                for observer in observers.iter_mut() {
                    observer.on_will_destroy(self.id);
                }
                decoder.destroy(have_context, &self.transfer_buffers);
                drop(command_buffer);
                drop(memory_client);
            }
            None => {
                for observer in observers.iter_mut() {
                    observer.on_will_destroy(self.id);
                }
            }
        }

        self.services.stats.inc_streams_destroyed();
        tracing::info!(stream = %self.id, client = %self.client, "stream destroyed");
    }
}

impl Drop for CommandStreamController {
    fn drop(&mut self) {
        self.destroy();
    }
}
