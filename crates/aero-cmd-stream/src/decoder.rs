//! Command decoding.
//!
//! The decoder owns the stream's logical context, its command handler and its memory tracking
//! group. It understands the handful of common opcodes itself and forwards everything from
//! [`opcode::FIRST_HANDLER_OPCODE`] on to the pluggable [`CommandHandler`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use aero_gpu_memory::{MemoryAllocation, TrackingGroup};
use aero_sync_point::SyncPoint;

use crate::command::{opcode, CommandHeader};
use crate::command_buffer::CommandBufferService;
use crate::context::{Capabilities, ContextAttributes, LogicalContext};
use crate::error::{ContextError, DecodeError, LossReason, ParseError, StreamFault};
use crate::ids::StreamId;
use crate::shared_memory::TransferBufferRegistry;
use crate::stats::ProcessStats;

/// Side outputs of command execution, forwarded to the client by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecoderEvent {
    CacheShader { key: String, blob: Vec<u8> },
}

/// Everything a handler may touch while executing one command.
pub struct ExecContext<'a> {
    pub stream: StreamId,
    pub context: &'a mut dyn LogicalContext,
    pub transfer_buffers: &'a TransferBufferRegistry,
    pub memory: &'a TrackingGroup,
    events: &'a mut Vec<DecoderEvent>,
}

impl ExecContext<'_> {
    pub fn cache_shader(&mut self, key: String, blob: Vec<u8>) {
        self.events.push(DecoderEvent::CacheShader { key, blob });
    }
}

/// Graphics-API semantics for handler opcodes.
pub trait CommandHandler: Send {
    fn initialize(&mut self, _capabilities: &Capabilities) -> Result<(), ContextError> {
        Ok(())
    }

    fn execute(
        &mut self,
        cx: &mut ExecContext<'_>,
        opcode: u16,
        args: &[u32],
    ) -> Result<(), DecodeError>;

    fn has_more_idle_work(&self) -> bool {
        false
    }

    fn perform_idle_work(&mut self, _cx: &mut ExecContext<'_>) {}

    fn set_memory_allocation(&mut self, _allocation: &MemoryAllocation) {}

    /// Releases handler resources. `cx` is `None` when the context could not be made current,
    /// in which case GPU-side objects must be abandoned rather than deleted.
    fn destroy(&mut self, cx: Option<&mut ExecContext<'_>>);
}

pub trait HandlerFactory: Send + Sync {
    fn create_handler(&self, stream: StreamId) -> Box<dyn CommandHandler>;
}

/// What the scheduler has to do after a command ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandAction {
    None,
    SetToken(u32),
    WaitSyncPoint(SyncPoint),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedCommand {
    pub opcode: u16,
    pub next_get: u32,
    pub action: CommandAction,
}

struct PendingQuery {
    fence: u64,
    signals: Vec<u32>,
}

/// Queries ended in the stream wait for the context fence inserted at `END_QUERY`.
#[derive(Default)]
struct QueryTracker {
    active: HashSet<u32>,
    pending: BTreeMap<u32, PendingQuery>,
}

impl QueryTracker {
    fn begin(&mut self, query_id: u32) -> bool {
        if self.active.contains(&query_id) || self.pending.contains_key(&query_id) {
            return false;
        }
        self.active.insert(query_id)
    }

    fn end(&mut self, query_id: u32, fence: u64) -> bool {
        if !self.active.remove(&query_id) {
            return false;
        }
        self.pending.insert(
            query_id,
            PendingQuery {
                fence,
                signals: Vec::new(),
            },
        );
        true
    }

    /// Returns `Some(signal_id)` when the ack can go out right away.
    fn signal(&mut self, query_id: u32, signal_id: u32) -> Option<u32> {
        match self.pending.get_mut(&query_id) {
            Some(query) => {
                query.signals.push(signal_id);
                None
            }
            None => Some(signal_id),
        }
    }

    fn process(&mut self, completed_fence: u64) -> Vec<u32> {
        let done: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, query)| query.fence <= completed_fence)
            .map(|(&id, _)| id)
            .collect();
        let mut acks = Vec::new();
        for id in done {
            if let Some(query) = self.pending.remove(&id) {
                acks.extend(query.signals);
            }
        }
        acks
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

pub struct CommandDecoder {
    stream: StreamId,
    context: Box<dyn LogicalContext>,
    handler: Box<dyn CommandHandler>,
    memory: TrackingGroup,
    capabilities: Capabilities,
    queries: QueryTracker,
    events: Vec<DecoderEvent>,
    recoverable_errors: u64,
    stats: Arc<ProcessStats>,
}

impl fmt::Debug for CommandDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDecoder")
            .field("stream", &self.stream)
            .field("capabilities", &self.capabilities)
            .field("recoverable_errors", &self.recoverable_errors)
            .finish()
    }
}

impl CommandDecoder {
    /// Initializes and activates `context`, then the handler. Nothing survives a failure.
    pub fn initialize(
        stream: StreamId,
        mut context: Box<dyn LogicalContext>,
        mut handler: Box<dyn CommandHandler>,
        memory: TrackingGroup,
        attributes: &ContextAttributes,
        stats: Arc<ProcessStats>,
    ) -> Result<Self, ContextError> {
        let capabilities = context.initialize(attributes)?;
        if !context.activate() {
            return Err(ContextError::MakeCurrentFailed);
        }
        if let Some(reason) = context.reset_status() {
            return Err(ContextError::Lost(reason));
        }
        handler.initialize(&capabilities)?;
        Ok(Self {
            stream,
            context,
            handler,
            memory,
            capabilities,
            queries: QueryTracker::default(),
            events: Vec::new(),
            recoverable_errors: 0,
            stats,
        })
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn is_virtualized(&self) -> bool {
        self.context.is_virtual()
    }

    pub fn make_current(&mut self) -> bool {
        self.context.activate()
    }

    pub fn reset_status(&self) -> Option<LossReason> {
        self.context.reset_status()
    }

    pub fn recoverable_errors(&self) -> u64 {
        self.recoverable_errors
    }

    pub fn take_events(&mut self) -> Vec<DecoderEvent> {
        std::mem::take(&mut self.events)
    }

    /// Decodes and executes the command at the current get offset.
    pub fn process_next(
        &mut self,
        command_buffer: &CommandBufferService,
        transfer_buffers: &TransferBufferRegistry,
    ) -> Result<DecodedCommand, StreamFault> {
        let ring = command_buffer.ring().ok_or(ParseError::OutOfBounds)?;
        let num_entries = command_buffer.num_entries();
        let get = command_buffer.get_offset();

        let header = CommandHeader::decode(
            ring.read_word(get as usize)
                .ok_or(ParseError::OutOfBounds)?,
        );
        if header.size == 0 {
            return Err(ParseError::InvalidSize.into());
        }
        // A command may not run past put (unflushed words) nor past the ring end.
        let put = command_buffer.put_offset();
        let available = if put >= get { put - get } else { num_entries - get };
        if header.size > available {
            return Err(ParseError::OutOfBounds.into());
        }
        let end = u64::from(get) + u64::from(header.size);
        let args = ring
            .read_words(get as usize + 1, header.size as usize - 1)
            .ok_or(ParseError::OutOfBounds)?;

        let action = match header.opcode {
            opcode::NOOP => CommandAction::None,
            opcode::SET_TOKEN => CommandAction::SetToken(first_arg(&args)?),
            opcode::WAIT_SYNC_POINT => CommandAction::WaitSyncPoint(SyncPoint(first_arg(&args)?)),
            opcode::BEGIN_QUERY => {
                let query_id = first_arg(&args)?;
                if !self.queries.begin(query_id) {
                    self.recoverable_error(format_args!("query {query_id} already active"));
                }
                CommandAction::None
            }
            opcode::END_QUERY => {
                let query_id = first_arg(&args)?;
                let fence = self.context.insert_fence();
                if !self.queries.end(query_id, fence) {
                    self.recoverable_error(format_args!("query {query_id} is not active"));
                }
                CommandAction::None
            }
            op if op >= opcode::FIRST_HANDLER_OPCODE => {
                let mut cx = ExecContext {
                    stream: self.stream,
                    context: self.context.as_mut(),
                    transfer_buffers,
                    memory: &self.memory,
                    events: &mut self.events,
                };
                match self.handler.execute(&mut cx, op, &args) {
                    Ok(()) => {}
                    Err(DecodeError::OutOfMemory { requested }) => {
                        self.stats.inc_out_of_memory_errors();
                        self.recoverable_error(format_args!(
                            "out of memory allocating {requested} bytes"
                        ));
                    }
                    Err(DecodeError::Parse(err)) => return Err(StreamFault::Parse(err)),
                    Err(DecodeError::ContextLost(reason)) => {
                        return Err(StreamFault::ContextLost(reason))
                    }
                }
                CommandAction::None
            }
            _ => return Err(ParseError::UnknownCommand.into()),
        };

        let next_get = if end == u64::from(num_entries) {
            0
        } else {
            end as u32
        };
        Ok(DecodedCommand {
            opcode: header.opcode,
            next_get,
            action,
        })
    }

    fn recoverable_error(&mut self, what: fmt::Arguments<'_>) {
        self.recoverable_errors += 1;
        tracing::debug!(stream = %self.stream, "recoverable decode error: {what}");
    }

    pub fn has_pending_queries(&self) -> bool {
        self.queries.has_pending()
    }

    /// Returns the signal ids of every query whose fence completed.
    pub fn process_pending_queries(&mut self) -> Vec<u32> {
        if !self.queries.has_pending() {
            return Vec::new();
        }
        let completed = self.context.completed_fence();
        self.queries.process(completed)
    }

    pub fn signal_query(&mut self, query_id: u32, signal_id: u32) -> Option<u32> {
        self.queries.signal(query_id, signal_id)
    }

    pub fn has_more_idle_work(&self) -> bool {
        self.handler.has_more_idle_work()
    }

    pub fn perform_idle_work(&mut self, transfer_buffers: &TransferBufferRegistry) {
        let mut cx = ExecContext {
            stream: self.stream,
            context: self.context.as_mut(),
            transfer_buffers,
            memory: &self.memory,
            events: &mut self.events,
        };
        self.handler.perform_idle_work(&mut cx);
    }

    pub fn set_memory_allocation(&mut self, allocation: &MemoryAllocation) {
        self.handler.set_memory_allocation(allocation);
    }

    /// Tears the handler down, then drops the context and the tracking group.
    pub fn destroy(mut self, have_context: bool, transfer_buffers: &TransferBufferRegistry) {
        if have_context {
            let mut cx = ExecContext {
                stream: self.stream,
                context: self.context.as_mut(),
                transfer_buffers,
                memory: &self.memory,
                events: &mut self.events,
            };
            self.handler.destroy(Some(&mut cx));
        } else {
            self.handler.destroy(None);
        }
    }
}

fn first_arg(args: &[u32]) -> Result<u32, ParseError> {
    args.first().copied().ok_or(ParseError::InvalidArguments)
}
