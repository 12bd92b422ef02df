use std::collections::{HashMap, VecDeque};
use std::fmt;

use aero_cmd_stream::software::{opcode as sw, SoftwareBackend};
use aero_cmd_stream::{
    ChannelConfig, ChannelManager, ClientEvent, ClientId, CommandWriter, CreateStreamParams,
    Dispatch, ProcessStatsSnapshot, Reply, Request, SharedMemory, StreamId, SyncPoint,
    SHARED_STATE_MIN_BYTES,
};
use serde::Serialize;

use crate::error::ReplayError;
use crate::script::{Script, ScriptCommand, Step};

const NS_PER_MS: u64 = 1_000_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    /// Immediate answer to a request that expects one.
    Reply { request: String, reply: Reply },
    Deferred { request: String },
    Rejected { request: String, error: String },
    /// Asynchronous client-bound message.
    Message { event: ClientEvent },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub time_ns: u64,
    pub stream: String,
    #[serde(flatten)]
    pub record: LogRecord,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.time_ns as f64 / NS_PER_MS as f64;
        write!(f, "{ms:>9.3}ms {:<10} ", self.stream)?;
        match &self.record {
            LogRecord::Reply { request, reply } => {
                write!(f, "reply    {request} {}", json(reply))
            }
            LogRecord::Deferred { request } => write!(f, "deferred {request}"),
            LogRecord::Rejected { request, error } => write!(f, "rejected {request}: {error}"),
            LogRecord::Message { event } => write!(f, "message  {}", json(event)),
        }
    }
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| format!("<{err}>"))
}

/// Everything the client would have observed, plus the final counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplayLog {
    pub entries: Vec<LogEntry>,
    pub end_time_ns: u64,
    pub stats: ProcessStatsSnapshot,
}

impl ReplayLog {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out.push_str(&format!("stats {}\n", json(&self.stats)));
        out
    }

    pub fn messages_for(&self, stream: &str) -> Vec<&ClientEvent> {
        self.entries
            .iter()
            .filter(|entry| entry.stream == stream)
            .filter_map(|entry| match &entry.record {
                LogRecord::Message { event } => Some(event),
                _ => None,
            })
            .collect()
    }
}

struct ScriptStream {
    id: StreamId,
    writer: Option<CommandWriter>,
    flush_count: u32,
}

/// Drives a [`ChannelManager`] over the software backend with a virtual clock.
pub struct Replayer {
    channel: ChannelManager,
    backend: std::sync::Arc<SoftwareBackend>,
    now_ns: u64,
    step: usize,
    streams: HashMap<String, ScriptStream>,
    names: HashMap<StreamId, String>,
    sync_points: HashMap<String, SyncPoint>,
    /// Sync point names waiting for a deferred `insert_sync_point` reply.
    pending_names: HashMap<StreamId, VecDeque<String>>,
    entries: Vec<LogEntry>,
}

impl Replayer {
    pub fn new(config: ChannelConfig) -> Self {
        let backend = SoftwareBackend::new();
        let channel = ChannelManager::new(config, backend.gpu_backend());
        Self {
            channel,
            backend,
            now_ns: 0,
            step: 0,
            streams: HashMap::new(),
            names: HashMap::new(),
            sync_points: HashMap::new(),
            pending_names: HashMap::new(),
            entries: Vec::new(),
        }
    }

    pub fn backend(&self) -> &std::sync::Arc<SoftwareBackend> {
        &self.backend
    }

    pub fn channel(&self) -> &ChannelManager {
        &self.channel
    }

    pub fn run(&mut self, script: &Script) -> Result<(), ReplayError> {
        for (index, step) in script.steps.iter().enumerate() {
            self.step = index;
            tracing::debug!(step = index, ?step, "replaying step");
            self.apply(step)?;
            self.pump();
        }
        Ok(())
    }

    pub fn finish(mut self) -> ReplayLog {
        self.pump();
        ReplayLog {
            entries: std::mem::take(&mut self.entries),
            end_time_ns: self.now_ns,
            stats: self.channel.stats().snapshot(),
        }
    }

    fn apply(&mut self, step: &Step) -> Result<(), ReplayError> {
        match step {
            Step::CreateChannel { client } => {
                let result = self.channel.create_channel(ClientId(*client));
                self.channel_result(result)
            }
            Step::RemoveChannel { client } => {
                let result = self.channel.remove_channel(ClientId(*client));
                self.channel_result(result)
            }
            Step::CreateStream {
                name,
                client,
                share_group,
                surface,
                attributes,
                visible,
            } => {
                if self.streams.contains_key(name) {
                    return Err(ReplayError::DuplicateStream {
                        step: self.step,
                        name: name.clone(),
                    });
                }
                let share_group = share_group
                    .as_deref()
                    .map(|group| self.stream_id(group))
                    .transpose()?;
                let defaults = CreateStreamParams::default();
                let params = CreateStreamParams {
                    surface: surface.unwrap_or(defaults.surface),
                    attributes: attributes.clone(),
                    share_group,
                    visible: *visible,
                };
                let id = self
                    .channel
                    .create_stream(ClientId(*client), params)
                    .map_err(|source| ReplayError::Channel {
                        step: self.step,
                        source,
                    })?;
                self.names.insert(id, name.clone());
                self.streams.insert(
                    name.clone(),
                    ScriptStream {
                        id,
                        writer: None,
                        flush_count: 0,
                    },
                );
                Ok(())
            }
            Step::Initialize { stream } => {
                let shared_state = SharedMemory::new(SHARED_STATE_MIN_BYTES);
                self.send(stream, Request::Initialize { shared_state })?;
                Ok(())
            }
            Step::CreateRing {
                stream,
                id,
                entries,
            } => {
                let bytes = *entries as usize * 4;
                let ring = SharedMemory::new(bytes);
                self.send(
                    stream,
                    Request::RegisterTransferBuffer {
                        id: *id,
                        buffer: ring.clone(),
                        size: bytes as u32,
                    },
                )?;
                self.script_stream(stream)?.writer = Some(CommandWriter::new(ring, 0));
                Ok(())
            }
            Step::CreateTransferBuffer {
                stream,
                id,
                size,
                fill,
            } => {
                let buffer = SharedMemory::new(*size as usize);
                buffer.write_bytes(0, &vec![*fill; *size as usize]);
                self.send(
                    stream,
                    Request::RegisterTransferBuffer {
                        id: *id,
                        buffer,
                        size: *size,
                    },
                )?;
                Ok(())
            }
            Step::SetGetBuffer { stream, buffer_id } => {
                self.send(
                    stream,
                    Request::SetGetBuffer {
                        buffer_id: *buffer_id,
                    },
                )?;
                Ok(())
            }
            Step::Submit { stream, commands } => self.submit(stream, commands),
            Step::Flush {
                stream,
                put_offset,
                flush_count,
            } => {
                self.script_stream(stream)?.flush_count = *flush_count;
                self.send(
                    stream,
                    Request::AsyncFlush {
                        put_offset: *put_offset,
                        flush_count: *flush_count,
                    },
                )?;
                Ok(())
            }
            Step::InsertSyncPoint { stream, name } => {
                match self.send(stream, Request::InsertSyncPoint)? {
                    Some(Reply::SyncPoint { sync_point }) => {
                        self.sync_points.insert(name.clone(), sync_point);
                    }
                    Some(_) => {}
                    None => {
                        let id = self.stream_id(stream)?;
                        self.pending_names
                            .entry(id)
                            .or_default()
                            .push_back(name.clone());
                    }
                }
                Ok(())
            }
            Step::RetireSyncPoint { stream, name } => {
                let sync_point = self.sync_point(name)?;
                self.send(stream, Request::RetireSyncPoint { sync_point })?;
                Ok(())
            }
            Step::WaitSyncPoint { stream, name } => {
                let sync_point = self.sync_point(name)?;
                self.send(stream, Request::WaitSyncPoint { sync_point })?;
                Ok(())
            }
            Step::SignalSyncPoint {
                stream,
                name,
                signal_id,
            } => {
                let sync_point = self.sync_point(name)?;
                self.send(
                    stream,
                    Request::SignalSyncPoint {
                        sync_point,
                        signal_id: *signal_id,
                    },
                )?;
                Ok(())
            }
            Step::SetVisible { stream, visible } => {
                self.send(stream, Request::SetSurfaceVisible { visible: *visible })?;
                Ok(())
            }
            Step::SetMemoryCallback { stream, enabled } => {
                self.send(
                    stream,
                    Request::SetMemoryAllocationChangedCallback {
                        has_callback: *enabled,
                    },
                )?;
                Ok(())
            }
            Step::Echo { stream, id } => {
                self.send(stream, Request::Echo { id: *id })?;
                Ok(())
            }
            Step::Advance { ms } => {
                self.advance(*ms);
                Ok(())
            }
            Step::DestroyStream { stream } => {
                let id = self.stream_id(stream)?;
                let result = self.channel.destroy_stream(id);
                self.channel_result(result)?;
                self.streams.remove(stream);
                Ok(())
            }
        }
    }

    fn channel_result(&self, result: aero_cmd_stream::Result<()>) -> Result<(), ReplayError> {
        result.map_err(|source| ReplayError::Channel {
            step: self.step,
            source,
        })
    }

    fn script_stream(&mut self, name: &str) -> Result<&mut ScriptStream, ReplayError> {
        let step = self.step;
        self.streams
            .get_mut(name)
            .ok_or_else(|| ReplayError::UnknownStream {
                step,
                name: name.to_string(),
            })
    }

    fn stream_id(&self, name: &str) -> Result<StreamId, ReplayError> {
        self.streams
            .get(name)
            .map(|stream| stream.id)
            .ok_or_else(|| ReplayError::UnknownStream {
                step: self.step,
                name: name.to_string(),
            })
    }

    fn sync_point(&self, name: &str) -> Result<SyncPoint, ReplayError> {
        self.sync_points
            .get(name)
            .copied()
            .ok_or_else(|| ReplayError::UnknownSyncPoint {
                step: self.step,
                name: name.to_string(),
            })
    }

    fn submit(&mut self, stream: &str, commands: &[ScriptCommand]) -> Result<(), ReplayError> {
        let step = self.step;
        let mut resolved = Vec::with_capacity(commands.len());
        for command in commands {
            resolved.push(self.encode(command)?);
        }
        let script_stream = self.script_stream(stream)?;
        let writer = script_stream
            .writer
            .as_mut()
            .ok_or_else(|| ReplayError::NoRing {
                step,
                name: stream.to_string(),
            })?;
        for (opcode, args) in resolved {
            writer
                .command(opcode, &args)
                .map_err(|source| ReplayError::Write { step, source })?;
        }
        script_stream.flush_count = script_stream.flush_count.wrapping_add(1);
        let request = Request::AsyncFlush {
            put_offset: writer.put_offset(),
            flush_count: script_stream.flush_count,
        };
        self.send(stream, request)?;
        Ok(())
    }

    fn encode(&self, command: &ScriptCommand) -> Result<(u16, Vec<u32>), ReplayError> {
        use aero_cmd_stream::opcode;

        Ok(match command {
            ScriptCommand::Noop => (opcode::NOOP, vec![]),
            ScriptCommand::SetToken(token) => (opcode::SET_TOKEN, vec![*token]),
            ScriptCommand::WaitSyncPoint(name) => {
                (opcode::WAIT_SYNC_POINT, vec![self.sync_point(name)?.get()])
            }
            ScriptCommand::BeginQuery(id) => (opcode::BEGIN_QUERY, vec![*id]),
            ScriptCommand::EndQuery(id) => (opcode::END_QUERY, vec![*id]),
            ScriptCommand::Alloc { id, size } => (sw::ALLOC, vec![*id, *size]),
            ScriptCommand::Free { id } => (sw::FREE, vec![*id]),
            ScriptCommand::Upload {
                shm_id,
                offset,
                size,
            } => (sw::UPLOAD, vec![*shm_id, *offset, *size]),
            ScriptCommand::CacheShader { key } => (sw::CACHE_SHADER, vec![*key]),
            ScriptCommand::LoseContext(reason) => (sw::LOSE_CONTEXT, vec![reason.code()]),
            ScriptCommand::Raw { opcode: raw, args } => (*raw, args.clone()),
        })
    }

    /// Sends one request and logs what the client would see. Rejections are logged, not
    /// returned: they are part of the observable behaviour being replayed.
    fn send(&mut self, stream: &str, request: Request) -> Result<Option<Reply>, ReplayError> {
        let id = self.stream_id(stream)?;
        let name = request.name().to_string();
        let expects_reply = request.expects_reply();
        let record = match self.channel.handle_message(self.now_ns, id, request) {
            Ok(Dispatch::Replied(reply)) => {
                let logged = expects_reply.then(|| LogRecord::Reply {
                    request: name,
                    reply: reply.clone(),
                });
                self.log(id, logged);
                return Ok(Some(reply));
            }
            Ok(Dispatch::Deferred) => LogRecord::Deferred { request: name },
            Err(err) => {
                tracing::warn!(step = self.step, %stream, request = %name, "request rejected: {err}");
                LogRecord::Rejected {
                    request: name,
                    error: err.to_string(),
                }
            }
        };
        self.log(id, Some(record));
        Ok(None)
    }

    fn log(&mut self, stream: StreamId, record: Option<LogRecord>) {
        // Replies are logged after any message the request produced synchronously.
        self.collect_messages();
        if let Some(record) = record {
            self.push_entry(stream, record);
        }
    }

    fn push_entry(&mut self, stream: StreamId, record: LogRecord) {
        let stream = self
            .names
            .get(&stream)
            .cloned()
            .unwrap_or_else(|| stream.to_string());
        self.entries.push(LogEntry {
            time_ns: self.now_ns,
            stream,
            record,
        });
    }

    fn collect_messages(&mut self) {
        for message in self.channel.drain_client_messages() {
            if let ClientEvent::Reply {
                request,
                reply: Reply::SyncPoint { sync_point },
            } = &message.event
            {
                if request == Request::InsertSyncPoint.name() {
                    let name = self
                        .pending_names
                        .get_mut(&message.stream)
                        .and_then(VecDeque::pop_front);
                    if let Some(name) = name {
                        self.sync_points.insert(name, *sync_point);
                    }
                }
            }
            self.push_entry(
                message.stream,
                LogRecord::Message {
                    event: message.event,
                },
            );
        }
    }

    fn pump(&mut self) {
        self.channel.run_tasks(self.now_ns);
        self.collect_messages();
    }

    /// Moves the clock forward, stopping at every task deadline on the way.
    fn advance(&mut self, ms: u64) {
        let target = self.now_ns.saturating_add(ms.saturating_mul(NS_PER_MS));
        // Deadlines at or before `now_ns` were already given their passes.
        while let Some(deadline) = self.channel.next_task_deadline() {
            if deadline <= self.now_ns || deadline > target {
                break;
            }
            self.now_ns = deadline;
            self.pump();
        }
        self.now_ns = target;
        self.pump();
    }
}

/// Replays `script` against a fresh channel.
pub fn replay_script(config: ChannelConfig, script: &Script) -> Result<ReplayLog, ReplayError> {
    let mut replayer = Replayer::new(config);
    replayer.run(script)?;
    Ok(replayer.finish())
}
