//! Shared helpers for `aero-cmd-stream` integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use aero_cmd_stream::software::SoftwareBackend;
use aero_cmd_stream::{
    ChannelConfig, ChannelManager, ClientEvent, ClientId, ClientMessage, CommandWriter,
    CreateStreamParams, Dispatch, Reply, Request, SharedMemory, StreamId, SHARED_STATE_MIN_BYTES,
};

pub const MS: u64 = 1_000_000;
pub const RING_ID: i32 = 1;
pub const RING_ENTRIES: usize = 256;

pub struct TestStream {
    pub id: StreamId,
    pub ring: SharedMemory,
    pub shared_state: SharedMemory,
    pub writer: CommandWriter,
    pub flush_count: u32,
}

pub struct Harness {
    pub channel: ChannelManager,
    pub backend: Arc<SoftwareBackend>,
    pub client: ClientId,
    pub now_ns: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        let backend = SoftwareBackend::new();
        let mut channel = ChannelManager::new(config, backend.gpu_backend());
        let client = ClientId(1);
        channel.create_channel(client).unwrap();
        Self {
            channel,
            backend,
            client,
            now_ns: 0,
        }
    }

    pub fn create_stream(&mut self, params: CreateStreamParams) -> StreamId {
        self.channel.create_stream(self.client, params).unwrap()
    }

    pub fn initialize(&mut self, id: StreamId) -> (Reply, SharedMemory) {
        let shared_state = SharedMemory::new(SHARED_STATE_MIN_BYTES);
        let reply = self.request(
            id,
            Request::Initialize {
                shared_state: shared_state.clone(),
            },
        );
        (reply, shared_state)
    }

    /// Creates, initializes and binds a ring to a new stream.
    pub fn stream_with(&mut self, params: CreateStreamParams) -> TestStream {
        let id = self.create_stream(params);
        let (reply, shared_state) = self.initialize(id);
        assert!(
            matches!(reply, Reply::Initialize { success: true, .. }),
            "initialize failed: {reply:?}"
        );
        let ring = SharedMemory::new(RING_ENTRIES * 4);
        self.request(
            id,
            Request::RegisterTransferBuffer {
                id: RING_ID,
                buffer: ring.clone(),
                size: (RING_ENTRIES * 4) as u32,
            },
        );
        self.request(id, Request::SetGetBuffer { buffer_id: RING_ID });
        TestStream {
            id,
            writer: CommandWriter::new(ring.clone(), 0),
            ring,
            shared_state,
            flush_count: 0,
        }
    }

    pub fn stream(&mut self) -> TestStream {
        self.stream_with(CreateStreamParams::default())
    }

    pub fn send(&mut self, id: StreamId, request: Request) -> Dispatch {
        self.channel
            .handle_message(self.now_ns, id, request)
            .unwrap_or_else(|err| panic!("request to {id} failed: {err}"))
    }

    /// Sends a request that must be answered right away.
    pub fn request(&mut self, id: StreamId, request: Request) -> Reply {
        match self.send(id, request) {
            Dispatch::Replied(reply) => reply,
            Dispatch::Deferred => panic!("request to {id} was deferred"),
        }
    }

    /// Flushes everything written so far with the next flush count.
    pub fn flush(&mut self, stream: &mut TestStream) -> Dispatch {
        stream.flush_count += 1;
        let request = Request::AsyncFlush {
            put_offset: stream.writer.put_offset(),
            flush_count: stream.flush_count,
        };
        self.send(stream.id, request)
    }

    pub fn run_tasks(&mut self) -> usize {
        self.channel.run_tasks(self.now_ns)
    }

    pub fn advance(&mut self, ms: u64) -> usize {
        self.now_ns += ms * MS;
        self.run_tasks()
    }

    pub fn messages(&mut self) -> Vec<ClientMessage> {
        self.channel.drain_client_messages()
    }

    pub fn events_for(&mut self, id: StreamId) -> Vec<ClientEvent> {
        self.messages()
            .into_iter()
            .filter(|m| m.stream == id)
            .map(|m| m.event)
            .collect()
    }
}
