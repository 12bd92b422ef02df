//! Routing of producer requests to stream controllers.
//!
//! The [`ChannelManager`] is the single loop that owns every controller. It queues ordered
//! requests of a stream while that stream waits on a sync point, runs the continuations other
//! threads post, and tracks share groups so that context loss can be propagated.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use aero_gpu_memory::MemoryBudgetManager;
use aero_sync_point::SyncPointManager;

use crate::config::ChannelConfig;
use crate::context::ShareGroup;
use crate::controller::{
    CommandStreamController, DestructionObserver, GpuBackend, Outbox, StreamServices,
};
use crate::error::{CommandStreamError, LossReason, Result};
use crate::ids::{ClientId, ShareGroupId, StreamId};
use crate::messages::{ClientEvent, ClientMessage, CreateStreamParams, Dispatch, Request};
use crate::mailbox::Mailbox;
use crate::stats::ProcessStats;
use crate::task::{ChannelTask, TaskQueue};
use crate::watchdog::{NullWatchdog, Watchdog};

/// Bound on task passes per `run_tasks` call; zero-delay polls may keep re-posting.
const MAX_TASK_PASSES: usize = 64;

struct StreamSlot {
    controller: CommandStreamController,
    deferred: VecDeque<Request>,
    share_group: ShareGroupId,
}

struct ShareGroupRecord {
    group: Arc<ShareGroup>,
    members: BTreeSet<StreamId>,
}

pub struct ChannelManager {
    config: ChannelConfig,
    services: StreamServices,
    tasks: TaskQueue,
    clients: HashSet<ClientId>,
    streams: BTreeMap<StreamId, StreamSlot>,
    share_groups: HashMap<ShareGroupId, ShareGroupRecord>,
    next_stream_id: u32,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig, backend: GpuBackend) -> Self {
        let memory = MemoryBudgetManager::new(config.memory.clone());
        Self::with_services(
            config,
            backend,
            Arc::new(SyncPointManager::new()),
            memory,
            Arc::new(ProcessStats::new()),
            Arc::new(NullWatchdog),
        )
    }

    /// Builds a manager around process-wide services owned by the caller.
    pub fn with_services(
        config: ChannelConfig,
        backend: GpuBackend,
        sync_points: Arc<SyncPointManager>,
        memory: Arc<MemoryBudgetManager>,
        stats: Arc<ProcessStats>,
        watchdog: Arc<dyn Watchdog>,
    ) -> Self {
        let tasks = TaskQueue::new();
        let outbox: Outbox = Arc::new(Mailbox::new());
        let services = StreamServices {
            sync_points,
            memory,
            stats,
            watchdog,
            backend,
            tasks: tasks.sender(),
            outbox,
        };
        Self {
            config,
            services,
            tasks,
            clients: HashSet::new(),
            streams: BTreeMap::new(),
            share_groups: HashMap::new(),
            next_stream_id: 1,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn sync_points(&self) -> &Arc<SyncPointManager> {
        &self.services.sync_points
    }

    pub fn memory(&self) -> &Arc<MemoryBudgetManager> {
        &self.services.memory
    }

    pub fn stats(&self) -> &Arc<ProcessStats> {
        &self.services.stats
    }

    pub fn create_channel(&mut self, client: ClientId) -> Result<()> {
        if !self.clients.insert(client) {
            return Err(CommandStreamError::invalid(format!(
                "{client} already has a channel"
            )));
        }
        tracing::info!(%client, "channel created");
        Ok(())
    }

    /// Channel teardown: destroys every stream of `client`.
    pub fn remove_channel(&mut self, client: ClientId) -> Result<()> {
        if !self.clients.remove(&client) {
            return Err(CommandStreamError::UnknownClient(client));
        }
        let owned: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, slot)| slot.controller.client() == client)
            .map(|(&id, _)| id)
            .collect();
        for stream in owned {
            self.remove_stream(stream);
        }
        tracing::info!(%client, "channel removed");
        Ok(())
    }

    pub fn create_stream(&mut self, client: ClientId, params: CreateStreamParams) -> Result<StreamId> {
        if !self.clients.contains(&client) {
            return Err(CommandStreamError::UnknownClient(client));
        }
        let id = StreamId(self.next_stream_id);

        let group_id = match params.share_group {
            Some(other) => {
                let slot = self
                    .streams
                    .get(&other)
                    .ok_or(CommandStreamError::UnknownStream(other))?;
                if slot.controller.client() != client {
                    return Err(CommandStreamError::invalid(format!(
                        "{other} belongs to another client"
                    )));
                }
                slot.share_group
            }
            None => ShareGroupId(id.0),
        };
        self.next_stream_id += 1;

        let record = self
            .share_groups
            .entry(group_id)
            .or_insert_with(|| ShareGroupRecord {
                group: ShareGroup::new(group_id),
                members: BTreeSet::new(),
            });
        record.members.insert(id);
        let controller = CommandStreamController::new(
            id,
            client,
            params,
            self.config.stream.clone(),
            self.services.clone(),
            Arc::clone(&record.group),
        );
        self.streams.insert(
            id,
            StreamSlot {
                controller,
                deferred: VecDeque::new(),
                share_group: group_id,
            },
        );
        tracing::info!(stream = %id, %client, share_group = group_id.0, "stream created");
        Ok(id)
    }

    /// Explicit close.
    pub fn destroy_stream(&mut self, stream: StreamId) -> Result<()> {
        if !self.streams.contains_key(&stream) {
            return Err(CommandStreamError::UnknownStream(stream));
        }
        self.remove_stream(stream);
        Ok(())
    }

    fn remove_stream(&mut self, stream: StreamId) {
        let Some(mut slot) = self.streams.remove(&stream) else {
            return;
        };
        if !slot.deferred.is_empty() {
            tracing::debug!(
                %stream,
                dropped = slot.deferred.len(),
                "dropping deferred requests of destroyed stream"
            );
        }
        slot.controller.destroy();
        if let Some(record) = self.share_groups.get_mut(&slot.share_group) {
            record.members.remove(&stream);
            if record.members.is_empty() {
                self.share_groups.remove(&slot.share_group);
            }
        }
    }

    pub fn stream(&self, stream: StreamId) -> Option<&CommandStreamController> {
        self.streams.get(&stream).map(|slot| &slot.controller)
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn deferred_len(&self, stream: StreamId) -> usize {
        self.streams
            .get(&stream)
            .map(|slot| slot.deferred.len())
            .unwrap_or(0)
    }

    pub fn share_group_members(&self, stream: StreamId) -> Vec<StreamId> {
        self.streams
            .get(&stream)
            .and_then(|slot| self.share_groups.get(&slot.share_group))
            .map(|record| record.members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn add_destruction_observer(
        &mut self,
        stream: StreamId,
        observer: Box<dyn DestructionObserver>,
    ) -> Result<()> {
        let slot = self
            .streams
            .get_mut(&stream)
            .ok_or(CommandStreamError::UnknownStream(stream))?;
        slot.controller.add_destruction_observer(observer);
        Ok(())
    }

    /// Routes one request. Ordered requests of an unscheduled stream are queued and answered
    /// later through [`ClientEvent::Reply`].
    pub fn handle_message(
        &mut self,
        now_ns: u64,
        stream: StreamId,
        request: Request,
    ) -> Result<Dispatch> {
        let slot = self
            .streams
            .get_mut(&stream)
            .ok_or(CommandStreamError::UnknownStream(stream))?;

        if !request.bypasses_deferral() && must_defer(slot, &request) {
            tracing::debug!(%stream, request = request.name(), "deferring request");
            slot.deferred.push_back(request);
            return Ok(Dispatch::Deferred);
        }

        let result = slot.controller.handle_request(now_ns, request);
        self.services.stats.inc_messages_processed();
        self.after_dispatch(now_ns, stream);
        result.map(Dispatch::Replied)
    }

    /// Runs every posted task that is due at `now_ns`, then replays deferred requests of
    /// streams that became runnable. Returns how many tasks ran.
    pub fn run_tasks(&mut self, now_ns: u64) -> usize {
        let mut ran = 0;
        for _ in 0..MAX_TASK_PASSES {
            let ready = self.tasks.take_ready(now_ns);
            if ready.is_empty() {
                break;
            }
            for task in ready {
                ran += 1;
                self.run_task(now_ns, task);
            }
        }
        ran
    }

    fn run_task(&mut self, now_ns: u64, task: ChannelTask) {
        let stream = task.stream();
        if let ChannelTask::Teardown { .. } = task {
            tracing::debug!(%stream, "error-triggered teardown");
            self.remove_stream(stream);
            return;
        }
        let Some(slot) = self.streams.get_mut(&stream) else {
            tracing::trace!(%stream, ?task, "task for a stream that is gone");
            return;
        };
        match task {
            ChannelTask::SyncPointRetired { sync_point, .. } => {
                tracing::trace!(%stream, "{sync_point} retired");
                slot.controller.on_sync_point_retired(now_ns);
            }
            ChannelTask::SignalAck { signal_id, .. } => {
                self.services.outbox.post(ClientMessage {
                    stream,
                    event: ClientEvent::SignalAck { signal_id },
                });
            }
            ChannelTask::MemoryAllocationChanged { allocation, .. } => {
                slot.controller.on_memory_allocation(allocation);
            }
            ChannelTask::PollWork { generation, .. } => {
                slot.controller.poll_work(now_ns, generation);
            }
            ChannelTask::Teardown { .. } => {}
        }
        self.after_dispatch(now_ns, stream);
    }

    /// Share-group loss propagation, then deferred-request replay.
    fn after_dispatch(&mut self, now_ns: u64, stream: StreamId) {
        self.propagate_loss(stream);
        self.replay_deferred(now_ns, stream);
    }

    fn propagate_loss(&mut self, stream: StreamId) {
        let Some(slot) = self.streams.get_mut(&stream) else {
            return;
        };
        let Some(reason) = slot.controller.take_loss_to_propagate() else {
            return;
        };
        let group = slot.share_group;
        let siblings: Vec<StreamId> = self
            .share_groups
            .get(&group)
            .map(|record| {
                record
                    .members
                    .iter()
                    .copied()
                    .filter(|&member| member != stream)
                    .collect()
            })
            .unwrap_or_default();
        for sibling in siblings {
            if let Some(slot) = self.streams.get_mut(&sibling) {
                tracing::warn!(%stream, %sibling, %reason, "losing share group sibling");
                // The sibling did nothing wrong that we know of.
                slot.controller.mark_context_lost(LossReason::Unknown);
                // Siblings must not propagate back.
                slot.controller.take_loss_to_propagate();
            }
        }
    }

    fn replay_deferred(&mut self, now_ns: u64, stream: StreamId) {
        loop {
            let Some(slot) = self.streams.get_mut(&stream) else {
                return;
            };
            let Some(front) = slot.deferred.front() else {
                return;
            };
            if !slot.controller.is_scheduled()
                || (front.waits_for_decode() && slot.controller.has_more_work())
            {
                return;
            }
            let Some(request) = slot.deferred.pop_front() else {
                return;
            };
            let name = request.name();
            let expects_reply = request.expects_reply();
            let event = match slot.controller.handle_request(now_ns, request) {
                Ok(reply) if expects_reply => Some(ClientEvent::Reply {
                    request: name.to_string(),
                    reply,
                }),
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(%stream, request = name, "deferred request rejected: {err}");
                    Some(ClientEvent::Rejected {
                        request: name.to_string(),
                        error: err.to_string(),
                    })
                }
            };
            if let Some(event) = event {
                self.services.outbox.post(ClientMessage { stream, event });
            }
            self.services.stats.inc_messages_processed();
            self.propagate_loss(stream);
        }
    }

    /// Earliest deadline among posted tasks, if any.
    pub fn next_task_deadline(&mut self) -> Option<u64> {
        self.tasks.next_deadline()
    }

    pub fn drain_client_messages(&self) -> Vec<ClientMessage> {
        self.services.outbox.take_all()
    }
}

fn must_defer(slot: &StreamSlot, request: &Request) -> bool {
    !slot.deferred.is_empty()
        || !slot.controller.is_scheduled()
        || (request.waits_for_decode() && slot.controller.has_more_work())
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        let streams: Vec<StreamId> = self.streams.keys().copied().collect();
        for stream in streams {
            self.remove_stream(stream);
        }
    }
}
