//! Per-stream decode loop and idle-work polling.
//!
//! The scheduler never blocks. Waiting on another stream's sync point bumps an unschedule
//! count and registers a retirement callback that posts a continuation back to the channel
//! loop; decoding resumes when that continuation runs.

use std::sync::Arc;
use std::time::Duration;

use aero_sync_point::{SyncPoint, SyncPointManager, SyncPointState};

use crate::command_buffer::CommandBufferService;
use crate::config::StreamConfig;
use crate::decoder::{CommandAction, CommandDecoder};
use crate::error::ErrorState;
use crate::ids::StreamId;
use crate::shared_memory::TransferBufferRegistry;
use crate::stats::ProcessStats;
use crate::task::{ChannelTask, TaskSender};
use crate::watchdog::Watchdog;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulingState {
    Scheduled,
    /// Number of sync-point waits still outstanding.
    Unscheduled(u32),
}

/// Outcome of one decode run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeRun {
    pub commands: u64,
    /// Stopped on a sync-point wait.
    pub fenced: bool,
    /// Latched an error.
    pub faulted: bool,
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

pub struct Scheduler {
    stream: StreamId,
    config: StreamConfig,
    sync_points: Arc<SyncPointManager>,
    tasks: TaskSender,
    stats: Arc<ProcessStats>,
    watchdog: Arc<dyn Watchdog>,
    unschedule_count: u32,
    delayed_work_scheduled: bool,
    /// Bumped to invalidate an already-posted poll.
    poll_generation: u64,
    previous_messages_processed: u64,
    last_idle_time_ns: Option<u64>,
}

impl Scheduler {
    pub fn new(
        stream: StreamId,
        config: StreamConfig,
        sync_points: Arc<SyncPointManager>,
        tasks: TaskSender,
        stats: Arc<ProcessStats>,
        watchdog: Arc<dyn Watchdog>,
    ) -> Self {
        Self {
            stream,
            config,
            sync_points,
            tasks,
            stats,
            watchdog,
            unschedule_count: 0,
            delayed_work_scheduled: false,
            poll_generation: 0,
            previous_messages_processed: 0,
            last_idle_time_ns: None,
        }
    }

    pub fn state(&self) -> SchedulingState {
        match self.unschedule_count {
            0 => SchedulingState::Scheduled,
            n => SchedulingState::Unscheduled(n),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.unschedule_count == 0
    }

    pub fn unschedule_count(&self) -> u32 {
        self.unschedule_count
    }

    /// Arms a fence on `sync_point` unless it is already retired. Returns whether the stream is
    /// still scheduled afterwards.
    pub fn wait_sync_point(&mut self, sync_point: SyncPoint) -> bool {
        if self.sync_points.state(sync_point) != SyncPointState::Pending {
            return true;
        }
        self.unschedule_count += 1;
        tracing::debug!(
            stream = %self.stream,
            fences = self.unschedule_count,
            "waiting on {sync_point}"
        );
        let tasks = self.tasks.clone();
        let stream = self.stream;
        self.sync_points.add_sync_point_callback(
            sync_point,
            Box::new(move || tasks.post(ChannelTask::SyncPointRetired { stream, sync_point })),
        );
        false
    }

    /// One armed fence was released. Returns whether the stream is scheduled again.
    pub fn on_sync_point_retired(&mut self) -> bool {
        self.unschedule_count = self.unschedule_count.saturating_sub(1);
        self.is_scheduled()
    }

    pub fn has_more_work(&self, command_buffer: &CommandBufferService) -> bool {
        command_buffer.error() == ErrorState::None && command_buffer.has_unprocessed_commands()
    }

    /// Decodes from get toward put until caught up, fenced or faulted.
    pub fn put_changed(
        &mut self,
        command_buffer: &mut CommandBufferService,
        decoder: &mut CommandDecoder,
        transfer_buffers: &TransferBufferRegistry,
    ) -> DecodeRun {
        let mut run = DecodeRun::default();
        while self.is_scheduled() && self.has_more_work(command_buffer) {
            let command = match decoder.process_next(command_buffer, transfer_buffers) {
                Ok(command) => command,
                Err(fault) => {
                    tracing::warn!(stream = %self.stream, get = command_buffer.get_offset(), "{fault}");
                    command_buffer.set_error(fault.into());
                    run.faulted = true;
                    break;
                }
            };
            command_buffer.set_get_offset(command.next_get);
            run.commands += 1;
            self.stats.inc_commands_processed();
            self.watchdog.check_armed();

            match command.action {
                CommandAction::None => {}
                CommandAction::SetToken(token) => command_buffer.set_token(token),
                CommandAction::WaitSyncPoint(sync_point) => {
                    if !self.wait_sync_point(sync_point) {
                        run.fenced = true;
                    }
                }
            }
        }
        run
    }

    pub fn is_poll_scheduled(&self) -> bool {
        self.delayed_work_scheduled
    }

    /// Posts one self-poll after `delay`, or cancels polling when nothing is pending.
    ///
    /// While the stream is scheduled and idle work is available the shorter idle-work delay
    /// replaces `delay`. A poll that is already posted suppresses another one.
    pub fn schedule_delayed_work(
        &mut self,
        now_ns: u64,
        delay: Duration,
        has_pending_work: bool,
        has_idle_work: bool,
    ) {
        if !has_pending_work {
            self.last_idle_time_ns = None;
            if self.delayed_work_scheduled {
                self.poll_generation += 1;
                self.delayed_work_scheduled = false;
            }
            return;
        }
        if self.delayed_work_scheduled {
            return;
        }

        self.delayed_work_scheduled = true;
        self.previous_messages_processed = self.stats.messages_processed();
        if self.last_idle_time_ns.is_none() {
            self.last_idle_time_ns = Some(now_ns);
        }
        let delay = if self.is_scheduled() && has_idle_work {
            self.config.poll_delay_idle_work()
        } else {
            delay
        };
        self.tasks.post_at(
            now_ns.saturating_add(duration_ns(delay)),
            ChannelTask::PollWork {
                stream: self.stream,
                generation: self.poll_generation,
            },
        );
    }

    /// Claims a posted poll. `false` for a poll that was cancelled or superseded.
    pub fn begin_poll(&mut self, generation: u64) -> bool {
        if generation != self.poll_generation || !self.delayed_work_scheduled {
            return false;
        }
        self.delayed_work_scheduled = false;
        true
    }

    /// Whether this poll counts as idle: no message was processed since the poll was posted,
    /// or the last idle pass is older than the staleness deadline.
    pub fn should_run_idle_work(&mut self, now_ns: u64) -> bool {
        if !self.is_scheduled() {
            return false;
        }
        let mut is_idle = self.stats.messages_processed() == self.previous_messages_processed;
        if !is_idle {
            if let Some(last) = self.last_idle_time_ns {
                is_idle = now_ns.saturating_sub(last) > duration_ns(self.config.max_time_since_idle());
            }
        }
        if is_idle {
            self.last_idle_time_ns = Some(now_ns);
        }
        is_idle
    }
}
