//! Continuations posted back to the channel loop.
//!
//! Sync-point callbacks and memory pushes may fire on any thread. They never touch a stream
//! directly; they post a [`ChannelTask`] through a [`TaskSender`] and the loop that owns the
//! stream picks it up in [`TaskQueue::take_ready`].

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use aero_gpu_memory::MemoryAllocation;
use aero_sync_point::SyncPoint;

use crate::ids::StreamId;
use crate::mailbox::Mailbox;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelTask {
    SyncPointRetired {
        stream: StreamId,
        sync_point: SyncPoint,
    },
    SignalAck {
        stream: StreamId,
        signal_id: u32,
    },
    MemoryAllocationChanged {
        stream: StreamId,
        allocation: MemoryAllocation,
    },
    PollWork {
        stream: StreamId,
        generation: u64,
    },
    /// Error-triggered teardown, posted after `Destroyed` went out.
    Teardown {
        stream: StreamId,
    },
}

impl ChannelTask {
    pub fn stream(&self) -> StreamId {
        match self {
            ChannelTask::SyncPointRetired { stream, .. }
            | ChannelTask::SignalAck { stream, .. }
            | ChannelTask::MemoryAllocationChanged { stream, .. }
            | ChannelTask::PollWork { stream, .. }
            | ChannelTask::Teardown { stream } => *stream,
        }
    }
}

#[derive(Debug)]
struct Posted {
    not_before_ns: u64,
    task: ChannelTask,
}

/// Clonable, thread-safe handle for posting tasks.
#[derive(Clone, Debug, Default)]
pub struct TaskSender {
    inbox: Arc<Mailbox<Posted>>,
}

impl TaskSender {
    /// Runs on the next `take_ready`.
    pub fn post(&self, task: ChannelTask) {
        self.post_at(0, task);
    }

    /// Runs on the first `take_ready` whose clock reached `not_before_ns`.
    pub fn post_at(&self, not_before_ns: u64, task: ChannelTask) {
        self.inbox.post(Posted {
            not_before_ns,
            task,
        });
    }
}

struct Entry {
    not_before_ns: u64,
    seq: u64,
    task: ChannelTask,
}

impl Entry {
    fn key(&self) -> (u64, u64) {
        (self.not_before_ns, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Loop-owned side: orders posted tasks by deadline, then by post order.
#[derive(Default)]
pub struct TaskQueue {
    sender: TaskSender,
    pending: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    fn absorb_inbox(&mut self) {
        for posted in self.sender.inbox.take_all() {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.pending.push(Reverse(Entry {
                not_before_ns: posted.not_before_ns,
                seq,
                task: posted.task,
            }));
        }
    }

    /// Removes and returns every task due at `now_ns`, in order.
    pub fn take_ready(&mut self, now_ns: u64) -> Vec<ChannelTask> {
        self.absorb_inbox();
        let mut ready = Vec::new();
        while let Some(Reverse(entry)) = self.pending.peek() {
            if entry.not_before_ns > now_ns {
                break;
            }
            if let Some(Reverse(entry)) = self.pending.pop() {
                ready.push(entry.task);
            }
        }
        ready
    }

    pub fn next_deadline(&mut self) -> Option<u64> {
        self.absorb_inbox();
        self.pending.peek().map(|Reverse(entry)| entry.not_before_ns)
    }

    pub fn len(&mut self) -> usize {
        self.absorb_inbox();
        self.pending.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(stream: u32, generation: u64) -> ChannelTask {
        ChannelTask::PollWork {
            stream: StreamId(stream),
            generation,
        }
    }

    #[test]
    fn tasks_come_out_by_deadline_then_post_order() {
        let mut queue = TaskQueue::new();
        let sender = queue.sender();
        sender.post_at(20, poll(1, 0));
        sender.post(poll(2, 0));
        sender.post_at(10, poll(3, 0));
        sender.post(poll(4, 0));

        assert_eq!(queue.next_deadline(), Some(0));
        assert_eq!(queue.take_ready(5), vec![poll(2, 0), poll(4, 0)]);
        assert_eq!(queue.next_deadline(), Some(10));
        assert!(queue.take_ready(9).is_empty());
        assert_eq!(queue.take_ready(25), vec![poll(3, 0), poll(1, 0)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn posts_from_other_threads_are_picked_up() {
        let mut queue = TaskQueue::new();
        let sender = queue.sender();
        std::thread::spawn(move || {
            sender.post(ChannelTask::Teardown {
                stream: StreamId(9),
            })
        })
        .join()
        .unwrap();
        let ready = queue.take_ready(0);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].stream(), StreamId(9));
    }
}
