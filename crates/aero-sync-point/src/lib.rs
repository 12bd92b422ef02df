//! Process-wide sync point registry.
//!
//! A sync point is a token meaning "every command the producing stream issued before this
//! token was requested has finished decoding". Tokens come from a single counter shared by
//! every stream in the process, so a stream can wait on work produced by any other stream.
//!
//! The manager only serializes access to its own registry. Retirement callbacks are always
//! invoked with the registry unlocked, which lets a callback generate, retire or register
//! further sync points. Callbacks run on whichever thread retired the token; consumers that
//! live on a different loop are expected to post a continuation rather than re-enter their
//! loop from inside the callback.
#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Opaque, monotonically increasing token. `0` is never issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncPoint(pub u32);

impl SyncPoint {
    pub const INVALID: SyncPoint = SyncPoint(0);

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync_point#{}", self.0)
    }
}

/// Identifies the stream that generated (and must eventually retire) a sync point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPointState {
    Pending,
    Retired,
    /// Never issued (or `SyncPoint::INVALID`).
    Unknown,
}

pub type SyncPointCallback = Box<dyn FnOnce() + Send + 'static>;

struct PendingSyncPoint {
    producer: ProducerId,
    callbacks: Vec<SyncPointCallback>,
}

#[derive(Default)]
struct Registry {
    last_issued: u32,
    /// Set once the counter wrapped; from then on every non-pending token counts as retired.
    wrapped: bool,
    pending: HashMap<u32, PendingSyncPoint>,
    /// Outstanding tokens per producer, oldest first.
    by_producer: HashMap<ProducerId, VecDeque<SyncPoint>>,
    generated: u64,
    retired: u64,
}

impl Registry {
    fn state(&self, sync_point: SyncPoint) -> SyncPointState {
        if !sync_point.is_valid() {
            return SyncPointState::Unknown;
        }
        if self.pending.contains_key(&sync_point.0) {
            return SyncPointState::Pending;
        }
        if self.wrapped || sync_point.0 <= self.last_issued {
            SyncPointState::Retired
        } else {
            SyncPointState::Unknown
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncPointStats {
    pub generated: u64,
    pub retired: u64,
    pub pending: u64,
}

/// Registry of pending sync points and their retirement callbacks.
#[derive(Default)]
pub struct SyncPointManager {
    registry: Mutex<Registry>,
}

impl fmt::Debug for SyncPointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPointManager")
            .field("stats", &self.stats())
            .finish()
    }
}

impl SyncPointManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Issues the next token from the process-wide counter on behalf of `producer`.
    pub fn generate_sync_point(&self, producer: ProducerId) -> SyncPoint {
        let mut registry = self.lock();
        let mut next = registry.last_issued.wrapping_add(1);
        loop {
            if next == 0 {
                tracing::warn!("sync point counter wrapped");
                registry.wrapped = true;
                next = 1;
            }
            // Only reachable after a wrap: never hand out a token that is still pending.
            if !registry.pending.contains_key(&next) {
                break;
            }
            next = next.wrapping_add(1);
        }

        registry.last_issued = next;
        registry.generated += 1;
        registry.pending.insert(
            next,
            PendingSyncPoint {
                producer,
                callbacks: Vec::new(),
            },
        );
        let sync_point = SyncPoint(next);
        registry
            .by_producer
            .entry(producer)
            .or_default()
            .push_back(sync_point);
        tracing::trace!(producer = producer.0, "generated {sync_point}");
        sync_point
    }

    /// Retires `sync_point` and runs every callback registered for it.
    ///
    /// Ordering is first-in-first-out per producer rather than across the whole process: each
    /// stream decodes its own ring in order, but streams retire independently of one another.
    ///
    /// # Panics
    ///
    /// Panics if `sync_point` is not pending or is not the oldest token outstanding for its
    /// producer. Both indicate a broken caller, not bad client input.
    pub fn retire_sync_point(&self, sync_point: SyncPoint) {
        let callbacks = {
            let mut registry = self.lock();
            let Some(entry) = registry.pending.get(&sync_point.0) else {
                panic!("retiring {sync_point} which is not pending");
            };
            let producer = entry.producer;
            let queue = registry
                .by_producer
                .get_mut(&producer)
                .expect("pending sync point has a producer queue");
            let oldest = queue.front().copied();
            assert_eq!(
                oldest,
                Some(sync_point),
                "producer {} retired {sync_point} out of order",
                producer.0
            );
            queue.pop_front();
            if queue.is_empty() {
                registry.by_producer.remove(&producer);
            }
            registry.retired += 1;
            registry
                .pending
                .remove(&sync_point.0)
                .map(|entry| entry.callbacks)
                .unwrap_or_default()
        };

        tracing::trace!(callbacks = callbacks.len(), "retired {sync_point}");
        for callback in callbacks {
            callback();
        }
    }

    /// Runs `callback` once `sync_point` retires, or immediately if it is not pending.
    pub fn add_sync_point_callback(&self, sync_point: SyncPoint, callback: SyncPointCallback) {
        {
            let mut registry = self.lock();
            if let Some(entry) = registry.pending.get_mut(&sync_point.0) {
                entry.callbacks.push(callback);
                return;
            }
        }
        callback();
    }

    pub fn state(&self, sync_point: SyncPoint) -> SyncPointState {
        self.lock().state(sync_point)
    }

    pub fn is_sync_point_retired(&self, sync_point: SyncPoint) -> bool {
        self.state(sync_point) == SyncPointState::Retired
    }

    /// Oldest token `producer` has generated but not yet retired.
    pub fn oldest_outstanding(&self, producer: ProducerId) -> Option<SyncPoint> {
        self.lock()
            .by_producer
            .get(&producer)
            .and_then(|queue| queue.front().copied())
    }

    pub fn outstanding(&self, producer: ProducerId) -> Vec<SyncPoint> {
        self.lock()
            .by_producer
            .get(&producer)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Retires every token `producer` still owns, oldest first. Returns how many were retired.
    ///
    /// Used when a producer goes away so that nobody waits forever on its tokens.
    pub fn retire_all_for_producer(&self, producer: ProducerId) -> usize {
        let mut retired = 0;
        while let Some(sync_point) = self.oldest_outstanding(producer) {
            self.retire_sync_point(sync_point);
            retired += 1;
        }
        retired
    }

    pub fn stats(&self) -> SyncPointStats {
        let registry = self.lock();
        SyncPointStats {
            generated: registry.generated,
            retired: registry.retired,
            pending: registry.pending.len() as u64,
        }
    }
}
