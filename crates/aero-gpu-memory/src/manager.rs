use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::allocation::{
    compute_allocations, ClientInputs, ManagedMemoryStats, MemoryAllocation, MemoryManagerConfig,
    MemoryPool,
};

/// Receives allocation pushes for one client.
///
/// Pushes are delivered with the manager unlocked, possibly from another thread than the one
/// that owns the client; implementations normally forward the value to the owner's loop.
pub trait AllocationSink: Send + Sync {
    fn set_memory_allocation(&self, allocation: MemoryAllocation);
}

struct ClientRecord {
    sink: Arc<dyn AllocationSink>,
    visible: bool,
    has_callback: bool,
    stats: ManagedMemoryStats,
    last_pushed: Option<MemoryAllocation>,
}

#[derive(Default)]
struct GroupRecord {
    client_id: u64,
    managed: u64,
    unmanaged: u64,
}

#[derive(Default)]
struct Inner {
    next_key: u64,
    clients: BTreeMap<u64, ClientRecord>,
    groups: HashMap<u64, GroupRecord>,
    bytes_managed: u64,
    bytes_unmanaged: u64,
    bytes_high_water: u64,
    denied_allocations: u64,
}

impl Inner {
    fn next_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    fn total_allocated(&self) -> u64 {
        self.bytes_managed.saturating_add(self.bytes_unmanaged)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsageSnapshot {
    pub bytes_managed: u64,
    pub bytes_unmanaged: u64,
    pub bytes_high_water: u64,
    pub clients: u64,
    pub tracking_groups: u64,
    pub denied_allocations: u64,
}

/// Shared budget arbiter; always used behind an `Arc`.
pub struct MemoryBudgetManager {
    config: MemoryManagerConfig,
    inner: Mutex<Inner>,
}

impl fmt::Debug for MemoryBudgetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudgetManager")
            .field("config", &self.config)
            .field("usage", &self.usage())
            .finish()
    }
}

impl MemoryBudgetManager {
    pub fn new(config: MemoryManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create_tracking_group(self: &Arc<Self>, client_id: u64) -> TrackingGroup {
        let key = {
            let mut inner = self.lock();
            let key = inner.next_key();
            inner.groups.insert(
                key,
                GroupRecord {
                    client_id,
                    ..GroupRecord::default()
                },
            );
            key
        };
        TrackingGroup {
            manager: Arc::clone(self),
            key,
            client_id,
        }
    }

    pub fn create_client_state(
        self: &Arc<Self>,
        sink: Arc<dyn AllocationSink>,
        visible: bool,
        has_callback: bool,
    ) -> ClientState {
        let key = {
            let mut inner = self.lock();
            let key = inner.next_key();
            inner.clients.insert(
                key,
                ClientRecord {
                    sink,
                    visible,
                    has_callback,
                    stats: ManagedMemoryStats::default(),
                    last_pushed: None,
                },
            );
            key
        };
        self.manage();
        ClientState {
            manager: Arc::clone(self),
            key,
        }
    }

    pub fn usage(&self) -> MemoryUsageSnapshot {
        let inner = self.lock();
        MemoryUsageSnapshot {
            bytes_managed: inner.bytes_managed,
            bytes_unmanaged: inner.bytes_unmanaged,
            bytes_high_water: inner.bytes_high_water,
            clients: inner.clients.len() as u64,
            tracking_groups: inner.groups.len() as u64,
            denied_allocations: inner.denied_allocations,
        }
    }

    /// Bytes currently tracked for `client_id` across all of its groups.
    pub fn client_usage(&self, client_id: u64) -> u64 {
        self.lock()
            .groups
            .values()
            .filter(|group| group.client_id == client_id)
            .map(|group| group.managed + group.unmanaged)
            .sum()
    }

    /// Recomputes every allocation and pushes the ones that changed.
    pub fn manage(&self) {
        let pushes = {
            let mut inner = self.lock();
            let keys: Vec<u64> = inner.clients.keys().copied().collect();
            let inputs: Vec<ClientInputs> = inner
                .clients
                .values()
                .map(|client| ClientInputs {
                    visible: client.visible,
                    stats: client.stats,
                })
                .collect();
            let allocations = compute_allocations(&self.config, inner.bytes_unmanaged, &inputs);

            let mut pushes = Vec::new();
            for (key, allocation) in keys.into_iter().zip(allocations) {
                let Some(client) = inner.clients.get_mut(&key) else {
                    continue;
                };
                if !client.has_callback || client.last_pushed == Some(allocation) {
                    continue;
                }
                client.last_pushed = Some(allocation);
                pushes.push((Arc::clone(&client.sink), allocation));
            }
            pushes
        };

        for (sink, allocation) in pushes {
            tracing::trace!(
                bytes_limit = allocation.bytes_limit,
                visible = allocation.visible,
                "pushing memory allocation"
            );
            sink.set_memory_allocation(allocation);
        }
    }

    fn update_client(&self, key: u64, update: impl FnOnce(&mut ClientRecord) -> bool) {
        let changed = {
            let mut inner = self.lock();
            match inner.clients.get_mut(&key) {
                Some(client) => update(client),
                None => false,
            }
        };
        if changed {
            self.manage();
        }
    }

    fn track_change(&self, key: u64, old_size: u64, new_size: u64, pool: MemoryPool) {
        let unmanaged_changed = {
            let mut inner = self.lock();
            let before = inner.bytes_unmanaged;
            Self::apply_change(&mut inner, key, old_size, new_size, pool);
            inner.bytes_unmanaged != before
        };
        // Unmanaged bytes come straight off every client's budget.
        if unmanaged_changed {
            self.manage();
        }
    }

    fn apply_change(
        inner: &mut Inner,
        key: u64,
        old_size: u64,
        new_size: u64,
        pool: MemoryPool,
    ) {
        let Some(group) = inner.groups.get_mut(&key) else {
            return;
        };
        let slot = match pool {
            MemoryPool::Managed => &mut group.managed,
            MemoryPool::Unmanaged => &mut group.unmanaged,
        };
        *slot = slot.saturating_sub(old_size).saturating_add(new_size);

        let total = match pool {
            MemoryPool::Managed => &mut inner.bytes_managed,
            MemoryPool::Unmanaged => &mut inner.bytes_unmanaged,
        };
        *total = total.saturating_sub(old_size).saturating_add(new_size);
        inner.bytes_high_water = inner.bytes_high_water.max(inner.total_allocated());
    }

    fn ensure_available(&self, size: u64) -> bool {
        let mut inner = self.lock();
        let fits = inner
            .total_allocated()
            .checked_add(size)
            .is_some_and(|total| total <= self.config.total_bytes_available);
        if !fits {
            inner.denied_allocations += 1;
            tracing::debug!(
                size,
                allocated = inner.total_allocated(),
                "gpu memory budget exhausted"
            );
        }
        fits
    }

    fn remove_group(&self, key: u64) {
        let released_unmanaged = {
            let mut inner = self.lock();
            let Some(group) = inner.groups.remove(&key) else {
                return;
            };
            inner.bytes_managed = inner.bytes_managed.saturating_sub(group.managed);
            inner.bytes_unmanaged = inner.bytes_unmanaged.saturating_sub(group.unmanaged);
            group.unmanaged != 0
        };
        if released_unmanaged {
            self.manage();
        }
    }

    fn remove_client(&self, key: u64) {
        let removed = self.lock().clients.remove(&key).is_some();
        if removed {
            self.manage();
        }
    }
}

/// Per-client allocation accounting. Dropping the group releases everything it tracked.
pub struct TrackingGroup {
    manager: Arc<MemoryBudgetManager>,
    key: u64,
    client_id: u64,
}

impl fmt::Debug for TrackingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingGroup")
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl TrackingGroup {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Records that an allocation in `pool` changed size from `old_size` to `new_size`.
    pub fn track_allocated_change(&self, old_size: u64, new_size: u64, pool: MemoryPool) {
        self.manager.track_change(self.key, old_size, new_size, pool);
    }

    /// Returns whether `size` more bytes fit in the process budget.
    pub fn ensure_available(&self, size: u64) -> bool {
        self.manager.ensure_available(size)
    }

    pub fn allocated_bytes(&self) -> u64 {
        let inner = self.manager.lock();
        inner
            .groups
            .get(&self.key)
            .map(|group| group.managed + group.unmanaged)
            .unwrap_or(0)
    }
}

impl Drop for TrackingGroup {
    fn drop(&mut self) {
        self.manager.remove_group(self.key);
    }
}

/// Visibility/stats inputs for one client. Dropping it removes the client from arbitration.
pub struct ClientState {
    manager: Arc<MemoryBudgetManager>,
    key: u64,
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientState").field("key", &self.key).finish()
    }
}

impl ClientState {
    pub fn set_visible(&self, visible: bool) {
        self.manager.update_client(self.key, |client| {
            let changed = client.visible != visible;
            client.visible = visible;
            changed
        });
    }

    pub fn set_managed_memory_stats(&self, stats: ManagedMemoryStats) {
        self.manager.update_client(self.key, |client| {
            let changed = client.stats != stats;
            client.stats = stats;
            changed
        });
    }

    /// Enables or disables allocation pushes for this client.
    pub fn set_has_callback(&self, has_callback: bool) {
        self.manager.update_client(self.key, |client| {
            let changed = client.has_callback != has_callback;
            client.has_callback = has_callback;
            if !has_callback {
                // Re-enabling must push the current value again.
                client.last_pushed = None;
            }
            changed
        });
    }
}

impl Drop for ClientState {
    fn drop(&mut self) {
        self.manager.remove_client(self.key);
    }
}
