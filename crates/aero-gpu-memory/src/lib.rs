//! Process-wide GPU memory budget arbitration.
//!
//! Every command stream registers two handles with the [`MemoryBudgetManager`]:
//! - a [`TrackingGroup`] through which its decoder reports allocations and asks whether a new
//!   allocation fits ([`TrackingGroup::ensure_available`]), and
//! - a [`ClientState`] describing its visibility and the managed-memory stats its producer
//!   reports.
//!
//! Whenever an input changes the manager recomputes every client's [`MemoryAllocation`] and
//! pushes it through the client's [`AllocationSink`], but only when the value differs from the
//! last one pushed to that client.
#![forbid(unsafe_code)]

mod allocation;
mod manager;

pub use allocation::{
    compute_allocations, ClientInputs, ManagedMemoryStats, MemoryAllocation, MemoryManagerConfig,
    MemoryPool, PriorityCutoff,
};
pub use manager::{
    AllocationSink, ClientState, MemoryBudgetManager, MemoryUsageSnapshot, TrackingGroup,
};
