//! Rendering-context abstraction.
//!
//! A stream never talks to a [`GraphicsContext`] directly; it goes through a
//! [`LogicalContext`], which is either a [`DirectContext`] owning a driver context, or a
//! [`VirtualContext`] that multiplexes several streams of one share group over a single
//! [`PhysicalContext`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, LossReason};
use crate::ids::{ShareGroupId, StreamId};
use crate::stats::ProcessStats;

/// What kind of surface a stream renders to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SurfaceRequest {
    Offscreen { width: u32, height: u32 },
    Window { handle: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SurfaceHandle {
    pub id: u64,
    pub offscreen: bool,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextAttributes {
    pub alpha: bool,
    pub depth: bool,
    pub stencil: bool,
    /// Ask the driver for reset notifications.
    pub robustness: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub max_texture_size: u32,
    pub extensions: Vec<String>,
    pub robustness: bool,
    pub virtualized: bool,
}

pub trait SurfaceProvider: Send + Sync {
    fn create_surface(&self, request: &SurfaceRequest) -> Result<SurfaceHandle, ContextError>;
}

/// Driver context. Fences are monotonically increasing values; a fence is complete once
/// `completed_fence()` reaches it.
pub trait GraphicsContext: Send {
    fn initialize(
        &mut self,
        surface: &SurfaceHandle,
        attributes: &ContextAttributes,
    ) -> Result<(), ContextError>;
    fn make_current(&mut self, surface: &SurfaceHandle) -> bool;
    fn is_current(&self, surface: &SurfaceHandle) -> bool;
    fn capabilities(&self) -> Capabilities;
    /// `Some` once the driver reported a reset.
    fn reset_status(&self) -> Option<LossReason>;
    fn insert_fence(&mut self) -> u64;
    fn completed_fence(&self) -> u64;
}

pub trait ContextProvider: Send + Sync {
    fn create_context(&self) -> Result<Box<dyn GraphicsContext>, ContextError>;

    /// Context switches are expensive enough that sharing one context is preferable.
    fn prefers_virtualized_contexts(&self) -> bool {
        false
    }

    /// Losing one context invalidates every context of its share group.
    fn loses_all_contexts_on_loss(&self) -> bool {
        false
    }
}

/// The context as seen by one stream.
pub trait LogicalContext: Send {
    fn initialize(&mut self, attributes: &ContextAttributes) -> Result<Capabilities, ContextError>;
    /// Makes this stream's context current. `false` means the context is unusable.
    fn activate(&mut self) -> bool;
    fn is_current(&self) -> bool;
    fn is_virtual(&self) -> bool;
    fn reset_status(&self) -> Option<LossReason>;
    fn insert_fence(&mut self) -> u64;
    fn completed_fence(&self) -> u64;
}

pub struct DirectContext {
    context: Box<dyn GraphicsContext>,
    surface: SurfaceHandle,
}

impl DirectContext {
    pub fn new(context: Box<dyn GraphicsContext>, surface: SurfaceHandle) -> Self {
        Self { context, surface }
    }
}

impl fmt::Debug for DirectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectContext")
            .field("surface", &self.surface)
            .finish()
    }
}

impl LogicalContext for DirectContext {
    fn initialize(&mut self, attributes: &ContextAttributes) -> Result<Capabilities, ContextError> {
        self.context.initialize(&self.surface, attributes)?;
        Ok(self.context.capabilities())
    }

    fn activate(&mut self) -> bool {
        self.context.is_current(&self.surface) || self.context.make_current(&self.surface)
    }

    fn is_current(&self) -> bool {
        self.context.is_current(&self.surface)
    }

    fn is_virtual(&self) -> bool {
        false
    }

    fn reset_status(&self) -> Option<LossReason> {
        self.context.reset_status()
    }

    fn insert_fence(&mut self) -> u64 {
        self.context.insert_fence()
    }

    fn completed_fence(&self) -> u64 {
        self.context.completed_fence()
    }
}

/// Driver context shared by the virtual contexts of one share group.
pub struct PhysicalContext {
    context: Box<dyn GraphicsContext>,
    current: Option<StreamId>,
    initialized: bool,
    switches: u64,
}

pub type SharedPhysicalContext = Arc<Mutex<PhysicalContext>>;

impl PhysicalContext {
    pub fn new_shared(context: Box<dyn GraphicsContext>) -> SharedPhysicalContext {
        Arc::new(Mutex::new(Self {
            context,
            current: None,
            initialized: false,
            switches: 0,
        }))
    }

    pub fn current(&self) -> Option<StreamId> {
        self.current
    }

    /// How many times the physical context changed owner.
    pub fn switches(&self) -> u64 {
        self.switches
    }
}

fn lock_physical(physical: &SharedPhysicalContext) -> MutexGuard<'_, PhysicalContext> {
    match physical.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct VirtualContext {
    physical: SharedPhysicalContext,
    stream: StreamId,
    surface: SurfaceHandle,
    stats: Arc<ProcessStats>,
}

impl VirtualContext {
    pub fn new(
        physical: SharedPhysicalContext,
        stream: StreamId,
        surface: SurfaceHandle,
        stats: Arc<ProcessStats>,
    ) -> Self {
        Self {
            physical,
            stream,
            surface,
            stats,
        }
    }
}

impl fmt::Debug for VirtualContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualContext")
            .field("stream", &self.stream)
            .field("surface", &self.surface)
            .finish()
    }
}

impl LogicalContext for VirtualContext {
    fn initialize(&mut self, attributes: &ContextAttributes) -> Result<Capabilities, ContextError> {
        let mut physical = lock_physical(&self.physical);
        if !physical.initialized {
            physical.context.initialize(&self.surface, attributes)?;
            physical.initialized = true;
        }
        let mut capabilities = physical.context.capabilities();
        capabilities.virtualized = true;
        Ok(capabilities)
    }

    fn activate(&mut self) -> bool {
        let mut physical = lock_physical(&self.physical);
        if physical.current == Some(self.stream) && physical.context.is_current(&self.surface) {
            return true;
        }
        if !physical.context.make_current(&self.surface) {
            return false;
        }
        if physical.current != Some(self.stream) {
            physical.switches += 1;
            self.stats.inc_virtual_context_switches();
            tracing::trace!(stream = %self.stream, "virtual context switch");
        }
        physical.current = Some(self.stream);
        true
    }

    fn is_current(&self) -> bool {
        let physical = lock_physical(&self.physical);
        physical.current == Some(self.stream) && physical.context.is_current(&self.surface)
    }

    fn is_virtual(&self) -> bool {
        true
    }

    fn reset_status(&self) -> Option<LossReason> {
        lock_physical(&self.physical).context.reset_status()
    }

    fn insert_fence(&mut self) -> u64 {
        lock_physical(&self.physical).context.insert_fence()
    }

    fn completed_fence(&self) -> u64 {
        lock_physical(&self.physical).context.completed_fence()
    }
}

impl Drop for VirtualContext {
    fn drop(&mut self) {
        let mut physical = lock_physical(&self.physical);
        if physical.current == Some(self.stream) {
            physical.current = None;
        }
    }
}

/// Streams that share resources and, when virtualized, one physical context.
pub struct ShareGroup {
    id: ShareGroupId,
    physical: Mutex<Option<SharedPhysicalContext>>,
}

impl fmt::Debug for ShareGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareGroup").field("id", &self.id).finish()
    }
}

impl ShareGroup {
    pub fn new(id: ShareGroupId) -> Arc<Self> {
        Arc::new(Self {
            id,
            physical: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ShareGroupId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Option<SharedPhysicalContext>> {
        match self.physical.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn physical(&self) -> Option<SharedPhysicalContext> {
        self.lock().clone()
    }

    /// Returns the group's physical context, creating it on first use. The flag reports
    /// whether this call created it.
    pub fn physical_or_create(
        &self,
        provider: &dyn ContextProvider,
    ) -> Result<(SharedPhysicalContext, bool), ContextError> {
        let mut slot = self.lock();
        if let Some(physical) = slot.as_ref() {
            return Ok((Arc::clone(physical), false));
        }
        let physical = PhysicalContext::new_shared(provider.create_context()?);
        *slot = Some(Arc::clone(&physical));
        Ok((physical, true))
    }

    /// Forgets the physical context, e.g. after the stream that created it failed to
    /// initialize.
    pub fn clear_physical(&self) {
        *self.lock() = None;
    }
}
