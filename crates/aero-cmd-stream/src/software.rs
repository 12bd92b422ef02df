//! Headless backend: surfaces, contexts and a command handler that need no GPU.
//!
//! Failures are injected through the shared [`SoftwareControls`].

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use aero_gpu_memory::{MemoryAllocation, MemoryPool};

use crate::context::{
    Capabilities, ContextAttributes, ContextProvider, GraphicsContext, SurfaceHandle,
    SurfaceProvider, SurfaceRequest,
};
use crate::controller::GpuBackend;
use crate::decoder::{CommandHandler, ExecContext, HandlerFactory};
use crate::error::{ContextError, DecodeError, LossReason, ParseError};
use crate::ids::StreamId;

pub mod opcode {
    /// `{id, size}`: allocate `size` bytes against the budget.
    pub const ALLOC: u16 = 256;
    /// `{id}`: release an allocation. The bytes are reclaimed during idle work.
    pub const FREE: u16 = 257;
    /// `{shm_id, offset, size}`: read a transfer-buffer range.
    pub const UPLOAD: u16 = 258;
    /// `{key}`: emit a shader-cache entry.
    pub const CACHE_SHADER: u16 = 259;
    /// `{reason}`: simulate a driver reset.
    pub const LOSE_CONTEXT: u16 = 260;
}

#[derive(Debug, Default)]
pub struct SoftwareControls {
    fail_surface: AtomicBool,
    fail_context_creation: AtomicBool,
    fail_initialize: AtomicBool,
    fail_make_current: AtomicBool,
    hold_fences: AtomicBool,
    prefers_virtualization: AtomicBool,
    loses_all_contexts: AtomicBool,
    reset: Mutex<Option<LossReason>>,
    contexts_created: AtomicU64,
    surfaces_created: AtomicU64,
}

impl SoftwareControls {
    fn reset_slot(&self) -> MutexGuard<'_, Option<LossReason>> {
        match self.reset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_fail_surface(&self, fail: bool) {
        self.fail_surface.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_context_creation(&self, fail: bool) {
        self.fail_context_creation.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_make_current(&self, fail: bool) {
        self.fail_make_current.store(fail, Ordering::Relaxed);
    }

    /// While set, fences inserted from now on do not complete.
    pub fn set_hold_fences(&self, hold: bool) {
        self.hold_fences.store(hold, Ordering::Relaxed);
    }

    pub fn set_prefers_virtualization(&self, prefers: bool) {
        self.prefers_virtualization.store(prefers, Ordering::Relaxed);
    }

    pub fn set_loses_all_contexts(&self, loses_all: bool) {
        self.loses_all_contexts.store(loses_all, Ordering::Relaxed);
    }

    /// Every context reports this reset from now on.
    pub fn set_reset_status(&self, reason: Option<LossReason>) {
        *self.reset_slot() = reason;
    }

    pub fn reset_status(&self) -> Option<LossReason> {
        *self.reset_slot()
    }

    pub fn contexts_created(&self) -> u64 {
        self.contexts_created.load(Ordering::Relaxed)
    }

    pub fn surfaces_created(&self) -> u64 {
        self.surfaces_created.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct SoftwareBackend {
    controls: Arc<SoftwareControls>,
    next_surface: AtomicU64,
}

impl SoftwareBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn controls(&self) -> &Arc<SoftwareControls> {
        &self.controls
    }

    pub fn gpu_backend(self: &Arc<Self>) -> GpuBackend {
        GpuBackend {
            surfaces: self.clone(),
            contexts: self.clone(),
            handlers: self.clone(),
        }
    }
}

impl SurfaceProvider for SoftwareBackend {
    fn create_surface(&self, request: &SurfaceRequest) -> Result<SurfaceHandle, ContextError> {
        if self.controls.fail_surface.load(Ordering::Relaxed) {
            return Err(ContextError::SurfaceCreation("injected failure".into()));
        }
        let (offscreen, width, height) = match *request {
            SurfaceRequest::Offscreen { width, height } => {
                if width == 0 || height == 0 {
                    return Err(ContextError::SurfaceCreation(format!(
                        "empty offscreen surface {width}x{height}"
                    )));
                }
                (true, width, height)
            }
            SurfaceRequest::Window { handle: 0 } => {
                return Err(ContextError::SurfaceCreation("null window handle".into()))
            }
            SurfaceRequest::Window { .. } => (false, 640, 480),
        };
        self.controls.surfaces_created.fetch_add(1, Ordering::Relaxed);
        Ok(SurfaceHandle {
            id: self.next_surface.fetch_add(1, Ordering::Relaxed) + 1,
            offscreen,
            width,
            height,
        })
    }
}

impl ContextProvider for SoftwareBackend {
    fn create_context(&self) -> Result<Box<dyn GraphicsContext>, ContextError> {
        if self.controls.fail_context_creation.load(Ordering::Relaxed) {
            return Err(ContextError::ContextCreation("injected failure".into()));
        }
        self.controls.contexts_created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SoftwareContext {
            controls: Arc::clone(&self.controls),
            current_surface: None,
            initialized: false,
            next_fence: 0,
            completed: Cell::new(0),
        }))
    }

    fn prefers_virtualized_contexts(&self) -> bool {
        self.controls.prefers_virtualization.load(Ordering::Relaxed)
    }

    fn loses_all_contexts_on_loss(&self) -> bool {
        self.controls.loses_all_contexts.load(Ordering::Relaxed)
    }
}

impl HandlerFactory for SoftwareBackend {
    fn create_handler(&self, stream: StreamId) -> Box<dyn CommandHandler> {
        Box::new(SoftwareHandler::new(stream))
    }
}

struct SoftwareContext {
    controls: Arc<SoftwareControls>,
    current_surface: Option<u64>,
    initialized: bool,
    next_fence: u64,
    completed: Cell<u64>,
}

impl GraphicsContext for SoftwareContext {
    fn initialize(
        &mut self,
        _surface: &SurfaceHandle,
        _attributes: &ContextAttributes,
    ) -> Result<(), ContextError> {
        if self.controls.fail_initialize.load(Ordering::Relaxed) {
            return Err(ContextError::Initialize("injected failure".into()));
        }
        self.initialized = true;
        Ok(())
    }

    fn make_current(&mut self, surface: &SurfaceHandle) -> bool {
        if !self.initialized || self.controls.fail_make_current.load(Ordering::Relaxed) {
            self.current_surface = None;
            return false;
        }
        self.current_surface = Some(surface.id);
        true
    }

    fn is_current(&self, surface: &SurfaceHandle) -> bool {
        self.current_surface == Some(surface.id)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_texture_size: 4096,
            extensions: vec!["sync_query".into(), "robustness".into()],
            robustness: true,
            virtualized: false,
        }
    }

    fn reset_status(&self) -> Option<LossReason> {
        self.controls.reset_status()
    }

    fn insert_fence(&mut self) -> u64 {
        self.next_fence += 1;
        self.next_fence
    }

    fn completed_fence(&self) -> u64 {
        if !self.controls.hold_fences.load(Ordering::Relaxed) {
            self.completed.set(self.next_fence);
        }
        self.completed.get()
    }
}

/// Executes the software opcodes.
pub struct SoftwareHandler {
    stream: StreamId,
    allocations: HashMap<u32, u64>,
    /// Sizes of freed allocations not yet reclaimed.
    pending_frees: Vec<u64>,
    uploaded_bytes: u64,
    allocation: Option<MemoryAllocation>,
}

impl SoftwareHandler {
    pub fn new(stream: StreamId) -> Self {
        Self {
            stream,
            allocations: HashMap::new(),
            pending_frees: Vec::new(),
            uploaded_bytes: 0,
            allocation: None,
        }
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocations.values().sum()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    pub fn memory_allocation(&self) -> Option<MemoryAllocation> {
        self.allocation
    }
}

fn args_exact<const N: usize>(args: &[u32]) -> Result<[u32; N], ParseError> {
    args.try_into().map_err(|_| ParseError::InvalidArguments)
}

impl CommandHandler for SoftwareHandler {
    fn execute(
        &mut self,
        cx: &mut ExecContext<'_>,
        opcode: u16,
        args: &[u32],
    ) -> Result<(), DecodeError> {
        match opcode {
            opcode::ALLOC => {
                let [id, size] = args_exact::<2>(args)?;
                let size = u64::from(size);
                if self.allocations.contains_key(&id) {
                    return Err(ParseError::InvalidArguments.into());
                }
                if !cx.memory.ensure_available(size) {
                    return Err(DecodeError::OutOfMemory { requested: size });
                }
                cx.memory.track_allocated_change(0, size, MemoryPool::Managed);
                self.allocations.insert(id, size);
            }
            opcode::FREE => {
                let [id] = args_exact::<1>(args)?;
                let size = self
                    .allocations
                    .remove(&id)
                    .ok_or(ParseError::InvalidArguments)?;
                self.pending_frees.push(size);
            }
            opcode::UPLOAD => {
                let [shm_id, offset, size] = args_exact::<3>(args)?;
                let shm_id = i32::try_from(shm_id).map_err(|_| ParseError::InvalidArguments)?;
                let bytes = cx.transfer_buffers.read_range(shm_id, offset, size)?;
                self.uploaded_bytes += bytes.len() as u64;
            }
            opcode::CACHE_SHADER => {
                let [key] = args_exact::<1>(args)?;
                cx.cache_shader(format!("shader-{key:08x}"), key.to_le_bytes().to_vec());
            }
            opcode::LOSE_CONTEXT => {
                let [reason] = args_exact::<1>(args)?;
                return Err(DecodeError::ContextLost(LossReason::from_code(reason)));
            }
            _ => return Err(ParseError::UnknownCommand.into()),
        }
        Ok(())
    }

    fn has_more_idle_work(&self) -> bool {
        !self.pending_frees.is_empty()
    }

    fn perform_idle_work(&mut self, cx: &mut ExecContext<'_>) {
        let reclaimed: u64 = self.pending_frees.drain(..).sum();
        cx.memory
            .track_allocated_change(reclaimed, 0, MemoryPool::Managed);
        tracing::trace!(stream = %self.stream, reclaimed, "reclaimed freed allocations");
    }

    fn set_memory_allocation(&mut self, allocation: &MemoryAllocation) {
        self.allocation = Some(*allocation);
    }

    fn destroy(&mut self, cx: Option<&mut ExecContext<'_>>) {
        let outstanding: u64 =
            self.allocations.drain().map(|(_, size)| size).sum::<u64>()
                + self.pending_frees.drain(..).sum::<u64>();
        match cx {
            Some(cx) => cx
                .memory
                .track_allocated_change(outstanding, 0, MemoryPool::Managed),
            None => tracing::debug!(
                stream = %self.stream,
                outstanding,
                "abandoning allocations without a current context"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{LogicalContext, PhysicalContext, VirtualContext};
    use crate::stats::ProcessStats;

    fn surface(backend: &SoftwareBackend) -> SurfaceHandle {
        backend
            .create_surface(&SurfaceRequest::Offscreen {
                width: 4,
                height: 4,
            })
            .unwrap()
    }

    #[test]
    fn surface_requests_are_validated() {
        let backend = SoftwareBackend::new();
        assert!(backend
            .create_surface(&SurfaceRequest::Window { handle: 0 })
            .is_err());
        assert!(backend
            .create_surface(&SurfaceRequest::Offscreen {
                width: 0,
                height: 1
            })
            .is_err());
        let a = surface(&backend);
        let b = surface(&backend);
        assert_ne!(a.id, b.id);
        backend.controls().set_fail_surface(true);
        assert!(backend
            .create_surface(&SurfaceRequest::Window { handle: 7 })
            .is_err());
        assert_eq!(backend.controls().surfaces_created(), 2);
    }

    #[test]
    fn virtual_contexts_share_one_physical_context() {
        let backend = SoftwareBackend::new();
        let stats = Arc::new(ProcessStats::new());
        let physical = PhysicalContext::new_shared(backend.create_context().unwrap());
        let mut a = VirtualContext::new(
            Arc::clone(&physical),
            StreamId(1),
            surface(&backend),
            Arc::clone(&stats),
        );
        let mut b = VirtualContext::new(
            Arc::clone(&physical),
            StreamId(2),
            surface(&backend),
            Arc::clone(&stats),
        );

        let caps = a.initialize(&ContextAttributes::default()).unwrap();
        assert!(caps.virtualized);
        b.initialize(&ContextAttributes::default()).unwrap();
        assert_eq!(backend.controls().contexts_created(), 1);

        assert!(a.activate());
        assert!(a.activate());
        assert!(b.activate());
        assert!(!a.is_current());
        assert!(b.is_current());
        assert!(a.activate());
        assert_eq!(physical.lock().unwrap().switches(), 3);
        assert_eq!(stats.snapshot().virtual_context_switches, 3);

        drop(a);
        assert_eq!(physical.lock().unwrap().current(), None);
    }

    #[test]
    fn held_fences_do_not_complete() {
        let backend = SoftwareBackend::new();
        let mut ctx = backend.create_context().unwrap();
        let first = ctx.insert_fence();
        assert_eq!(ctx.completed_fence(), first);
        backend.controls().set_hold_fences(true);
        let second = ctx.insert_fence();
        assert_eq!(ctx.completed_fence(), first);
        backend.controls().set_hold_fences(false);
        assert_eq!(ctx.completed_fence(), second);
    }

    #[test]
    fn args_must_match_exactly() {
        assert_eq!(args_exact::<2>(&[1, 2]), Ok([1, 2]));
        assert_eq!(args_exact::<2>(&[1]), Err(ParseError::InvalidArguments));
        assert_eq!(args_exact::<1>(&[1, 2]), Err(ParseError::InvalidArguments));
    }
}
