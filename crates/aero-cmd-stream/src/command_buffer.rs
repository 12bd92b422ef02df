use serde::{Deserialize, Serialize};

use crate::error::{CommandStreamError, ErrorState, LossReason, ParseError};
use crate::shared_memory::{write_shared_state, SharedMemory, SHARED_STATE_MIN_BYTES};

/// Snapshot reported to the producer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBufferState {
    pub get_offset: u32,
    pub put_offset: u32,
    pub token: u32,
    pub error: ErrorState,
    /// Bumped on every report so the producer can tell fresh state from stale.
    pub generation: u32,
}

struct RingBinding {
    id: i32,
    memory: SharedMemory,
}

/// Consumer side of the ring: cursors, token, latched error and the shared state block.
///
/// Offsets count entries, not bytes. Only the owning stream's loop mutates them.
pub struct CommandBufferService {
    shared_state: SharedMemory,
    ring: Option<RingBinding>,
    get_offset: u32,
    put_offset: u32,
    token: u32,
    error: ErrorState,
    generation: u32,
}

impl CommandBufferService {
    pub fn new(shared_state: SharedMemory) -> Result<Self, CommandStreamError> {
        if shared_state.len_bytes() < SHARED_STATE_MIN_BYTES {
            return Err(CommandStreamError::invalid(format!(
                "shared state block is {} bytes, need at least {SHARED_STATE_MIN_BYTES}",
                shared_state.len_bytes()
            )));
        }
        Ok(Self {
            shared_state,
            ring: None,
            get_offset: 0,
            put_offset: 0,
            token: 0,
            error: ErrorState::None,
            generation: 0,
        })
    }

    /// Binds `memory` as the ring. Rebinding the buffer already bound is a no-op; binding a
    /// different one resets both cursors. Returns whether anything changed.
    pub fn set_get_buffer(&mut self, id: i32, memory: SharedMemory) -> bool {
        if let Some(ring) = &self.ring {
            if ring.id == id && ring.memory.ptr_eq(&memory) {
                return false;
            }
        }
        self.ring = Some(RingBinding { id, memory });
        self.get_offset = 0;
        self.put_offset = 0;
        true
    }

    pub fn ring(&self) -> Option<&SharedMemory> {
        self.ring.as_ref().map(|ring| &ring.memory)
    }

    pub fn get_buffer_id(&self) -> Option<i32> {
        self.ring.as_ref().map(|ring| ring.id)
    }

    pub fn num_entries(&self) -> u32 {
        self.ring
            .as_ref()
            .map(|ring| ring.memory.len_words() as u32)
            .unwrap_or(0)
    }

    /// Moves the producer cursor. A put offset outside the ring is a parse error.
    pub fn flush(&mut self, put_offset: u32) -> Result<(), ParseError> {
        if self.ring.is_none() || put_offset >= self.num_entries() {
            return Err(ParseError::OutOfBounds);
        }
        self.put_offset = put_offset;
        Ok(())
    }

    pub fn get_offset(&self) -> u32 {
        self.get_offset
    }

    pub fn put_offset(&self) -> u32 {
        self.put_offset
    }

    pub(crate) fn set_get_offset(&mut self, get_offset: u32) {
        self.get_offset = get_offset;
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub(crate) fn set_token(&mut self, token: u32) {
        self.token = token;
    }

    pub fn error(&self) -> ErrorState {
        self.error
    }

    /// Latches `error` unless an earlier error already latched. Returns whether it latched.
    pub(crate) fn set_error(&mut self, error: ErrorState) -> bool {
        if self.error.is_error() || !error.is_error() {
            return false;
        }
        self.error = error;
        true
    }

    pub(crate) fn set_context_lost(&mut self, reason: LossReason) -> bool {
        self.set_error(ErrorState::ContextLost(reason))
    }

    pub fn has_unprocessed_commands(&self) -> bool {
        self.get_offset != self.put_offset
    }

    pub fn state(&self) -> CommandBufferState {
        CommandBufferState {
            get_offset: self.get_offset,
            put_offset: self.put_offset,
            token: self.token,
            error: self.error,
            generation: self.generation,
        }
    }

    /// Publishes the current state to the shared block under a new generation.
    pub fn report_state(&mut self) -> CommandBufferState {
        self.generation = self.generation.wrapping_add(1);
        let state = self.state();
        write_shared_state(&self.shared_state, &state);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory::read_shared_state;

    fn service() -> (CommandBufferService, SharedMemory) {
        let state = SharedMemory::new(SHARED_STATE_MIN_BYTES);
        (CommandBufferService::new(state.clone()).unwrap(), state)
    }

    #[test]
    fn short_state_block_is_rejected() {
        assert!(CommandBufferService::new(SharedMemory::new(8)).is_err());
    }

    #[test]
    fn rebinding_same_ring_keeps_offsets() {
        let (mut cb, _) = service();
        let ring = SharedMemory::new(64);
        assert!(cb.set_get_buffer(1, ring.clone()));
        cb.flush(5).unwrap();
        cb.set_get_offset(5);
        assert!(!cb.set_get_buffer(1, ring.clone()));
        assert_eq!((cb.get_offset(), cb.put_offset()), (5, 5));

        assert!(cb.set_get_buffer(2, SharedMemory::new(64)));
        assert_eq!((cb.get_offset(), cb.put_offset()), (0, 0));
        assert_eq!(cb.get_buffer_id(), Some(2));
    }

    #[test]
    fn put_must_stay_inside_the_ring() {
        let (mut cb, _) = service();
        assert_eq!(cb.flush(0), Err(ParseError::OutOfBounds));
        cb.set_get_buffer(1, SharedMemory::new(16 * 4));
        assert!(cb.flush(15).is_ok());
        assert_eq!(cb.flush(16), Err(ParseError::OutOfBounds));
        assert_eq!(cb.put_offset(), 15);
    }

    #[test]
    fn first_error_wins_and_is_reported() {
        let (mut cb, shared) = service();
        assert!(cb.set_error(ErrorState::Parse(ParseError::UnknownCommand)));
        assert!(!cb.set_context_lost(LossReason::Guilty));
        cb.set_token(9);
        let reported = cb.report_state();
        assert_eq!(reported.generation, 1);
        let read = read_shared_state(&shared).unwrap();
        assert_eq!(read.error, ErrorState::Parse(ParseError::UnknownCommand));
        assert_eq!(read.token, 9);
        assert_eq!(read, reported);
    }
}
