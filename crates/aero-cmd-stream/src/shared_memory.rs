//! Shared memory blocks exchanged with the producer.
//!
//! A block is an array of 32-bit words so that ring entries and the shared state block can be
//! read and written without tearing. Byte-granular views are little-endian and are only used
//! for bulk transfer-buffer payloads.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::command_buffer::CommandBufferState;
use crate::error::{CommandStreamError, ErrorState, ParseError};

/// Clonable handle to one shared block. Clones alias the same memory.
#[derive(Clone)]
pub struct SharedMemory {
    words: Arc<[AtomicU32]>,
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("len_bytes", &self.len_bytes())
            .finish()
    }
}

impl SharedMemory {
    /// Allocates a zeroed block, rounding `size_bytes` up to whole words.
    pub fn new(size_bytes: usize) -> Self {
        let words = size_bytes.div_ceil(4);
        Self {
            words: (0..words).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn from_words(words: &[u32]) -> Self {
        Self {
            words: words.iter().map(|&w| AtomicU32::new(w)).collect(),
        }
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    pub fn ptr_eq(&self, other: &SharedMemory) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }

    pub fn read_word(&self, index: usize) -> Option<u32> {
        self.words.get(index).map(|w| w.load(Ordering::Acquire))
    }

    pub fn write_word(&self, index: usize, value: u32) -> bool {
        match self.words.get(index) {
            Some(w) => {
                w.store(value, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn read_words(&self, start: usize, count: usize) -> Option<Vec<u32>> {
        let end = start.checked_add(count)?;
        let slice = self.words.get(start..end)?;
        Some(slice.iter().map(|w| w.load(Ordering::Acquire)).collect())
    }

    pub fn write_words(&self, start: usize, values: &[u32]) -> bool {
        let Some(end) = start.checked_add(values.len()) else {
            return false;
        };
        let Some(slice) = self.words.get(start..end) else {
            return false;
        };
        for (w, &v) in slice.iter().zip(values) {
            w.store(v, Ordering::Release);
        }
        true
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.len_bytes() {
            return None;
        }
        let mut out = Vec::with_capacity(len);
        for byte in offset..end {
            let word = self.words[byte / 4].load(Ordering::Acquire);
            out.push((word >> (8 * (byte % 4))) as u8);
        }
        Some(out)
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> bool {
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        if end > self.len_bytes() {
            return false;
        }
        for (i, &b) in data.iter().enumerate() {
            let byte = offset + i;
            let shift = 8 * (byte % 4);
            let word = &self.words[byte / 4];
            word.fetch_and(!(0xff << shift), Ordering::AcqRel);
            word.fetch_or(u32::from(b) << shift, Ordering::AcqRel);
        }
        true
    }
}

// Shared state block layout, in words.
const STATE_GENERATION: usize = 0;
const STATE_GET_OFFSET: usize = 1;
const STATE_PUT_OFFSET: usize = 2;
const STATE_TOKEN: usize = 3;
const STATE_ERROR: usize = 4;
const STATE_LOSS_REASON: usize = 5;
pub const SHARED_STATE_WORDS: usize = 6;
pub const SHARED_STATE_MIN_BYTES: usize = SHARED_STATE_WORDS * 4;

/// Publishes `state` to the producer. The generation word is written last so a reader that
/// sees a new generation also sees the fields that go with it.
pub fn write_shared_state(memory: &SharedMemory, state: &CommandBufferState) {
    let (error_code, loss_reason) = state.error.to_words();
    memory.write_words(
        STATE_GET_OFFSET,
        &[
            state.get_offset,
            state.put_offset,
            state.token,
            error_code,
            loss_reason,
        ],
    );
    memory.write_word(STATE_GENERATION, state.generation);
}

/// Producer-side read of the shared state block. Retries until it sees a stable generation.
pub fn read_shared_state(memory: &SharedMemory) -> Option<CommandBufferState> {
    loop {
        let generation = memory.read_word(STATE_GENERATION)?;
        let words = memory.read_words(STATE_GET_OFFSET, SHARED_STATE_WORDS - 1)?;
        if memory.read_word(STATE_GENERATION)? != generation {
            continue;
        }
        return Some(CommandBufferState {
            get_offset: words[STATE_GET_OFFSET - 1],
            put_offset: words[STATE_PUT_OFFSET - 1],
            token: words[STATE_TOKEN - 1],
            error: ErrorState::from_words(words[STATE_ERROR - 1], words[STATE_LOSS_REASON - 1]),
            generation,
        });
    }
}

#[derive(Clone, Debug)]
pub struct TransferBuffer {
    pub memory: SharedMemory,
    /// Usable size in bytes; never larger than the block.
    pub size: u32,
}

/// Id-addressed transfer buffers of one stream. Ids are positive.
#[derive(Debug, Default)]
pub struct TransferBufferRegistry {
    buffers: HashMap<i32, TransferBuffer>,
}

impl TransferBufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: i32,
        memory: SharedMemory,
        size: u32,
    ) -> Result<(), CommandStreamError> {
        if id <= 0 {
            return Err(CommandStreamError::invalid(format!(
                "transfer buffer id {id} is not positive"
            )));
        }
        if self.buffers.contains_key(&id) {
            return Err(CommandStreamError::invalid(format!(
                "transfer buffer {id} is already registered"
            )));
        }
        if size as usize > memory.len_bytes() {
            return Err(CommandStreamError::invalid(format!(
                "transfer buffer {id} size {size} exceeds its {} byte block",
                memory.len_bytes()
            )));
        }
        self.buffers.insert(id, TransferBuffer { memory, size });
        Ok(())
    }

    pub fn destroy(&mut self, id: i32) -> Result<TransferBuffer, CommandStreamError> {
        self.buffers
            .remove(&id)
            .ok_or_else(|| CommandStreamError::invalid(format!("unknown transfer buffer {id}")))
    }

    pub fn get(&self, id: i32) -> Option<&TransferBuffer> {
        self.buffers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Reads `size` bytes at `offset` of buffer `id` on behalf of a decoded command.
    pub fn read_range(&self, id: i32, offset: u32, size: u32) -> Result<Vec<u8>, ParseError> {
        let buffer = self.buffers.get(&id).ok_or(ParseError::InvalidArguments)?;
        let end = offset.checked_add(size).ok_or(ParseError::OutOfBounds)?;
        if end > buffer.size {
            return Err(ParseError::OutOfBounds);
        }
        buffer
            .memory
            .read_bytes(offset as usize, size as usize)
            .ok_or(ParseError::OutOfBounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LossReason;
    use pretty_assertions::assert_eq;

    #[test]
    fn byte_views_are_little_endian_over_words() {
        let mem = SharedMemory::new(7);
        assert_eq!(mem.len_bytes(), 8);
        assert!(mem.write_bytes(1, &[0xaa, 0xbb, 0xcc, 0xdd]));
        assert_eq!(mem.read_word(0), Some(0xccbb_aa00));
        assert_eq!(mem.read_word(1), Some(0x0000_00dd));
        assert_eq!(mem.read_bytes(2, 3), Some(vec![0xbb, 0xcc, 0xdd]));
        assert!(mem.read_bytes(6, 3).is_none());
        assert!(!mem.write_bytes(7, &[1, 2]));
    }

    #[test]
    fn clones_alias_the_same_block() {
        let a = SharedMemory::new(16);
        let b = a.clone();
        b.write_word(3, 42);
        assert_eq!(a.read_word(3), Some(42));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&SharedMemory::new(16)));
    }

    #[test]
    fn shared_state_is_published_and_read_back() {
        let mem = SharedMemory::new(SHARED_STATE_MIN_BYTES);
        let state = CommandBufferState {
            get_offset: 12,
            put_offset: 40,
            token: 7,
            error: ErrorState::ContextLost(LossReason::Innocent),
            generation: 3,
        };
        write_shared_state(&mem, &state);
        assert_eq!(read_shared_state(&mem), Some(state));
    }

    #[test]
    fn transfer_buffer_ids_and_ranges_are_validated() {
        let mut registry = TransferBufferRegistry::new();
        let mem = SharedMemory::new(64);
        mem.write_bytes(8, b"payload");

        assert!(registry.register(0, mem.clone(), 64).is_err());
        assert!(registry.register(1, mem.clone(), 65).is_err());
        registry.register(1, mem.clone(), 32).unwrap();
        assert!(registry.register(1, mem.clone(), 32).is_err());

        assert_eq!(registry.read_range(1, 8, 7).unwrap(), b"payload".to_vec());
        assert_eq!(registry.read_range(1, 30, 4), Err(ParseError::OutOfBounds));
        assert_eq!(
            registry.read_range(1, u32::MAX, 2),
            Err(ParseError::OutOfBounds)
        );
        assert_eq!(registry.read_range(2, 0, 1), Err(ParseError::InvalidArguments));

        registry.destroy(1).unwrap();
        assert!(registry.destroy(1).is_err());
        assert!(registry.is_empty());
    }
}
