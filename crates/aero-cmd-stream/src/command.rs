//! Ring-buffer command wire format.
//!
//! Every command starts with one header word: `size | opcode << 21`, where `size` counts ring
//! entries (32-bit words) including the header. A command never straddles the end of the ring;
//! producers pad the tail with a `NOOP` instead.

use thiserror::Error;

use crate::shared_memory::SharedMemory;

const SIZE_BITS: u32 = 21;
const SIZE_MASK: u32 = (1 << SIZE_BITS) - 1;

pub const MAX_COMMAND_ENTRIES: u32 = SIZE_MASK;
pub const MAX_OPCODE: u16 = (u32::MAX >> SIZE_BITS) as u16;

pub mod opcode {
    pub const NOOP: u16 = 0;
    pub const SET_TOKEN: u16 = 1;
    pub const WAIT_SYNC_POINT: u16 = 2;
    pub const BEGIN_QUERY: u16 = 3;
    pub const END_QUERY: u16 = 4;

    /// Opcodes from here on are executed by the stream's command handler.
    pub const FIRST_HANDLER_OPCODE: u16 = 256;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandHeader {
    pub size: u32,
    pub opcode: u16,
}

impl CommandHeader {
    pub fn encode(self) -> u32 {
        (u32::from(self.opcode) << SIZE_BITS) | (self.size & SIZE_MASK)
    }

    pub fn decode(word: u32) -> Self {
        Self {
            size: word & SIZE_MASK,
            opcode: (word >> SIZE_BITS) as u16,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error("command of {size} entries does not fit a ring of {capacity} entries")]
    TooLarge { size: u32, capacity: u32 },

    #[error("opcode {0} does not fit the header")]
    InvalidOpcode(u16),
}

/// Producer-side encoder that appends commands to a ring.
///
/// The writer does not know the consumer's `get_offset`; callers must not write more than the
/// ring holds between flushes.
#[derive(Debug)]
pub struct CommandWriter {
    ring: SharedMemory,
    put: u32,
}

impl CommandWriter {
    pub fn new(ring: SharedMemory, put: u32) -> Self {
        Self { ring, put }
    }

    pub fn put_offset(&self) -> u32 {
        self.put
    }

    fn capacity(&self) -> u32 {
        self.ring.len_words() as u32
    }

    /// Appends one command and returns the new put offset.
    pub fn command(&mut self, opcode: u16, args: &[u32]) -> Result<u32, WriteError> {
        if opcode > MAX_OPCODE {
            return Err(WriteError::InvalidOpcode(opcode));
        }
        let capacity = self.capacity();
        let size = args.len() as u64 + 1;
        if size > u64::from(capacity) || size > u64::from(MAX_COMMAND_ENTRIES) {
            return Err(WriteError::TooLarge {
                size: size.min(u64::from(u32::MAX)) as u32,
                capacity,
            });
        }
        let size = size as u32;

        let remaining = capacity - self.put;
        if size > remaining {
            // Pad to the end so the command starts at entry 0.
            let pad = CommandHeader {
                size: remaining,
                opcode: opcode::NOOP,
            };
            self.ring.write_word(self.put as usize, pad.encode());
            self.put = 0;
        }

        let header = CommandHeader { size, opcode };
        self.ring.write_word(self.put as usize, header.encode());
        self.ring.write_words(self.put as usize + 1, args);
        self.put += size;
        if self.put == capacity {
            self.put = 0;
        }
        Ok(self.put)
    }

    pub fn noop(&mut self, extra_entries: u32) -> Result<u32, WriteError> {
        let args = vec![0; extra_entries as usize];
        self.command(opcode::NOOP, &args)
    }

    pub fn set_token(&mut self, token: u32) -> Result<u32, WriteError> {
        self.command(opcode::SET_TOKEN, &[token])
    }

    pub fn wait_sync_point(&mut self, sync_point: u32) -> Result<u32, WriteError> {
        self.command(opcode::WAIT_SYNC_POINT, &[sync_point])
    }

    pub fn begin_query(&mut self, query_id: u32) -> Result<u32, WriteError> {
        self.command(opcode::BEGIN_QUERY, &[query_id])
    }

    pub fn end_query(&mut self, query_id: u32) -> Result<u32, WriteError> {
        self.command(opcode::END_QUERY, &[query_id])
    }
}
