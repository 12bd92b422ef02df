use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ClientId, StreamId};

/// Malformed command stream. Terminal for the stream.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseError {
    #[error("command size is zero")]
    InvalidSize,

    #[error("command or offset out of bounds")]
    OutOfBounds,

    #[error("unknown command")]
    UnknownCommand,

    #[error("invalid command arguments")]
    InvalidArguments,
}

impl ParseError {
    fn code(self) -> u32 {
        match self {
            ParseError::InvalidSize => 1,
            ParseError::OutOfBounds => 2,
            ParseError::UnknownCommand => 3,
            ParseError::InvalidArguments => 4,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => ParseError::InvalidSize,
            2 => ParseError::OutOfBounds,
            3 => ParseError::UnknownCommand,
            4 => ParseError::InvalidArguments,
            _ => return None,
        })
    }
}

/// Why a context was lost, as far as the driver can tell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// This context caused the reset.
    Guilty,
    /// Another context caused the reset.
    Innocent,
    Unknown,
}

impl LossReason {
    pub fn code(self) -> u32 {
        match self {
            LossReason::Guilty => 1,
            LossReason::Innocent => 2,
            LossReason::Unknown => 3,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => LossReason::Guilty,
            2 => LossReason::Innocent,
            _ => LossReason::Unknown,
        }
    }
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LossReason::Guilty => "guilty",
            LossReason::Innocent => "innocent",
            LossReason::Unknown => "unknown",
        })
    }
}

/// Latched error of a command stream. Once set it never goes back to `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum ErrorState {
    #[default]
    None,
    Parse(ParseError),
    ContextLost(LossReason),
}

const ERROR_CODE_CONTEXT_LOST: u32 = 0x100;

impl ErrorState {
    pub fn is_error(self) -> bool {
        self != ErrorState::None
    }

    pub fn loss_reason(self) -> Option<LossReason> {
        match self {
            ErrorState::ContextLost(reason) => Some(reason),
            _ => None,
        }
    }

    /// `(error_code, loss_reason)` words of the shared state block.
    pub fn to_words(self) -> (u32, u32) {
        match self {
            ErrorState::None => (0, 0),
            ErrorState::Parse(err) => (err.code(), 0),
            ErrorState::ContextLost(reason) => (ERROR_CODE_CONTEXT_LOST, reason.code()),
        }
    }

    pub fn from_words(error_code: u32, loss_reason: u32) -> Self {
        if error_code == 0 {
            return ErrorState::None;
        }
        if error_code == ERROR_CODE_CONTEXT_LOST {
            return ErrorState::ContextLost(LossReason::from_code(loss_reason));
        }
        ParseError::from_code(error_code)
            .map(ErrorState::Parse)
            .unwrap_or(ErrorState::ContextLost(LossReason::Unknown))
    }
}

/// Stream-terminating failure found while decoding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("context lost ({0})")]
    ContextLost(LossReason),
}

impl From<StreamFault> for ErrorState {
    fn from(fault: StreamFault) -> Self {
        match fault {
            StreamFault::Parse(err) => ErrorState::Parse(err),
            StreamFault::ContextLost(reason) => ErrorState::ContextLost(reason),
        }
    }
}

/// Result of executing one command in a [`crate::CommandHandler`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("context lost ({0})")]
    ContextLost(LossReason),

    /// The memory budget denied an allocation. The stream keeps running.
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },
}

/// Failure building or activating a rendering context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("failed to create surface: {0}")]
    SurfaceCreation(String),

    #[error("failed to create context: {0}")]
    ContextCreation(String),

    #[error("failed to initialize context: {0}")]
    Initialize(String),

    #[error("failed to make context current")]
    MakeCurrentFailed,

    #[error("context lost during initialization ({0})")]
    Lost(LossReason),
}

/// Request-level failure. Never affects other streams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandStreamError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stream is not initialized")]
    NotInitialized,

    #[error("stream is already initialized")]
    AlreadyInitialized,

    #[error("stream has been lost and awaits teardown")]
    StreamLost,

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("unknown client {0}")]
    UnknownClient(ClientId),
}

impl CommandStreamError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        CommandStreamError::InvalidArgument(message.into())
    }
}

pub type Result<T, E = CommandStreamError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_state_words_round_trip_for_every_variant() {
        let states = [
            ErrorState::None,
            ErrorState::Parse(ParseError::InvalidSize),
            ErrorState::Parse(ParseError::OutOfBounds),
            ErrorState::Parse(ParseError::UnknownCommand),
            ErrorState::Parse(ParseError::InvalidArguments),
            ErrorState::ContextLost(LossReason::Guilty),
            ErrorState::ContextLost(LossReason::Innocent),
            ErrorState::ContextLost(LossReason::Unknown),
        ];
        for state in states {
            let (code, reason) = state.to_words();
            assert_eq!(ErrorState::from_words(code, reason), state);
        }
    }

    #[test]
    fn unrecognized_error_code_reads_as_lost() {
        assert_eq!(
            ErrorState::from_words(77, 0),
            ErrorState::ContextLost(LossReason::Unknown)
        );
    }

    #[test]
    fn error_state_serializes_with_kind_tag() {
        let json = serde_json::to_string(&ErrorState::ContextLost(LossReason::Guilty)).unwrap();
        assert_eq!(json, r#"{"kind":"context_lost","reason":"guilty"}"#);
        let json = serde_json::to_string(&ErrorState::None).unwrap();
        assert_eq!(json, r#"{"kind":"none"}"#);
    }
}
