//! Command frame format for the local command socket (spec.md §6).
//!
//! The socket listener itself is out of scope (spec.md §1); this module only
//! defines the frame a [`crate::command::CommandFrame`] is decoded from once
//! it reaches the engine, mirroring `original_source/common/commands.cpp`'s
//! `write()`/header layout but in safe, little-endian Rust.

use thiserror::Error;

/// Size of the fixed frame header: `messageId:i32 | commandId:i32 | size:u32`.
pub const HEADER_SIZE: usize = 12;

/// Recognized command ids (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommandId {
    Unknown,
    CommandCompletion,
    Handshake,
    RevisionUpdate,
    Synchronize,
    FetchEntity,
    DeleteEntity,
    ModifyEntity,
    CreateEntity,
    SearchSource,
    Shutdown,
    Notification,
    Ping,
    RevisionReplayed,
    Inspection,
    /// Adapter-specific extension command, wire value `0xFFFF`.
    Custom,
}

impl CommandId {
    #[must_use]
    pub fn to_i32(self) -> i32 {
        match self {
            CommandId::Unknown => 0,
            CommandId::CommandCompletion => 1,
            CommandId::Handshake => 2,
            CommandId::RevisionUpdate => 3,
            CommandId::Synchronize => 4,
            CommandId::FetchEntity => 5,
            CommandId::DeleteEntity => 6,
            CommandId::ModifyEntity => 7,
            CommandId::CreateEntity => 8,
            CommandId::SearchSource => 9,
            CommandId::Shutdown => 10,
            CommandId::Notification => 11,
            CommandId::Ping => 12,
            CommandId::RevisionReplayed => 13,
            CommandId::Inspection => 14,
            CommandId::Custom => 0xFFFF,
        }
    }

    #[must_use]
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => CommandId::CommandCompletion,
            2 => CommandId::Handshake,
            3 => CommandId::RevisionUpdate,
            4 => CommandId::Synchronize,
            5 => CommandId::FetchEntity,
            6 => CommandId::DeleteEntity,
            7 => CommandId::ModifyEntity,
            8 => CommandId::CreateEntity,
            9 => CommandId::SearchSource,
            10 => CommandId::Shutdown,
            11 => CommandId::Notification,
            12 => CommandId::Ping,
            13 => CommandId::RevisionReplayed,
            14 => CommandId::Inspection,
            0xFFFF => CommandId::Custom,
            _ => CommandId::Unknown,
        }
    }
}

/// The three flush semantics a client can request (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// All commands issued before this flush have been attempted against the remote.
    ReplayQueue,
    /// All commands produced by the preceding Synchronize have been committed.
    Synchronization,
    /// All preceding mutation commands have been committed to the store.
    UserQueue,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: need at least {HEADER_SIZE} header bytes, got {0}")]
    TooShort(usize),
    #[error("declared payload size {declared} exceeds available {available} bytes")]
    Truncated { declared: u32, available: usize },
}

/// One decoded command frame: `messageId:i32 | commandId:i32 | size:u32 | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub message_id: i32,
    pub command_id: i32,
    pub payload: Vec<u8>,
}

impl CommandFrame {
    #[must_use]
    pub fn new(message_id: i32, command_id: CommandId, payload: Vec<u8>) -> Self {
        Self {
            message_id,
            command_id: command_id.to_i32(),
            payload,
        }
    }

    #[must_use]
    pub fn command_id(&self) -> CommandId {
        CommandId::from_i32(self.command_id)
    }

    /// Encodes the frame as `header || payload`, little-endian.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.extend_from_slice(&self.command_id.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes a single frame from a byte slice containing exactly one frame
    /// (queue entries are stored whole, so there is no stream framing to do).
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let message_id = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let command_id = i32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let size = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let available = bytes.len() - HEADER_SIZE;
        if size as usize > available {
            return Err(FrameError::Truncated {
                declared: size,
                available,
            });
        }
        let payload = bytes[HEADER_SIZE..HEADER_SIZE + size as usize].to_vec();
        Ok(Self {
            message_id,
            command_id,
            payload,
        })
    }
}
