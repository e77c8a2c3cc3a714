//! Sync wire format
//!
//! Each history entry travels as one 5-byte notification:
//!
//! | bytes | content                         |
//! |-------|---------------------------------|
//! | 0..4  | `timestamp_ms`, u32 little-endian |
//! | 4     | `level_db`                      |
//!
//! Five `0xFF` bytes mark the end of the stream. Levels never exceed 90, so
//! a real record can't collide with the sentinel.

use crate::history::LoudnessSample;
use thiserror::Error;

/// Size of one record on the wire
pub const RECORD_LEN: usize = 5;

/// End-of-stream marker
pub const SENTINEL: [u8; RECORD_LEN] = [0xFF; RECORD_LEN];

/// Errors decoding a record on the companion side
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("Invalid record length: expected 5 bytes, got {0}")]
    Length(usize),
}

/// Decoded notification payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Sample(LoudnessSample),
    End,
}

impl Record {
    /// Wire bytes for a history sample
    pub fn encode(sample: &LoudnessSample) -> [u8; RECORD_LEN] {
        let ts = sample.timestamp_ms.to_le_bytes();
        [ts[0], ts[1], ts[2], ts[3], sample.level_db]
    }

    /// Parse one notification payload
    pub fn decode(bytes: &[u8]) -> Result<Record, RecordError> {
        let bytes: [u8; RECORD_LEN] = bytes
            .try_into()
            .map_err(|_| RecordError::Length(bytes.len()))?;

        if bytes == SENTINEL {
            return Ok(Record::End);
        }

        Ok(Record::Sample(LoudnessSample {
            timestamp_ms: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            level_db: bytes[4],
        }))
    }
}

/// Command byte written to the sync control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// `0x01`: stream the whole history from index 0
    StartSync,
    /// `0x02`: drop every history entry
    ClearHistory,
    /// Anything else, ignored
    Unknown(u8),
}

impl ControlCommand {
    pub const START_SYNC: u8 = 0x01;
    pub const CLEAR_HISTORY: u8 = 0x02;

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            Self::START_SYNC => ControlCommand::StartSync,
            Self::CLEAR_HISTORY => ControlCommand::ClearHistory,
            other => ControlCommand::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ControlCommand::StartSync => Self::START_SYNC,
            ControlCommand::ClearHistory => Self::CLEAR_HISTORY,
            ControlCommand::Unknown(other) => other,
        }
    }
}
