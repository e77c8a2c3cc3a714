//! Wireless attribute service
//!
//! Exposes the configuration, the live level and the history export as six
//! characteristics under one primary service. The radio stack itself is an
//! external collaborator: it forwards reads and writes here and delivers the
//! notifications handed to a [`Transport`].
//!
//! Writes are validated before any state is touched. Sync control and
//! connection events are forwarded to the deferred domain, which owns the
//! sync walk and the pattern engines.

use crate::config::{ConfigStore, FeedbackMode};
use crate::deferred::Request;
use crate::history::SampleHistory;
use crate::monitor::LevelReporter;
use crossbeam_channel::Sender;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Primary service UUID
pub const SERVICE_UUID: &str = "4f490000-2ff1-4a5e-a683-4de2c5a10100";

/// Name advertised while waiting for a companion
pub const DEVICE_NAME: &str = "InsideVoice";

/// Characteristics of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// R/W, 1 byte dB
    Threshold,
    /// R/Notify, 1 byte current dB
    SoundLevel,
    /// R/W, 1 byte bitmask
    FeedbackMode,
    /// R, u32 little-endian
    SampleCount,
    /// W, 1 byte command
    SyncControl,
    /// Notify, 5-byte records
    SyncData,
}

/// Access flags of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

impl Characteristic {
    pub const ALL: [Characteristic; 6] = [
        Characteristic::Threshold,
        Characteristic::SoundLevel,
        Characteristic::FeedbackMode,
        Characteristic::SampleCount,
        Characteristic::SyncControl,
        Characteristic::SyncData,
    ];

    /// 128-bit UUID string
    pub fn uuid(self) -> &'static str {
        match self {
            Characteristic::Threshold => "4f490001-2ff1-4a5e-a683-4de2c5a10100",
            Characteristic::SoundLevel => "4f490002-2ff1-4a5e-a683-4de2c5a10100",
            Characteristic::FeedbackMode => "4f490003-2ff1-4a5e-a683-4de2c5a10100",
            Characteristic::SampleCount => "4f490004-2ff1-4a5e-a683-4de2c5a10100",
            Characteristic::SyncControl => "4f490005-2ff1-4a5e-a683-4de2c5a10100",
            Characteristic::SyncData => "4f490006-2ff1-4a5e-a683-4de2c5a10100",
        }
    }

    pub fn properties(self) -> Properties {
        let (read, write, notify) = match self {
            Characteristic::Threshold | Characteristic::FeedbackMode => (true, true, false),
            Characteristic::SoundLevel => (true, false, true),
            Characteristic::SampleCount => (true, false, false),
            Characteristic::SyncControl => (false, true, false),
            Characteristic::SyncData => (false, false, true),
        };
        Properties {
            read,
            write,
            notify,
        }
    }
}

/// Outcome of one notification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No buffer space right now; try again later
    Congested,
}

/// Outbound notification channel
pub trait Transport: Send + Sync {
    /// Try to deliver one notification without blocking
    fn notify(&self, characteristic: Characteristic, payload: &[u8]) -> Delivery;
}

/// Attribute protocol rejections
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttError {
    #[error("Invalid attribute length: expected {expected}, got {actual}")]
    InvalidAttributeLength { expected: usize, actual: usize },

    #[error("Invalid offset: {0}")]
    InvalidOffset(u16),

    #[error("Read not permitted on {0:?}")]
    ReadNotPermitted(Characteristic),

    #[error("Write not permitted on {0:?}")]
    WriteNotPermitted(Characteristic),

    #[error("Service unavailable")]
    Unavailable,
}

impl AttError {
    /// ATT protocol error code
    pub fn code(&self) -> u8 {
        match self {
            AttError::ReadNotPermitted(_) => 0x02,
            AttError::WriteNotPermitted(_) => 0x03,
            AttError::InvalidOffset(_) => 0x07,
            AttError::InvalidAttributeLength { .. } => 0x0D,
            AttError::Unavailable => 0x0E,
        }
    }
}

/// The device-side attribute service
pub struct ConfigService {
    config: Arc<ConfigStore>,
    history: Arc<SampleHistory>,
    transport: Arc<dyn Transport>,
    requests: Sender<Request>,
    level_db: AtomicU8,
    connected: AtomicBool,
}

impl ConfigService {
    pub fn new(
        config: Arc<ConfigStore>,
        history: Arc<SampleHistory>,
        transport: Arc<dyn Transport>,
        requests: Sender<Request>,
    ) -> Self {
        tracing::info!(uuid = SERVICE_UUID, name = DEVICE_NAME, "Attribute service registered");
        Self {
            config,
            history,
            transport,
            requests,
            level_db: AtomicU8::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Serve a read
    pub fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, AttError> {
        let value = match characteristic {
            Characteristic::Threshold => vec![self.config.snapshot().threshold_db],
            Characteristic::FeedbackMode => vec![self.config.snapshot().feedback_mode.bits()],
            Characteristic::SoundLevel => vec![self.level_db()],
            Characteristic::SampleCount => {
                let count = u32::try_from(self.history.count()).unwrap_or(u32::MAX);
                count.to_le_bytes().to_vec()
            }
            Characteristic::SyncControl | Characteristic::SyncData => {
                return Err(AttError::ReadNotPermitted(characteristic))
            }
        };
        Ok(value)
    }

    /// Serve a write, returning the number of bytes consumed
    ///
    /// Every writable characteristic takes exactly one byte at offset 0;
    /// anything else is rejected with nothing changed.
    pub fn write(
        &self,
        characteristic: Characteristic,
        offset: u16,
        data: &[u8],
    ) -> Result<usize, AttError> {
        if !characteristic.properties().write {
            return Err(AttError::WriteNotPermitted(characteristic));
        }
        if offset != 0 {
            return Err(AttError::InvalidOffset(offset));
        }
        let value = match data {
            [value] => *value,
            _ => {
                return Err(AttError::InvalidAttributeLength {
                    expected: 1,
                    actual: data.len(),
                })
            }
        };

        match characteristic {
            Characteristic::Threshold => {
                self.config.set_threshold(value);
                tracing::info!(threshold_db = value, "Threshold set via wireless");
            }
            Characteristic::FeedbackMode => {
                self.config.set_feedback_mode(FeedbackMode::from_bits(value));
                tracing::info!(feedback_mode = value, "Feedback mode set via wireless");
            }
            Characteristic::SyncControl => {
                self.requests
                    .send(Request::Control(value))
                    .map_err(|_| AttError::Unavailable)?;
            }
            Characteristic::SoundLevel | Characteristic::SampleCount | Characteristic::SyncData => {
                return Err(AttError::WriteNotPermitted(characteristic))
            }
        }
        Ok(data.len())
    }

    /// Companion connected
    pub fn on_connected(&self) {
        self.connected.store(true, Ordering::Release);
        tracing::info!("Connected");
        if self.requests.send(Request::Connected).is_err() {
            tracing::warn!("Deferred domain stopped, connection not signalled");
        }
    }

    /// Companion gone; the radio collaborator restarts advertising
    pub fn on_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        tracing::info!("Disconnected");
        if self.requests.send(Request::Disconnected).is_err() {
            tracing::warn!("Deferred domain stopped, disconnection not signalled");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Last reported level
    pub fn level_db(&self) -> u8 {
        self.level_db.load(Ordering::Relaxed)
    }
}

impl LevelReporter for ConfigService {
    fn report_level(&self, level_db: u8) {
        self.level_db.store(level_db, Ordering::Relaxed);
        if !self.is_connected() {
            return;
        }
        if self.transport.notify(Characteristic::SoundLevel, &[level_db]) == Delivery::Congested {
            tracing::trace!(level_db, "Level notification dropped, link congested");
        }
    }
}

/// Transport that records delivered notifications in memory
///
/// Congestion can be injected on chosen attempts or periodically, which is
/// how the host simulator exercises the sync back-off path.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    inner: Mutex<RecordingState>,
}

/// Non-sync notifications kept per characteristic; older ones are dropped
pub const NOTIFY_LOG_CAP: usize = 256;

#[derive(Debug, Default)]
struct RecordingState {
    /// Every delivered sync record
    sync_data: Vec<Vec<u8>>,
    /// Most recent level notifications, capped at `NOTIFY_LOG_CAP`
    other: VecDeque<(Characteristic, Vec<u8>)>,
    attempts: usize,
    congested: usize,
    congest_attempts: HashSet<usize>,
    congest_every: Option<usize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report congestion on these sync data attempt numbers (0-based)
    pub fn congest_on(self, attempts: impl IntoIterator<Item = usize>) -> Self {
        self.state().congest_attempts.extend(attempts);
        self
    }

    /// Report congestion on every `n`-th sync data attempt
    pub fn congest_every(self, n: usize) -> Self {
        self.state().congest_every = (n > 0).then_some(n);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Payloads delivered on one characteristic, in order
    ///
    /// Sync data is kept in full; other characteristics only keep the last
    /// [`NOTIFY_LOG_CAP`] notifications.
    pub fn sent(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        let state = self.state();
        if characteristic == Characteristic::SyncData {
            return state.sync_data.clone();
        }
        state
            .other
            .iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Number of congestion signals returned so far
    pub fn congested(&self) -> usize {
        self.state().congested
    }

    /// Forget every delivered payload
    pub fn clear(&self) {
        let mut state = self.state();
        state.sync_data.clear();
        state.other.clear();
    }
}

impl Transport for RecordingTransport {
    fn notify(&self, characteristic: Characteristic, payload: &[u8]) -> Delivery {
        let mut state = self.state();

        if characteristic != Characteristic::SyncData {
            if state.other.len() == NOTIFY_LOG_CAP {
                state.other.pop_front();
            }
            state.other.push_back((characteristic, payload.to_vec()));
            return Delivery::Sent;
        }

        let attempt = state.attempts;
        state.attempts += 1;
        let periodic = state
            .congest_every
            .is_some_and(|n| (attempt + 1) % n == 0);
        if periodic || state.congest_attempts.remove(&attempt) {
            state.congested += 1;
            return Delivery::Congested;
        }

        state.sync_data.push(payload.to_vec());
        Delivery::Sent
    }
}
