//! Threshold and feedback configuration
//!
//! The live configuration is cached in a [`ConfigStore`]; readers take a
//! copy, never a reference. Setters update the cache first and then persist
//! through a [`ConfigPersistence`] collaborator. A failed save is logged and
//! the new value stays in effect for the rest of the session.
//!
//! [`JsonFileStore`] persists to `<data_dir>/insidevoice/config.json` or any
//! path given to it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Default over-threshold level in pseudo-SPL dB
pub const DEFAULT_THRESHOLD_DB: u8 = 70;

/// Errors raised by configuration persistence
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Config storage unavailable: {0}")]
    Unavailable(String),
}

/// Feedback channel bitmask (bit0 = visual, bit1 = haptic)
///
/// Stored exactly as written by the companion app; unknown bits are kept
/// but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedbackMode(u8);

impl FeedbackMode {
    /// LED feedback
    pub const VISUAL: FeedbackMode = FeedbackMode(1 << 0);
    /// Vibration feedback
    pub const HAPTIC: FeedbackMode = FeedbackMode(1 << 1);
    /// Both channels
    pub const ALL: FeedbackMode = FeedbackMode(0b11);
    /// No over-threshold feedback
    pub const NONE: FeedbackMode = FeedbackMode(0);

    /// Wrap a raw byte
    pub const fn from_bits(bits: u8) -> Self {
        FeedbackMode(bits)
    }

    /// The raw byte
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: FeedbackMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn visual(self) -> bool {
        self.contains(Self::VISUAL)
    }

    pub fn haptic(self) -> bool {
        self.contains(Self::HAPTIC)
    }
}

impl Default for FeedbackMode {
    fn default() -> Self {
        Self::ALL
    }
}

fn default_threshold_db() -> u8 {
    DEFAULT_THRESHOLD_DB
}

/// Threshold configuration record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Level at or above which a block counts as "over"
    #[serde(default = "default_threshold_db")]
    pub threshold_db: u8,
    /// Channels that react when the threshold is crossed
    #[serde(default)]
    pub feedback_mode: FeedbackMode,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            threshold_db: DEFAULT_THRESHOLD_DB,
            feedback_mode: FeedbackMode::default(),
        }
    }
}

/// Persistent key-value storage for the configuration record
pub trait ConfigPersistence: Send {
    /// Load the saved record; `Ok(None)` when nothing has been saved yet
    fn load(&mut self) -> Result<Option<ThresholdConfig>, ConfigError>;

    /// Save the record so it survives power loss
    fn save(&mut self, config: &ThresholdConfig) -> Result<(), ConfigError>;
}

/// JSON file persistence
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Persist to an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default path: `<data_dir>/insidevoice/config.json`
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("insidevoice").join("config.json")
    }

    /// Path this store writes to
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigPersistence for JsonFileStore {
    fn load(&mut self) -> Result<Option<ThresholdConfig>, ConfigError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&mut self, config: &ThresholdConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, json)?;
        tracing::debug!(path = %self.path.display(), "Config saved to disk");
        Ok(())
    }
}

/// In-memory persistence (nothing survives the process)
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    saved: Option<ThresholdConfig>,
}

impl MemoryStore {
    /// Last saved record
    pub fn saved(&self) -> Option<ThresholdConfig> {
        self.saved
    }
}

impl ConfigPersistence for MemoryStore {
    fn load(&mut self) -> Result<Option<ThresholdConfig>, ConfigError> {
        Ok(self.saved)
    }

    fn save(&mut self, config: &ThresholdConfig) -> Result<(), ConfigError> {
        self.saved = Some(*config);
        Ok(())
    }
}

/// Live configuration cache with set-and-persist semantics
///
/// The cached record and the persistence backend sit behind separate locks
/// so a slow save never holds up a snapshot.
pub struct ConfigStore {
    current: Mutex<ThresholdConfig>,
    persistence: Mutex<Box<dyn ConfigPersistence>>,
}

impl ConfigStore {
    /// Load the saved configuration, falling back to defaults on any error
    pub fn load(mut persistence: Box<dyn ConfigPersistence>) -> Self {
        let current = match persistence.load() {
            Ok(Some(config)) => {
                tracing::info!(
                    threshold_db = config.threshold_db,
                    feedback_mode = config.feedback_mode.bits(),
                    "Config loaded"
                );
                config
            }
            Ok(None) => {
                tracing::info!("No saved config, using defaults");
                ThresholdConfig::default()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                ThresholdConfig::default()
            }
        };

        Self {
            current: Mutex::new(current),
            persistence: Mutex::new(persistence),
        }
    }

    /// Store that persists nowhere
    pub fn in_memory(config: ThresholdConfig) -> Self {
        Self {
            current: Mutex::new(config),
            persistence: Mutex::new(Box::new(MemoryStore::default())),
        }
    }

    fn current(&self) -> MutexGuard<'_, ThresholdConfig> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> ThresholdConfig {
        *self.current()
    }

    /// Set the threshold and persist it
    pub fn set_threshold(&self, threshold_db: u8) {
        self.update(|config| config.threshold_db = threshold_db);
    }

    /// Set the feedback mode bitmask and persist it
    pub fn set_feedback_mode(&self, mode: FeedbackMode) {
        self.update(|config| config.feedback_mode = mode);
    }

    fn update(&self, apply: impl FnOnce(&mut ThresholdConfig)) {
        // Saves are serialized on the persistence lock so the last write wins on disk too.
        let mut persistence = self
            .persistence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let config = {
            let mut current = self.current();
            apply(&mut current);
            *current
        };

        if let Err(e) = persistence.save(&config) {
            tracing::warn!(error = %e, "Failed to persist config, keeping change for this session");
        }
    }
}
