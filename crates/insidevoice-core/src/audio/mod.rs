//! Audio processing module
//!
//! This module contains all audio-related functionality:
//! - Block acquisition and buffer pooling ([`capture`])
//! - Integer RMS and pseudo-SPL estimation ([`level`])
//! - Deterministic test signals ([`signal`])

pub mod capture;
pub mod level;
pub mod signal;
