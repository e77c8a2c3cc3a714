//! History export to the companion app
//!
//! - [`record`]: 5-byte wire records, the end-of-stream sentinel and the
//!   control command byte
//! - [`walker`]: resumable cursor walk over the sample history with
//!   congestion back-off

pub mod record;
pub mod walker;

pub use record::{ControlCommand, Record, RecordError, RECORD_LEN, SENTINEL};
pub use walker::{SyncWalker, WalkStatus, SYNC_RETRY_DELAY};
