//! Companion side of the history sync
//!
//! Collects the sync data notifications of one transfer, decodes them and
//! turns device uptime into wall-clock time for export.
//!
//! The device only knows its uptime. The companion anchors the transfer by
//! pairing the wall clock with the device uptime at sync time; every sample
//! is placed relative to that anchor.

use crate::history::LoudnessSample;
use crate::sync::record::{Record, RecordError};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One sample with its reconstructed wall-clock time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedSample {
    pub timestamp: DateTime<Utc>,
    pub uptime_ms: u32,
    pub level_db: u8,
}

/// A full transfer as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryExport {
    pub exported_at: DateTime<Utc>,
    pub threshold_db: u8,
    /// Samples at or above the threshold
    pub over_threshold: usize,
    pub samples: Vec<ExportedSample>,
}

/// Records received in one sync transfer
#[derive(Debug, Default)]
pub struct SyncSession {
    samples: Vec<LoudnessSample>,
    complete: bool,
    malformed: usize,
}

impl SyncSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a batch of notification payloads
    pub fn from_payloads<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut session = Self::new();
        for payload in payloads {
            if let Err(e) = session.receive(payload) {
                tracing::warn!(error = %e, "Skipping malformed sync record");
            }
        }
        session
    }

    /// Handle one notification; returns `Ok(true)` on the end-of-stream record
    ///
    /// Records after the sentinel start a new transfer.
    pub fn receive(&mut self, payload: &[u8]) -> Result<bool, RecordError> {
        let record = Record::decode(payload).inspect_err(|_| self.malformed += 1)?;

        if self.complete {
            self.samples.clear();
            self.complete = false;
        }

        match record {
            Record::Sample(sample) => {
                self.samples.push(sample);
                Ok(false)
            }
            Record::End => {
                self.complete = true;
                Ok(true)
            }
        }
    }

    /// Whether the sentinel has arrived
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn samples(&self) -> &[LoudnessSample] {
        &self.samples
    }

    /// Payloads that failed to decode
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    /// Build an export anchored at `now`, when the device uptime was `uptime_ms`
    ///
    /// Read the anchor pair together once the transfer is over; the walk
    /// also streams samples committed while it was running.
    pub fn export(&self, now: DateTime<Utc>, uptime_ms: u32, threshold_db: u8) -> HistoryExport {
        let samples: Vec<ExportedSample> = self
            .samples
            .iter()
            .map(|s| {
                // Signed wrapping difference: survives the u32 rollover and
                // places samples committed after the anchor in the future.
                let age_ms = uptime_ms.wrapping_sub(s.timestamp_ms) as i32;
                ExportedSample {
                    timestamp: now - TimeDelta::milliseconds(i64::from(age_ms)),
                    uptime_ms: s.timestamp_ms,
                    level_db: s.level_db,
                }
            })
            .collect();

        HistoryExport {
            exported_at: now,
            threshold_db,
            over_threshold: samples.iter().filter(|s| s.level_db >= threshold_db).count(),
            samples,
        }
    }
}

/// Write an export as pretty JSON, creating parent directories
pub fn write_export(path: &Path, export: &HistoryExport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(export)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), samples = export.samples.len(), "History exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::SampleHistory;
    use crate::sync::record::SENTINEL;
    use chrono::TimeZone;

    fn payload(timestamp_ms: u32, level_db: u8) -> Vec<u8> {
        Record::encode(&LoudnessSample {
            timestamp_ms,
            level_db,
        })
        .to_vec()
    }

    #[test]
    fn test_session_collects_until_sentinel() {
        let mut session = SyncSession::new();
        assert_eq!(session.receive(&payload(1000, 60)), Ok(false));
        assert_eq!(session.receive(&payload(2000, 75)), Ok(false));
        assert!(!session.is_complete());
        assert_eq!(session.receive(&SENTINEL), Ok(true));
        assert!(session.is_complete());
        assert_eq!(session.samples().len(), 2);
    }

    #[test]
    fn test_new_transfer_after_sentinel() {
        let mut session = SyncSession::new();
        session.receive(&payload(1000, 60)).unwrap();
        session.receive(&SENTINEL).unwrap();
        session.receive(&payload(5000, 40)).unwrap();
        assert!(!session.is_complete());
        assert_eq!(session.samples()[0].timestamp_ms, 5000);
    }

    #[test]
    fn test_malformed_payload_counted() {
        let session = SyncSession::from_payloads([&[1u8, 2, 3][..], &SENTINEL[..]]);
        assert_eq!(session.malformed(), 1);
        assert!(session.is_complete());
        assert!(session.samples().is_empty());
    }

    #[test]
    fn test_export_anchors_wall_clock() {
        let mut session = SyncSession::new();
        session.receive(&payload(1_000, 65)).unwrap();
        session.receive(&payload(61_000, 72)).unwrap();
        session.receive(&SENTINEL).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let export = session.export(now, 121_000, 70);

        assert_eq!(export.samples[0].timestamp, now - TimeDelta::seconds(120));
        assert_eq!(export.samples[1].timestamp, now - TimeDelta::seconds(60));
        assert_eq!(export.over_threshold, 1);
    }

    #[test]
    fn test_export_across_uptime_wrap() {
        let mut session = SyncSession::new();
        session.receive(&payload(u32::MAX - 999, 50)).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        // Uptime wrapped: 1000 ms before u32::MAX + 1, now at 1000 ms
        let export = session.export(now, 1_000, 70);
        assert_eq!(export.samples[0].timestamp, now - TimeDelta::milliseconds(2_000));
    }

    #[test]
    fn test_sample_newer_than_anchor_stays_recent() {
        let mut session = SyncSession::new();
        session.receive(&payload(1_000, 60)).unwrap();
        session.receive(&payload(1_030, 61)).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        // Anchor taken before the second sample was committed
        let export = session.export(now, 1_000, 70);
        assert_eq!(export.samples[0].timestamp, now);
        assert_eq!(export.samples[1].timestamp, now + TimeDelta::milliseconds(30));
    }

    #[test]
    fn test_anchor_after_transfer_covers_live_history() {
        let history = SampleHistory::with_capacity(8);
        let mut session = SyncSession::new();
        session.receive(&Record::encode(&history.push(55))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        session.receive(&Record::encode(&history.push(56))).unwrap();
        session.receive(&SENTINEL).unwrap();

        let now = Utc::now();
        let export = session.export(now, history.uptime_ms(), 70);
        for sample in &export.samples {
            assert!(sample.timestamp <= now, "{:?} is after the anchor", sample);
            assert!(now - sample.timestamp < TimeDelta::seconds(1));
        }
        assert!(export.samples[0].timestamp <= export.samples[1].timestamp);
    }

    #[test]
    fn test_write_export_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("history.json");
        let mut session = SyncSession::new();
        session.receive(&payload(500, 44)).unwrap();
        let export = session.export(Utc::now(), 1_000, 70);

        write_export(&path, &export).unwrap();
        let loaded: HistoryExport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.samples, export.samples);
    }
}
