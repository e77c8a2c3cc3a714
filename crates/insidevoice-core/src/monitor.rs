//! Threshold monitor
//!
//! Runs on the acquisition thread. For every block, in this order:
//! 1. estimate the level
//! 2. update the hysteresis machine
//! 3. request feedback on a transition
//! 4. commit a 10-block average to the history when due
//! 5. report the instantaneous level outward
//!
//! Feedback selection is a request to the deferred domain, never a direct
//! write to the pattern engines, so the acquisition thread does not wait on
//! pattern timing.

use crate::audio::capture::BlockSource;
use crate::audio::level::estimate_level;
use crate::config::ConfigStore;
use crate::feedback::led::VisualPattern;
use crate::feedback::vibration::HapticPattern;
use crate::history::{LoudnessSample, SampleHistory};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Consecutive blocks needed on the other side of the threshold to switch
pub const HYSTERESIS_COUNT: u8 = 3;

/// Blocks averaged into one history sample (1 s at 100 ms blocks)
pub const AVERAGE_BLOCKS: u32 = 10;

/// Pause after a failed block read
pub const ACQUISITION_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Receives the instantaneous level of every block
pub trait LevelReporter: Send + Sync {
    fn report_level(&self, level_db: u8);
}

/// Accepts pattern requests on behalf of the feedback engines
pub trait FeedbackSink: Send {
    fn select_visual(&self, pattern: VisualPattern);
    fn select_haptic(&self, pattern: HapticPattern);
    fn stop_haptic(&self);
}

/// State change of the hysteresis machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// UNDER -> OVER
    Triggered,
    /// OVER -> UNDER
    Released,
}

/// Two-state hysteresis over `level >= threshold`
#[derive(Debug, Default, Clone)]
pub struct Hysteresis {
    over_count: u8,
    under_count: u8,
    active: bool,
}

impl Hysteresis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one level, returning the transition it caused, if any
    pub fn update(&mut self, level_db: u8, threshold_db: u8) -> Option<Transition> {
        if level_db >= threshold_db {
            self.over_count = self.over_count.saturating_add(1);
            self.under_count = 0;

            if !self.active && self.over_count >= HYSTERESIS_COUNT {
                self.active = true;
                return Some(Transition::Triggered);
            }
        } else {
            self.under_count = self.under_count.saturating_add(1);
            self.over_count = 0;

            if self.active && self.under_count >= HYSTERESIS_COUNT {
                self.active = false;
                return Some(Transition::Released);
            }
        }
        None
    }

    /// Whether feedback is currently active (OVER)
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Integer mean over a fixed number of levels
#[derive(Debug, Clone)]
pub struct LevelAverager {
    sum: u32,
    blocks: u32,
    window: u32,
}

impl LevelAverager {
    pub fn new(window: u32) -> Self {
        Self {
            sum: 0,
            blocks: 0,
            window: window.max(1),
        }
    }

    /// Add a level; returns the mean once the window is full and restarts
    pub fn add(&mut self, level_db: u8) -> Option<u8> {
        self.sum += u32::from(level_db);
        self.blocks += 1;
        if self.blocks < self.window {
            return None;
        }
        let mean = (self.sum / self.blocks) as u8;
        self.sum = 0;
        self.blocks = 0;
        Some(mean)
    }
}

impl Default for LevelAverager {
    fn default() -> Self {
        Self::new(AVERAGE_BLOCKS)
    }
}

/// What one block produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOutcome {
    pub level_db: u8,
    pub transition: Option<Transition>,
    pub committed: Option<LoudnessSample>,
}

/// Per-block decision logic
pub struct ThresholdMonitor {
    hysteresis: Hysteresis,
    averager: LevelAverager,
    config: Arc<ConfigStore>,
    history: Arc<SampleHistory>,
    feedback: Box<dyn FeedbackSink>,
    reporter: Arc<dyn LevelReporter>,
}

impl ThresholdMonitor {
    pub fn new(
        config: Arc<ConfigStore>,
        history: Arc<SampleHistory>,
        feedback: Box<dyn FeedbackSink>,
        reporter: Arc<dyn LevelReporter>,
    ) -> Self {
        Self {
            hysteresis: Hysteresis::new(),
            averager: LevelAverager::default(),
            config,
            history,
            feedback,
            reporter,
        }
    }

    /// Process one block of 16-bit PCM
    pub fn process_block(&mut self, samples: &[i16]) -> BlockOutcome {
        self.process_level(estimate_level(samples))
    }

    /// Process an already-estimated level
    pub fn process_level(&mut self, level_db: u8) -> BlockOutcome {
        let config = self.config.snapshot();
        tracing::trace!(level_db, threshold_db = config.threshold_db, "block");

        let transition = self.hysteresis.update(level_db, config.threshold_db);
        match transition {
            Some(Transition::Triggered) => {
                tracing::info!(level_db, threshold_db = config.threshold_db, "Over threshold");
                if config.feedback_mode.visual() {
                    self.feedback.select_visual(VisualPattern::PulseWarm);
                }
                if config.feedback_mode.haptic() {
                    self.feedback.select_haptic(HapticPattern::GentleTap);
                }
            }
            Some(Transition::Released) => {
                tracing::info!(level_db, threshold_db = config.threshold_db, "Under threshold");
                self.feedback.select_visual(VisualPattern::BreatheCalm);
                self.feedback.stop_haptic();
            }
            None => {}
        }

        let committed = self.averager.add(level_db).map(|mean| self.history.push(mean));

        self.reporter.report_level(level_db);

        BlockOutcome {
            level_db,
            transition,
            committed,
        }
    }

    /// Whether over-threshold feedback is active
    pub fn is_active(&self) -> bool {
        self.hysteresis.is_active()
    }
}

/// Handle to the running acquisition thread
pub struct MonitorHandle {
    stop_flag: Arc<AtomicBool>,
    blocks: Arc<AtomicU64>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MonitorHandle {
    /// Spawn the acquisition thread
    pub fn spawn(
        mut monitor: ThresholdMonitor,
        mut source: Box<dyn BlockSource>,
    ) -> std::io::Result<MonitorHandle> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&stop_flag);
        let blocks = Arc::new(AtomicU64::new(0));
        let blocks_clone = Arc::clone(&blocks);

        let thread = std::thread::Builder::new()
            .name("monitor".into())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    acquisition_loop(&mut monitor, source.as_mut(), &flag_clone, &blocks_clone);
                }));
                match result {
                    Ok(()) => tracing::info!("Monitor thread exited normally"),
                    Err(panic_info) => {
                        let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic_info.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic".to_string()
                        };
                        tracing::error!(panic = %msg, "Monitor thread PANICKED");
                    }
                }
            })?;

        Ok(MonitorHandle {
            stop_flag,
            blocks,
            thread: Some(thread),
        })
    }

    /// Stop the acquisition thread and wait for it to finish
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }

    /// Check if the acquisition thread is still alive
    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Blocks processed so far
    pub fn blocks_processed(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquisition_loop(
    monitor: &mut ThresholdMonitor,
    source: &mut dyn BlockSource,
    stop_flag: &AtomicBool,
    blocks: &AtomicU64,
) {
    tracing::info!("Monitor thread running");
    let mut failures: u64 = 0;

    while !stop_flag.load(Ordering::Acquire) {
        let block = match source.read_block() {
            Ok(block) => block,
            Err(e) => {
                if failures == 0 {
                    tracing::warn!(error = %e, "Block read failed, retrying");
                } else {
                    tracing::debug!(error = %e, failures, "Block read still failing");
                }
                failures += 1;
                std::thread::sleep(ACQUISITION_RETRY_DELAY);
                continue;
            }
        };

        if failures > 0 {
            tracing::info!(failures, "Block acquisition recovered");
            failures = 0;
        }

        monitor.process_block(&block);
        // Buffer goes back to the pool here
        drop(block);
        blocks.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::{Block, CaptureError};
    use crate::config::{FeedbackMode, ThresholdConfig};
    use std::sync::atomic::{AtomicU8, AtomicUsize};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Requested {
        Visual(VisualPattern),
        Haptic(HapticPattern),
        StopHaptic,
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<Requested>>>);

    impl RecordingSink {
        fn take(&self) -> Vec<Requested> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl FeedbackSink for RecordingSink {
        fn select_visual(&self, pattern: VisualPattern) {
            self.0.lock().unwrap().push(Requested::Visual(pattern));
        }
        fn select_haptic(&self, pattern: HapticPattern) {
            self.0.lock().unwrap().push(Requested::Haptic(pattern));
        }
        fn stop_haptic(&self) {
            self.0.lock().unwrap().push(Requested::StopHaptic);
        }
    }

    #[derive(Default)]
    struct LastLevel(AtomicU8);

    impl LevelReporter for LastLevel {
        fn report_level(&self, level_db: u8) {
            self.0.store(level_db, Ordering::Relaxed);
        }
    }

    fn monitor(mode: FeedbackMode) -> (ThresholdMonitor, RecordingSink, Arc<SampleHistory>) {
        let sink = RecordingSink::default();
        let history = Arc::new(SampleHistory::with_capacity(32));
        let config = Arc::new(ConfigStore::in_memory(ThresholdConfig {
            threshold_db: 70,
            feedback_mode: mode,
        }));
        let monitor = ThresholdMonitor::new(
            config,
            history.clone(),
            Box::new(sink.clone()),
            Arc::new(LastLevel::default()),
        );
        (monitor, sink, history)
    }

    #[test]
    fn test_two_blocks_over_do_not_trigger() {
        let mut h = Hysteresis::new();
        assert_eq!(h.update(75, 70), None);
        assert_eq!(h.update(75, 70), None);
        assert_eq!(h.update(60, 70), None);
        assert!(!h.is_active());
    }

    #[test]
    fn test_three_blocks_over_trigger() {
        let mut h = Hysteresis::new();
        assert_eq!(h.update(70, 70), None);
        assert_eq!(h.update(71, 70), None);
        assert_eq!(h.update(90, 70), Some(Transition::Triggered));
        // Staying over does not fire again
        assert_eq!(h.update(90, 70), None);
        assert!(h.is_active());
    }

    #[test]
    fn test_release_is_symmetric() {
        let mut h = Hysteresis::new();
        for _ in 0..3 {
            h.update(80, 70);
        }
        assert_eq!(h.update(69, 70), None);
        assert_eq!(h.update(69, 70), None);
        assert_eq!(h.update(71, 70), None, "an over block resets the under streak");
        assert_eq!(h.update(69, 70), None);
        assert_eq!(h.update(69, 70), None);
        assert_eq!(h.update(69, 70), Some(Transition::Released));
    }

    #[test]
    fn test_under_blocks_while_idle_do_nothing() {
        let mut h = Hysteresis::new();
        for _ in 0..10 {
            assert_eq!(h.update(20, 70), None);
        }
    }

    #[test]
    fn test_averager_window() {
        let mut avg = LevelAverager::new(4);
        assert_eq!(avg.add(10), None);
        assert_eq!(avg.add(11), None);
        assert_eq!(avg.add(12), None);
        assert_eq!(avg.add(14), Some(11));
        // Restarted
        assert_eq!(avg.add(90), None);
    }

    #[test]
    fn test_trigger_requests_configured_channels() {
        let (mut monitor, sink, _) = monitor(FeedbackMode::ALL);
        for _ in 0..3 {
            monitor.process_level(80);
        }
        assert_eq!(
            sink.take(),
            vec![
                Requested::Visual(VisualPattern::PulseWarm),
                Requested::Haptic(HapticPattern::GentleTap)
            ]
        );
    }

    #[test]
    fn test_trigger_respects_mode_but_release_is_unconditional() {
        let (mut monitor, sink, _) = monitor(FeedbackMode::NONE);
        for _ in 0..3 {
            monitor.process_level(80);
        }
        assert!(sink.take().is_empty());

        for _ in 0..3 {
            monitor.process_level(40);
        }
        assert_eq!(
            sink.take(),
            vec![Requested::Visual(VisualPattern::BreatheCalm), Requested::StopHaptic]
        );
    }

    #[test]
    fn test_haptic_only_mode() {
        let (mut monitor, sink, _) = monitor(FeedbackMode::HAPTIC);
        for _ in 0..3 {
            monitor.process_level(85);
        }
        assert_eq!(sink.take(), vec![Requested::Haptic(HapticPattern::GentleTap)]);
    }

    #[test]
    fn test_history_commit_every_ten_blocks() {
        let (mut monitor, _, history) = monitor(FeedbackMode::ALL);
        let levels = [40u8, 41, 42, 43, 44, 45, 46, 47, 48, 49];

        for (i, &level) in levels.iter().enumerate() {
            let outcome = monitor.process_level(level);
            if i < 9 {
                assert_eq!(outcome.committed, None);
            } else {
                assert_eq!(outcome.committed.map(|s| s.level_db), Some(44));
            }
        }
        assert_eq!(history.count(), 1);
        assert_eq!(history.get(0).map(|s| s.level_db), Some(44));
    }

    #[test]
    fn test_every_block_reports_level() {
        let reporter = Arc::new(LastLevel::default());
        let mut monitor = ThresholdMonitor::new(
            Arc::new(ConfigStore::in_memory(ThresholdConfig::default())),
            Arc::new(SampleHistory::with_capacity(4)),
            Box::new(RecordingSink::default()),
            reporter.clone(),
        );

        monitor.process_level(33);
        assert_eq!(reporter.0.load(Ordering::Relaxed), 33);
        let outcome = monitor.process_block(&[0i16; 160]);
        assert_eq!(outcome.level_db, 0);
        assert_eq!(reporter.0.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_threshold_change_takes_effect_next_block() {
        let config = Arc::new(ConfigStore::in_memory(ThresholdConfig::default()));
        let sink = RecordingSink::default();
        let mut monitor = ThresholdMonitor::new(
            config.clone(),
            Arc::new(SampleHistory::with_capacity(4)),
            Box::new(sink.clone()),
            Arc::new(LastLevel::default()),
        );

        monitor.process_level(65);
        monitor.process_level(65);
        config.set_threshold(60);
        assert_eq!(monitor.process_level(65).transition, None);
        monitor.process_level(65);
        assert_eq!(monitor.process_level(65).transition, Some(Transition::Triggered));
    }

    /// Fails a set number of reads, then yields 60 dB blocks forever
    struct FlakySource {
        failures_left: Arc<AtomicUsize>,
    }

    impl BlockSource for FlakySource {
        fn read_block(&mut self) -> Result<Block, CaptureError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(CaptureError::Timeout(Duration::from_millis(1)));
            }
            std::thread::sleep(Duration::from_millis(1));
            Ok(Block::detached(vec![1000; 160]))
        }
    }

    #[test]
    fn test_failed_reads_are_retried_not_fatal() {
        let failures = Arc::new(AtomicUsize::new(3));
        let reporter = Arc::new(LastLevel::default());
        let monitor = ThresholdMonitor::new(
            Arc::new(ConfigStore::in_memory(ThresholdConfig::default())),
            Arc::new(SampleHistory::with_capacity(16)),
            Box::new(RecordingSink::default()),
            reporter.clone(),
        );
        let source = FlakySource {
            failures_left: failures.clone(),
        };
        let mut handle = MonitorHandle::spawn(monitor, Box::new(source)).unwrap();

        // Three failures cost three retry delays before the first block
        std::thread::sleep(ACQUISITION_RETRY_DELAY + ACQUISITION_RETRY_DELAY / 2);
        assert!(handle.is_alive(), "monitor must survive a failed read");
        assert_eq!(handle.blocks_processed(), 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.blocks_processed() < 20 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(
            handle.blocks_processed() >= 20,
            "acquisition never recovered: {} blocks",
            handle.blocks_processed()
        );
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(handle.is_alive());
        assert_eq!(reporter.0.load(Ordering::Relaxed), 60);

        handle.stop();
        assert!(!handle.is_alive());
    }
}
