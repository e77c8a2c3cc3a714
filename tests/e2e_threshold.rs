//! E2E tests for the level estimator and threshold monitor
//!
//! Drives the monitor through the public API with the deferred-domain
//! request channel as its feedback sink.

use crossbeam_channel::Receiver;
use insidevoice::audio::level::{estimate_level, rms_to_db};
use insidevoice::audio::signal::{amplitude_for_db, SignalGenerator, Waveform};
use insidevoice::deferred::Request;
use insidevoice::feedback::led::VisualPattern;
use insidevoice::feedback::vibration::HapticPattern;
use insidevoice::monitor::{LevelReporter, ThresholdMonitor, Transition};
use insidevoice::{ConfigStore, FeedbackMode, SampleHistory, ThresholdConfig};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct LastLevel(AtomicU8);

impl LevelReporter for LastLevel {
    fn report_level(&self, level_db: u8) {
        self.0.store(level_db, Ordering::Relaxed);
    }
}

fn monitor(
    threshold_db: u8,
    mode: FeedbackMode,
) -> (ThresholdMonitor, Receiver<Request>, Arc<SampleHistory>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let history = Arc::new(SampleHistory::new());
    let monitor = ThresholdMonitor::new(
        Arc::new(ConfigStore::in_memory(ThresholdConfig {
            threshold_db,
            feedback_mode: mode,
        })),
        Arc::clone(&history),
        Box::new(tx),
        Arc::new(LastLevel::default()),
    );
    (monitor, rx, history)
}

#[test]
fn test_silence_is_zero_db() {
    assert_eq!(estimate_level(&[0i16; 1600]), 0);
    assert_eq!(estimate_level(&[]), 0);
}

#[test]
fn test_level_range_and_monotonicity() {
    let mut previous = 0u8;
    for amplitude in (0..=i16::MAX as u16).step_by(13) {
        let db = rms_to_db(amplitude);
        assert!(db <= 90, "level {} out of range for amplitude {}", db, amplitude);
        assert!(db >= previous, "level dropped at amplitude {}", amplitude);
        previous = db;
    }

    let full_scale = [i16::MIN, i16::MAX].repeat(800);
    assert_eq!(estimate_level(&full_scale), 90);
}

#[test]
fn test_noise_blocks_stay_in_range() {
    let mut generator = SignalGenerator::new(Waveform::Noise);
    let mut block = vec![0i16; 1600];
    for amplitude in [1u16, 100, 1000, 10_000, 32_767] {
        generator.fill(&mut block, amplitude);
        assert!(estimate_level(&block) <= 90);
    }
}

#[test]
fn test_threshold_scenario() {
    let (mut monitor, rx, _) = monitor(70, FeedbackMode::ALL);
    let levels = [65u8, 68, 71, 72, 73, 69, 60, 58];

    let transitions: Vec<(usize, Transition)> = levels
        .iter()
        .enumerate()
        .filter_map(|(i, &level)| monitor.process_level(level).transition.map(|t| (i, t)))
        .collect();

    assert_eq!(
        transitions,
        vec![(4, Transition::Triggered), (7, Transition::Released)],
        "trigger on the third reading >= 70, release on the third reading < 70"
    );

    let requests: Vec<Request> = rx.try_iter().collect();
    assert_eq!(
        requests,
        vec![
            Request::SelectVisual(VisualPattern::PulseWarm),
            Request::SelectHaptic(HapticPattern::GentleTap),
            Request::SelectVisual(VisualPattern::BreatheCalm),
            Request::StopHaptic,
        ]
    );
}

#[test]
fn test_exactly_two_over_does_not_trigger() {
    let (mut monitor, rx, _) = monitor(70, FeedbackMode::ALL);
    for level in [75u8, 75, 40, 75, 75, 40] {
        assert_eq!(monitor.process_level(level).transition, None);
    }
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_visual_only_mode_skips_haptic() {
    let (mut monitor, rx, _) = monitor(60, FeedbackMode::VISUAL);
    for _ in 0..3 {
        monitor.process_level(61);
    }
    let requests: Vec<Request> = rx.try_iter().collect();
    assert_eq!(requests, vec![Request::SelectVisual(VisualPattern::PulseWarm)]);
}

#[test]
fn test_blocks_commit_one_second_averages() {
    let (mut monitor, _, history) = monitor(70, FeedbackMode::ALL);
    let mut generator = SignalGenerator::new(Waveform::Square);
    let mut block = vec![0i16; insidevoice::BLOCK_SAMPLES];

    for db in [50u8, 60] {
        generator.fill(&mut block, amplitude_for_db(db));
        for _ in 0..10 {
            monitor.process_block(&block);
        }
    }

    let levels: Vec<u8> = history.snapshot().iter().map(|s| s.level_db).collect();
    assert_eq!(levels, vec![50, 60]);
}
