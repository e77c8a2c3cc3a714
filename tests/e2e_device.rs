//! E2E tests for the assembled device
//!
//! Starts both execution contexts against a scripted microphone and a
//! recording transport, then talks to it through the attribute service
//! like the companion app would.

use insidevoice::audio::signal::{ScriptedSource, Segment, Waveform};
use insidevoice::companion::SyncSession;
use insidevoice::feedback::{LedColor, SharedLeds, SharedMotor};
use insidevoice::service::{AttError, Characteristic, RecordingTransport, Transport};
use insidevoice::sync::record::ControlCommand;
use insidevoice::{ConfigStore, Device, DeviceParts, SampleHistory, ThresholdConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Running {
    device: Device,
    leds: SharedLeds,
    motor: SharedMotor,
    transport: Arc<RecordingTransport>,
}

fn start(script: Vec<Segment>, transport: RecordingTransport) -> Running {
    let leds = SharedLeds::new();
    let motor = SharedMotor::new();
    let transport = Arc::new(transport);
    let device = Device::start(DeviceParts {
        config: Arc::new(ConfigStore::in_memory(ThresholdConfig::default())),
        history: Arc::new(SampleHistory::new()),
        transport: Arc::clone(&transport) as Arc<dyn Transport>,
        leds: Box::new(leds.clone()),
        motor: Box::new(motor.clone()),
        source: Box::new(ScriptedSource::new(script, Waveform::Square, 1600)),
    })
    .expect("device should start");
    Running {
        device,
        leds,
        motor,
        transport,
    }
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn loud_stretch() -> Vec<Segment> {
    vec![
        Segment::at_db(50, 30),
        Segment::at_db(80, 30),
        Segment::at_db(50, 30),
    ]
}

#[test]
fn test_device_idles_with_breathe() {
    let running = start(vec![], RecordingTransport::new());
    wait_for("idle breathe", || running.leds.is_on(LedColor::Green));
    assert!(!running.leds.is_on(LedColor::Red));
    assert_eq!(running.motor.intensity(), 0);
}

#[test]
fn test_loud_stretch_triggers_and_releases() {
    let running = start(loud_stretch(), RecordingTransport::new());
    let history = Arc::clone(running.device.history());

    wait_for("nine committed samples", || history.count() == 9);
    let levels: Vec<u8> = history.snapshot().iter().map(|s| s.level_db).collect();
    assert_eq!(levels, vec![50, 50, 50, 80, 80, 80, 50, 50, 50]);

    wait_for("gentle tap", || running.motor.history().contains(&60));
    // Pulse never lights green, so green means the release selected breathe
    wait_for("release back to breathe", || running.leds.is_on(LedColor::Green));
    let watch_until = Instant::now() + Duration::from_millis(400);
    while Instant::now() < watch_until {
        assert!(!running.leds.is_on(LedColor::Red), "pulse still running after release");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(running.motor.intensity(), 0);
    wait_for("block counter", || running.device.blocks_processed() == 90);
}

#[test]
fn test_companion_syncs_history() {
    let running = start(loud_stretch(), RecordingTransport::new().congest_every(3));
    let service = Arc::clone(running.device.service());
    let history = Arc::clone(running.device.history());
    wait_for("script to finish", || history.count() == 9);

    service.on_connected();
    assert_eq!(service.read(Characteristic::SampleCount), Ok(vec![9, 0, 0, 0]));
    service
        .write(Characteristic::SyncControl, 0, &[ControlCommand::START_SYNC])
        .unwrap();

    let transport = Arc::clone(&running.transport);
    let collect = || {
        let payloads = transport.sent(Characteristic::SyncData);
        SyncSession::from_payloads(payloads.iter().map(Vec::as_slice))
    };
    wait_for("sync sentinel", || collect().is_complete());

    let session = collect();
    assert_eq!(session.samples(), history.snapshot().as_slice());
    assert!(transport.congested() > 0, "congestion should have been exercised");

    service
        .write(Characteristic::SyncControl, 0, &[ControlCommand::CLEAR_HISTORY])
        .unwrap();
    wait_for("history cleared", || history.count() == 0);
    assert_eq!(service.read(Characteristic::SampleCount), Ok(vec![0, 0, 0, 0]));
}

#[test]
fn test_connection_flashes_accent() {
    let running = start(vec![], RecordingTransport::new());
    wait_for("idle breathe", || running.leds.is_on(LedColor::Green));

    running.device.service().on_connected();
    wait_for("blue flash", || running.leds.is_on(LedColor::Blue));
    wait_for("back to breathe", || {
        !running.leds.is_on(LedColor::Blue) && running.leds.is_on(LedColor::Green)
    });
}

#[test]
fn test_threshold_write_applies_to_live_monitor() {
    let running = start(vec![], RecordingTransport::new());
    let service = running.device.service();

    assert_eq!(service.write(Characteristic::Threshold, 0, &[55]), Ok(1));
    assert_eq!(running.device.config().snapshot().threshold_db, 55);

    assert_eq!(
        service.write(Characteristic::Threshold, 0, &[55, 0]),
        Err(AttError::InvalidAttributeLength {
            expected: 1,
            actual: 2
        })
    );
    assert_eq!(running.device.config().snapshot().threshold_db, 55);
}

#[test]
fn test_level_notifications_while_connected() {
    let transport = Arc::new(RecordingTransport::new());
    let source = ScriptedSource::new(vec![Segment::at_db(64, 200)], Waveform::Square, 1600)
        .paced(Duration::from_millis(10));
    let mut device = Device::start(DeviceParts {
        config: Arc::new(ConfigStore::in_memory(ThresholdConfig::default())),
        history: Arc::new(SampleHistory::new()),
        transport: Arc::clone(&transport) as Arc<dyn Transport>,
        leds: Box::new(SharedLeds::new()),
        motor: Box::new(SharedMotor::new()),
        source: Box::new(source),
    })
    .unwrap();
    let service = Arc::clone(device.service());

    wait_for("first level", || service.level_db() == 64);
    assert!(transport.sent(Characteristic::SoundLevel).is_empty());

    service.on_connected();
    wait_for("level notification", || {
        transport.sent(Characteristic::SoundLevel).contains(&vec![64])
    });
    assert_eq!(service.read(Characteristic::SoundLevel), Ok(vec![64]));

    service.on_disconnected();
    device.stop();
    let after_stop = transport.sent(Characteristic::SoundLevel).len();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(transport.sent(Characteristic::SoundLevel).len(), after_stop);
}

#[test]
fn test_stop_neutralizes_outputs() {
    let mut running = start(loud_stretch(), RecordingTransport::new());
    wait_for("any LED", || !running.leds.all_off());

    running.device.stop();
    assert!(!running.device.is_running());
    assert!(running.leds.all_off());
    assert_eq!(running.motor.intensity(), 0);
}
