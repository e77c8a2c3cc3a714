//! InsideVoice simulator
//!
//! Runs the whole device loop on the host: a scripted (or real) microphone,
//! LED and motor state mirrored to the console, and a simulated companion
//! that connects, pulls the history and optionally exports it.

use anyhow::{bail, Result};
use insidevoice::audio::capture::BlockSource;
use insidevoice::audio::signal::{ScriptedSource, Segment, Waveform};
use insidevoice::companion::{self, SyncSession};
use insidevoice::config::JsonFileStore;
use insidevoice::feedback::{LedColor, SharedLeds, SharedMotor};
use insidevoice::service::{Characteristic, RecordingTransport, Transport};
use insidevoice::sync::record::ControlCommand;
use insidevoice::{ConfigStore, Device, DeviceParts, FeedbackMode, SampleHistory};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Block interval of a real 16 kHz microphone
const BLOCK_INTERVAL: Duration = Duration::from_millis(100);

/// How long the simulated companion waits for the end of a transfer
const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

struct Options {
    threshold: Option<u8>,
    mode: Option<u8>,
    config_path: Option<PathBuf>,
    duration: Duration,
    congest_every: usize,
    export: Option<PathBuf>,
    mic: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            threshold: None,
            mode: None,
            config_path: None,
            duration: Duration::from_secs(30),
            congest_every: 0,
            export: None,
            mic: false,
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("insidevoice=info".parse()?)
                .add_directive("insidevoice_core=info".parse()?),
        )
        .init();

    let Some(options) = parse_args()? else {
        return Ok(());
    };

    println!("╔════════════════════════════════════════════════════════════╗");
    println!(
        "║          InsideVoice v{} - Sound Level Simulator         ║",
        insidevoice::VERSION
    );
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();

    run(options)
}

fn parse_args() -> Result<Option<Options>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--version" | "-v" => {
                println!("insidevoice {} ({})", insidevoice::VERSION, insidevoice::BUILD_DATE);
                return Ok(None);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--mic" => {
                options.mic = true;
                i += 1;
                continue;
            }
            flag @ ("--threshold" | "-t" | "--mode" | "-m" | "--config" | "-c"
            | "--duration" | "-d" | "--congest-every" | "--export" | "-e") => {
                let Some(value) = value else {
                    bail!("{} requires a value", flag);
                };
                match flag {
                    "--threshold" | "-t" => options.threshold = Some(parse_value(flag, value)?),
                    "--mode" | "-m" => options.mode = Some(parse_mode(value)?),
                    "--config" | "-c" => options.config_path = Some(PathBuf::from(value)),
                    "--duration" | "-d" => {
                        options.duration = Duration::from_secs(parse_value(flag, value)?)
                    }
                    "--congest-every" => options.congest_every = parse_value(flag, value)?,
                    _ => options.export = Some(PathBuf::from(value)),
                }
                i += 2;
                continue;
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(None);
            }
        }
    }

    Ok(Some(options))
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    match value.parse() {
        Ok(v) => Ok(v),
        Err(_) => bail!("Invalid value for {}: {}", flag, value),
    }
}

/// Mode by name or raw bitmask byte
fn parse_mode(value: &str) -> Result<u8> {
    let bits = match value {
        "none" => FeedbackMode::NONE.bits(),
        "visual" | "led" => FeedbackMode::VISUAL.bits(),
        "haptic" | "vibration" => FeedbackMode::HAPTIC.bits(),
        "all" => FeedbackMode::ALL.bits(),
        raw => parse_value("--mode", raw)?,
    };
    Ok(bits)
}

fn print_help() {
    println!("Usage: insidevoice [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -t, --threshold DB      Set and persist the over-threshold level (dB)");
    println!("  -m, --mode MODE         Feedback mode: none, visual, haptic, all or a raw byte");
    println!("  -c, --config PATH       Config file (default: <data dir>/insidevoice/config.json)");
    println!("  -d, --duration SECS     How long to monitor before syncing (default: 30)");
    println!("      --congest-every N   Report link congestion on every Nth sync record");
    println!("  -e, --export PATH       Write the synced history as JSON");
    println!("      --mic               Capture from the default microphone (feature `mic`)");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  insidevoice -t 65 -m visual -d 20");
    println!("  insidevoice --congest-every 7 --export history.json");
}

/// Loudness script: calm room, a loud stretch, then conversation level
fn demo_script() -> Vec<Segment> {
    vec![
        Segment::at_db(52, 40),
        Segment::at_db(78, 35),
        Segment::at_db(71, 2),
        Segment::at_db(63, 50),
        Segment::at_db(74, 20),
        Segment::at_db(48, 30),
    ]
}

/// Keeps a live input stream open while its capture half is read
type StreamGuard = Option<Box<dyn std::any::Any>>;

fn open_source(options: &Options) -> Result<(Box<dyn BlockSource>, StreamGuard)> {
    if options.mic {
        return open_microphone();
    }

    let source = ScriptedSource::new(demo_script(), Waveform::Square, insidevoice::BLOCK_SAMPLES)
        .paced(BLOCK_INTERVAL)
        .repeating();
    println!("Source: scripted loudness");
    Ok((Box::new(source), None))
}

#[cfg(feature = "mic")]
fn open_microphone() -> Result<(Box<dyn BlockSource>, StreamGuard)> {
    let (microphone, capture) = insidevoice::mic::open_default(insidevoice::BLOCK_SAMPLES)?;
    println!("Microphone: {} @ {} Hz", microphone.device_name, microphone.device_rate);
    Ok((Box::new(capture), Some(Box::new(microphone))))
}

#[cfg(not(feature = "mic"))]
fn open_microphone() -> Result<(Box<dyn BlockSource>, StreamGuard)> {
    bail!("--mic requires a build with the `mic` feature")
}

fn run(options: Options) -> Result<()> {
    let config_path = options.config_path.clone().unwrap_or_else(|| {
        JsonFileStore::default_path(&dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")))
    });
    let config = Arc::new(ConfigStore::load(Box::new(JsonFileStore::new(&config_path))));
    if let Some(threshold) = options.threshold {
        config.set_threshold(threshold);
    }
    if let Some(mode) = options.mode {
        config.set_feedback_mode(FeedbackMode::from_bits(mode));
    }
    let snapshot = config.snapshot();
    println!("Config: {}", config_path.display());
    println!(
        "Threshold: {} dB | Feedback: visual={} haptic={}",
        snapshot.threshold_db,
        snapshot.feedback_mode.visual(),
        snapshot.feedback_mode.haptic()
    );

    let transport = Arc::new(RecordingTransport::new().congest_every(options.congest_every));
    let leds = SharedLeds::new();
    let motor = SharedMotor::new();
    let history = Arc::new(SampleHistory::new());
    let (source, _stream) = open_source(&options)?;

    let mut device = Device::start(DeviceParts {
        config: Arc::clone(&config),
        history: Arc::clone(&history),
        transport: Arc::clone(&transport) as Arc<dyn Transport>,
        leds: Box::new(leds.clone()),
        motor: Box::new(motor.clone()),
        source,
    })?;

    // Companion connects right away and subscribes to the live level
    device.service().on_connected();

    println!();
    println!("Monitoring for {}s. Press Ctrl+C to stop early.", options.duration.as_secs());
    println!();
    println!("Status:");
    println!("────────────────────────────────────────");

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    let started = Instant::now();
    let mut last_status = String::new();
    while running.load(Ordering::SeqCst) && started.elapsed() < options.duration {
        let led = |color, glyph| if leds.is_on(color) { glyph } else { '·' };
        let status_line = format!(
            "Level: {:>2} dB | LED: {}{}{} | Motor: {:>3}% | History: {:>4}",
            device.service().level_db(),
            led(LedColor::Red, 'R'),
            led(LedColor::Green, 'G'),
            led(LedColor::Blue, 'B'),
            motor.intensity(),
            history.count()
        );

        // Only print if changed (reduce spam)
        if status_line != last_status {
            println!("{}", status_line);
            last_status = status_line;
        }

        std::thread::sleep(Duration::from_millis(50));
    }

    println!();
    println!("Syncing history...");
    transport.clear();
    device
        .service()
        .write(Characteristic::SyncControl, 0, &[ControlCommand::START_SYNC])?;

    let session = wait_for_sync(&transport);
    // Anchor after the transfer: the walk also streams samples committed during it
    let (anchor, uptime_ms) = (chrono::Utc::now(), history.uptime_ms());
    println!(
        "Received {} samples ({} congestion back-offs, {} malformed){}",
        session.samples().len(),
        transport.congested(),
        session.malformed(),
        if session.is_complete() { "" } else { " - INCOMPLETE" }
    );

    if let Some(path) = &options.export {
        let export = session.export(anchor, uptime_ms, snapshot.threshold_db);
        companion::write_export(path, &export)?;
        println!("Exported to {}", path.display());
    }

    if session.is_complete() {
        device
            .service()
            .write(Characteristic::SyncControl, 0, &[ControlCommand::CLEAR_HISTORY])?;
    }

    device.service().on_disconnected();
    println!("Stopping...");
    device.stop();
    info!(blocks = device.blocks_processed(), "Simulation finished");
    println!("Done.");

    Ok(())
}

fn wait_for_sync(transport: &RecordingTransport) -> SyncSession {
    let deadline = Instant::now() + SYNC_TIMEOUT;
    loop {
        let payloads = transport.sent(Characteristic::SyncData);
        let session = SyncSession::from_payloads(payloads.iter().map(Vec::as_slice));
        if session.is_complete() {
            return session;
        }
        if Instant::now() >= deadline {
            warn!(received = session.samples().len(), "Sync did not finish in time");
            return session;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
