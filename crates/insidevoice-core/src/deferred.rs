//! Cooperative deferred-task domain
//!
//! Owns the three timed state machines: the LED engine, the vibration engine
//! and the sync walk. Each is a [`Unit`] with at most one armed deadline.
//! Requests and due deadlines are processed one at a time, each running to
//! completion, so the units never interleave.
//!
//! Selecting a pattern resets the engine and re-arms (or disarms) its timer
//! in the same call. The stale deadline is replaced before anything else
//! can run, so a step of the old pattern never fires after the switch.
//!
//! [`DeferredDomain`] works on a virtual clock (`Duration` since start) and
//! never reads the wall clock. [`DeferredHandle`] runs it on a dedicated
//! thread against real time.

use crate::feedback::led::{VisualEngine, VisualPattern};
use crate::feedback::vibration::{HapticEngine, HapticPattern};
use crate::feedback::Step;
use crate::history::SampleHistory;
use crate::monitor::FeedbackSink;
use crate::service::Transport;
use crate::sync::record::ControlCommand;
use crate::sync::walker::{SyncWalker, WalkStatus, SYNC_RETRY_DELAY};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors talking to the deferred domain
#[derive(Error, Debug)]
pub enum DeferredError {
    #[error("Deferred domain has stopped")]
    Stopped,

    #[error("Failed to spawn deferred thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Work submitted to the deferred domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    SelectVisual(VisualPattern),
    SelectHaptic(HapticPattern),
    StopHaptic,
    /// Raw byte written to the sync control characteristic
    Control(u8),
    /// Companion connected
    Connected,
    /// Companion disconnected
    Disconnected,
    /// Neutralize every output and stop the thread
    Shutdown,
}

/// Independently scheduled unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Visual,
    Haptic,
    Sync,
}

impl Unit {
    const ALL: [Unit; 3] = [Unit::Visual, Unit::Haptic, Unit::Sync];

    fn slot(self) -> usize {
        match self {
            Unit::Visual => 0,
            Unit::Haptic => 1,
            Unit::Sync => 2,
        }
    }
}

/// The single-threaded scheduler and the state it owns
pub struct DeferredDomain {
    visual: VisualEngine,
    haptic: HapticEngine,
    walker: SyncWalker,
    history: Arc<SampleHistory>,
    transport: Arc<dyn Transport>,
    /// One armed deadline per unit
    timers: [Option<Duration>; 3],
}

impl DeferredDomain {
    pub fn new(
        visual: VisualEngine,
        haptic: HapticEngine,
        history: Arc<SampleHistory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            visual,
            haptic,
            walker: SyncWalker::new(),
            history,
            transport,
            timers: [None; 3],
        }
    }

    /// Handle one request at virtual time `now`
    pub fn submit(&mut self, request: Request, now: Duration) {
        match request {
            Request::SelectVisual(pattern) => self.select_visual(pattern, now),
            Request::SelectHaptic(pattern) => {
                let step = self.haptic.select(pattern);
                self.arm(Unit::Haptic, now, step.delay());
            }
            Request::StopHaptic => {
                self.haptic.stop();
                self.arm(Unit::Haptic, now, None);
            }
            Request::Control(byte) => self.control(byte, now),
            Request::Connected => self.select_visual(VisualPattern::FlashAccent, now),
            Request::Disconnected => {
                self.walker.cancel();
                self.arm(Unit::Sync, now, None);
            }
            Request::Shutdown => {
                self.visual.stop();
                self.haptic.stop();
                self.walker.cancel();
                self.timers = [None; 3];
                tracing::info!("Deferred domain outputs neutralized");
            }
        }
    }

    /// Run every unit whose deadline is at or before `now`, in deadline order
    ///
    /// Returns the number of units run.
    pub fn run_due(&mut self, now: Duration) -> usize {
        let mut ran = 0;
        while let Some((unit, due)) = self.earliest() {
            if due > now {
                break;
            }
            self.timers[unit.slot()] = None;
            self.run_unit(unit, due);
            ran += 1;
        }
        ran
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Duration> {
        self.earliest().map(|(_, due)| due)
    }

    /// Deadline armed for one unit
    pub fn deadline(&self, unit: Unit) -> Option<Duration> {
        self.timers[unit.slot()]
    }

    pub fn visual_pattern(&self) -> VisualPattern {
        self.visual.pattern()
    }

    pub fn haptic_pattern(&self) -> HapticPattern {
        self.haptic.pattern()
    }

    /// Whether a sync walk is in progress (possibly backing off)
    pub fn is_syncing(&self) -> bool {
        self.walker.is_active()
    }

    fn earliest(&self) -> Option<(Unit, Duration)> {
        Unit::ALL
            .iter()
            .filter_map(|&unit| self.timers[unit.slot()].map(|due| (unit, due)))
            .min_by_key(|&(_, due)| due)
    }

    fn arm(&mut self, unit: Unit, from: Duration, delay: Option<Duration>) {
        self.timers[unit.slot()] = delay.map(|d| from + d);
    }

    fn run_unit(&mut self, unit: Unit, due: Duration) {
        // Next deadline counts from when this one was due, so steps don't drift
        match unit {
            Unit::Visual => {
                let step = self.visual.advance();
                self.arm(Unit::Visual, due, step.delay());
            }
            Unit::Haptic => {
                let step = self.haptic.advance();
                self.arm(Unit::Haptic, due, step.delay());
            }
            Unit::Sync => self.walk(due),
        }
    }

    fn select_visual(&mut self, pattern: VisualPattern, now: Duration) {
        let step: Step = self.visual.select(pattern);
        self.arm(Unit::Visual, now, step.delay());
    }

    fn control(&mut self, byte: u8, now: Duration) {
        match ControlCommand::from_byte(byte) {
            ControlCommand::StartSync => {
                tracing::info!(count = self.history.count(), "Sync started");
                self.walker.start();
                self.walk(now);
            }
            ControlCommand::ClearHistory => self.history.clear(),
            ControlCommand::Unknown(byte) => {
                tracing::debug!(command = byte, "Ignoring unknown sync command");
            }
        }
    }

    fn walk(&mut self, now: Duration) {
        let status = self.walker.walk(&self.history, self.transport.as_ref());
        let retry = match status {
            WalkStatus::Congested { .. } => Some(SYNC_RETRY_DELAY),
            WalkStatus::Complete { .. } | WalkStatus::Idle => None,
        };
        self.arm(Unit::Sync, now, retry);
    }
}

impl FeedbackSink for Sender<Request> {
    fn select_visual(&self, pattern: VisualPattern) {
        if self.send(Request::SelectVisual(pattern)).is_err() {
            tracing::warn!(?pattern, "Deferred domain stopped, LED request dropped");
        }
    }

    fn select_haptic(&self, pattern: HapticPattern) {
        if self.send(Request::SelectHaptic(pattern)).is_err() {
            tracing::warn!(?pattern, "Deferred domain stopped, vibration request dropped");
        }
    }

    fn stop_haptic(&self) {
        if self.send(Request::StopHaptic).is_err() {
            tracing::warn!("Deferred domain stopped, vibration stop dropped");
        }
    }
}

/// Handle to the thread running a [`DeferredDomain`]
pub struct DeferredHandle {
    sender: Sender<Request>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeferredHandle {
    /// Spawn the deferred thread
    pub fn spawn(domain: DeferredDomain) -> Result<DeferredHandle, DeferredError> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self::spawn_with_channel(domain, sender, receiver)
    }

    /// Spawn the deferred thread on an existing channel
    ///
    /// Lets collaborators built before the domain hold a sender already.
    pub fn spawn_with_channel(
        domain: DeferredDomain,
        sender: Sender<Request>,
        receiver: Receiver<Request>,
    ) -> Result<DeferredHandle, DeferredError> {
        let thread = std::thread::Builder::new()
            .name("deferred".into())
            .spawn(move || run_loop(domain, receiver))?;

        Ok(DeferredHandle {
            sender,
            thread: Some(thread),
        })
    }

    /// Sender for submitting requests from other threads
    pub fn sender(&self) -> Sender<Request> {
        self.sender.clone()
    }

    /// Submit a request
    pub fn submit(&self, request: Request) -> Result<(), DeferredError> {
        self.sender.send(request).map_err(|_| DeferredError::Stopped)
    }

    /// Neutralize outputs, stop the thread and wait for it
    pub fn stop(&mut self) {
        if let Some(h) = self.thread.take() {
            let _ = self.sender.send(Request::Shutdown);
            let _ = h.join();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for DeferredHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(mut domain: DeferredDomain, receiver: Receiver<Request>) {
    let epoch = Instant::now();
    tracing::info!("Deferred domain started");

    loop {
        domain.run_due(epoch.elapsed());

        let received = match domain.next_deadline() {
            Some(due) => receiver.recv_deadline(epoch + due),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Request::Shutdown) => {
                domain.submit(Request::Shutdown, epoch.elapsed());
                break;
            }
            Ok(request) => domain.submit(request, epoch.elapsed()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                domain.submit(Request::Shutdown, epoch.elapsed());
                break;
            }
        }
    }

    tracing::info!("Deferred domain stopped");
}
