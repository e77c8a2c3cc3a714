//! Startup sequencing
//!
//! Wires the components together, sets the idle LED pattern and starts both
//! execution contexts. Stopping tears them down in reverse: the acquisition
//! thread first so no request arrives after the deferred domain has
//! neutralized the outputs.

use crate::audio::capture::BlockSource;
use crate::config::ConfigStore;
use crate::deferred::{DeferredDomain, DeferredHandle, Request};
use crate::feedback::led::{VisualEngine, VisualPattern};
use crate::feedback::vibration::HapticEngine;
use crate::feedback::{HapticOutput, VisualOutput};
use crate::history::SampleHistory;
use crate::monitor::{LevelReporter, MonitorHandle, ThresholdMonitor};
use crate::service::{ConfigService, Transport};
use anyhow::Context;
use std::sync::Arc;

/// Collaborators the device is built from
pub struct DeviceParts {
    pub config: Arc<ConfigStore>,
    pub history: Arc<SampleHistory>,
    pub transport: Arc<dyn Transport>,
    pub leds: Box<dyn VisualOutput>,
    pub motor: Box<dyn HapticOutput>,
    pub source: Box<dyn BlockSource>,
}

/// A running device
pub struct Device {
    service: Arc<ConfigService>,
    config: Arc<ConfigStore>,
    history: Arc<SampleHistory>,
    monitor: MonitorHandle,
    deferred: DeferredHandle,
}

impl Device {
    /// Start the deferred domain and the acquisition thread
    pub fn start(parts: DeviceParts) -> anyhow::Result<Device> {
        let DeviceParts {
            config,
            history,
            transport,
            leds,
            motor,
            source,
        } = parts;

        let (sender, receiver) = crossbeam_channel::unbounded();

        let service = Arc::new(ConfigService::new(
            Arc::clone(&config),
            Arc::clone(&history),
            Arc::clone(&transport),
            sender.clone(),
        ));

        let domain = DeferredDomain::new(
            VisualEngine::new(leds),
            HapticEngine::new(motor),
            Arc::clone(&history),
            transport,
        );
        let deferred = DeferredHandle::spawn_with_channel(domain, sender.clone(), receiver)
            .context("Failed to start deferred domain")?;

        deferred
            .submit(Request::SelectVisual(VisualPattern::BreatheCalm))
            .context("Failed to set idle LED pattern")?;

        let monitor = ThresholdMonitor::new(
            Arc::clone(&config),
            Arc::clone(&history),
            Box::new(sender),
            Arc::clone(&service) as Arc<dyn LevelReporter>,
        );
        let monitor =
            MonitorHandle::spawn(monitor, source).context("Failed to start monitor thread")?;

        let snapshot = config.snapshot();
        tracing::info!(
            threshold_db = snapshot.threshold_db,
            feedback_mode = snapshot.feedback_mode.bits(),
            "Device started"
        );

        Ok(Device {
            service,
            config,
            history,
            monitor,
            deferred,
        })
    }

    /// Attribute service for the radio collaborator
    pub fn service(&self) -> &Arc<ConfigService> {
        &self.service
    }

    pub fn history(&self) -> &Arc<SampleHistory> {
        &self.history
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Blocks processed by the acquisition thread
    pub fn blocks_processed(&self) -> u64 {
        self.monitor.blocks_processed()
    }

    /// Whether both execution contexts are still running
    pub fn is_running(&self) -> bool {
        self.monitor.is_alive() && self.deferred.is_alive()
    }

    /// Stop acquisition, neutralize outputs, join both threads
    pub fn stop(&mut self) {
        self.monitor.stop();
        self.deferred.stop();
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop();
    }
}
