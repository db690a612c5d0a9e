//! # Built-in Collaborators
//!
//! - `TracingAlertLogger` - structured audit log with a bounded in-memory history
//! - `RecordingProtectionEngine` - keeps every alert and policy set it receives
//! - `ManualDetector` - raises alerts on demand
//!
//! The logger is the default for every node. The other two stand in for
//! real engines in demos and tests.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::warn;

use crate::domain::{AlertRecord, CollaboratorError, PolicySet};
use crate::ports::{AlertCallback, AlertLogger, Detector, ProtectionEngine};

/// Alerts kept by a default `TracingAlertLogger`.
pub const DEFAULT_ALERT_HISTORY: usize = 1000;

/// Emits every alert as a `WARN` event and keeps the most recent ones.
#[derive(Debug)]
pub struct TracingAlertLogger {
    capacity: usize,
    history: Mutex<VecDeque<AlertRecord>>,
}

impl Default for TracingAlertLogger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ALERT_HISTORY)
    }
}

impl TracingAlertLogger {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_ALERT_HISTORY))),
        }
    }

    /// Most recent alerts, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AlertRecord> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Alerts of one type, oldest first.
    pub fn by_type(&self, alert_type: &str) -> Vec<AlertRecord> {
        self.history
            .lock()
            .iter()
            .filter(|alert| alert.alert_type == alert_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }
}

impl AlertLogger for TracingAlertLogger {
    fn log_alert(&self, alert: &AlertRecord) {
        warn!(
            target: "sentinel::alerts",
            alert_type = %alert.alert_type,
            severity = ?alert.severity,
            confidence = alert.confidence,
            device_id = %alert.device_id,
            target_id = ?alert.target_id,
            description = %alert.description,
            "security alert"
        );

        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(alert.clone());
    }
}

/// Protection engine that records what it is asked to do.
#[derive(Debug, Default)]
pub struct RecordingProtectionEngine {
    alerts: Mutex<Vec<AlertRecord>>,
    policies: RwLock<PolicySet>,
    policy_updates: AtomicUsize,
    running: AtomicBool,
}

impl RecordingProtectionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled_alerts(&self) -> Vec<AlertRecord> {
        self.alerts.lock().clone()
    }

    /// Latest merged policy set received.
    pub fn policies(&self) -> PolicySet {
        self.policies.read().clone()
    }

    pub fn policy_updates(&self) -> usize {
        self.policy_updates.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl ProtectionEngine for RecordingProtectionEngine {
    fn handle_alert(&self, alert: &AlertRecord) -> Result<(), CollaboratorError> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }

    fn update_policies(&self, policies: &PolicySet) -> Result<(), CollaboratorError> {
        *self.policies.write() = policies.clone();
        self.policy_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start(&self) -> Result<(), CollaboratorError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Detector driven by hand through [`ManualDetector::raise`].
#[derive(Default)]
pub struct ManualDetector {
    callbacks: RwLock<Vec<AlertCallback>>,
    running: AtomicBool,
}

impl ManualDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `alert` to every registered callback. Ignored while stopped.
    /// Returns whether the alert was delivered.
    pub fn raise(&self, alert: AlertRecord) -> bool {
        if !self.is_running() {
            return false;
        }
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(alert.clone());
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }
}

impl Detector for ManualDetector {
    fn start(&self) -> Result<(), CollaboratorError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn register_alert_callback(&self, callback: AlertCallback) {
        self.callbacks.write().push(callback);
    }
}
