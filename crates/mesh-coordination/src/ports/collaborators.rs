//! # Collaborator Capabilities
//!
//! One small interface per role. Concrete detectors, protection engines and
//! audit loggers live outside this crate; the node wires whichever ones its
//! role set activates.

use std::sync::Arc;

use crate::domain::{AlertRecord, CollaboratorError, PolicySet};

/// Callback a detector invokes for every alert it raises.
pub type AlertCallback = Arc<dyn Fn(AlertRecord) + Send + Sync>;

/// `detector` role.
pub trait Detector: Send + Sync {
    fn start(&self) -> Result<(), CollaboratorError>;

    fn stop(&self);

    /// Callbacks accumulate; invocation order is unspecified.
    fn register_alert_callback(&self, callback: AlertCallback);
}

/// `protector` role. Invoked synchronously from the message router.
pub trait ProtectionEngine: Send + Sync {
    fn handle_alert(&self, alert: &AlertRecord) -> Result<(), CollaboratorError>;

    /// Receives the merged local policy state after each update.
    fn update_policies(&self, policies: &PolicySet) -> Result<(), CollaboratorError>;

    fn start(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn stop(&self) {}
}

/// Audit sink for every alert seen locally, regardless of role.
pub trait AlertLogger: Send + Sync {
    fn log_alert(&self, alert: &AlertRecord);
}
