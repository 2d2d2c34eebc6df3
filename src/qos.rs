//! QoS enforcement
//!
//! Requested QoS levels above the configured maximum are downgraded, never
//! rejected and never raised.

use crate::mqtt::Qos;
use tracing::trace;

/// QoS enforcer
#[derive(Debug, Clone, Copy, Default)]
pub struct QosEnforcer {
    max_qos: Option<Qos>,
}

impl QosEnforcer {
    pub fn new(max_qos: Option<Qos>) -> Self {
        Self { max_qos }
    }

    /// QoS to grant for a requested level
    pub fn enforce(&self, qos: Qos) -> Qos {
        let Some(max) = self.max_qos else {
            return qos;
        };
        let granted = qos.clamp_to(max);
        if granted != qos {
            trace!(requested = %qos, granted = %granted, "QoS downgraded");
        }
        granted
    }
}
