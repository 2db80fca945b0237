#![doc = include_str!("../README.md")]

pub mod config;
pub mod device;
pub mod effector;
pub mod interface;
pub mod manager;
pub mod mapping;
pub mod proto;
pub mod proxy;
pub mod scheduler;
pub mod service;
pub mod stream;

use serde::Serialize;

// Re-export the types a client or embedder touches directly.
pub use config::ServiceConfig;
pub use device::{DeviceProfile, DeviceRegistry, NetDevInfo, SysfsNetDevInfo};
pub use effector::{Action, Effector, MockBackend, ShellBackend, SystemBackend, TaprioSpec};
pub use interface::{Admission, Interface, InterfaceContext};
pub use manager::{Manager, TalkerRequest};
pub use mapping::{Allocation, Mapping};
pub use proxy::Proxy;
pub use scheduler::{GateEntry, Schedule, Scheduler};
pub use service::Service;
pub use stream::{MacAddr, StreamConfig, Traffic, TrafficKind, TrafficSpec};

/// Why an admission was refused.
///
/// Every failure a client can observe maps onto one of these variants; the
/// service turns any of them into an `ok=false` response carrying the
/// `Display` rendering as the reason. Only [`AdmissionError::SystemInconsistent`]
/// leaves a mark on the daemon: the interface it happened on is quarantined
/// and answers [`AdmissionError::InterfaceDegraded`] until the process is
/// restarted.
///
/// # Examples
///
/// ```rust
/// use detd::AdmissionError;
///
/// let err = AdmissionError::NoCapacity { resource: "tx queues".into() };
/// assert_eq!(err.to_string(), "no capacity: tx queues exhausted");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AdmissionError {
    /// The request failed validation before touching any state.
    InvalidRequest {
        /// What was wrong with the request
        reason: String,
    },

    /// The interface's kernel driver has no registered device profile.
    UnknownDevice {
        /// Interface the request targeted
        interface: String,
        /// Driver reported by the kernel, empty when unreadable
        driver: String,
    },

    /// The mapping has no free traffic class, queue or socket priority left.
    NoCapacity {
        /// The exhausted resource
        resource: String,
    },

    /// The requested slot overlaps a slot of an already admitted stream.
    ScheduleConflict {
        /// Offset of the rejected stream within its cycle
        txoffset_ns: u64,
        /// Cycle interval of the rejected stream
        interval_ns: u64,
    },

    /// A system action failed and the applied prefix was rolled back.
    ///
    /// The system is back in its pre-call state; the admission simply did
    /// not happen and may be retried.
    EffectorFailed {
        /// The action that failed
        action: String,
        /// Backend error rendering
        error: String,
    },

    /// A system action failed *and* undoing an earlier action failed too.
    ///
    /// The kernel state no longer matches the daemon's bookkeeping. The
    /// interface context degrades itself and refuses further admissions.
    SystemInconsistent {
        /// The undo step that failed
        action: String,
        /// Backend error rendering
        error: String,
    },

    /// The interface was quarantined by an earlier inconsistent rollback.
    InterfaceDegraded {
        /// Quarantined interface
        interface: String,
    },
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::InvalidRequest { reason } => {
                write!(f, "invalid request: {}", reason)
            }
            AdmissionError::UnknownDevice { interface, driver } => {
                if driver.is_empty() {
                    write!(f, "unknown device backing interface {}", interface)
                } else {
                    write!(
                        f,
                        "no device profile for driver {} backing interface {}",
                        driver, interface
                    )
                }
            }
            AdmissionError::NoCapacity { resource } => {
                write!(f, "no capacity: {} exhausted", resource)
            }
            AdmissionError::ScheduleConflict {
                txoffset_ns,
                interval_ns,
            } => {
                write!(
                    f,
                    "schedule conflict: slot at offset {} ns of interval {} ns overlaps an admitted stream",
                    txoffset_ns, interval_ns
                )
            }
            AdmissionError::EffectorFailed { action, error } => {
                write!(f, "system configuration failed at {}: {}", action, error)
            }
            AdmissionError::SystemInconsistent { action, error } => {
                write!(
                    f,
                    "system state inconsistent: undo {} failed: {}",
                    action, error
                )
            }
            AdmissionError::InterfaceDegraded { interface } => {
                write!(
                    f,
                    "interface {} is degraded after a failed rollback; restart the service",
                    interface
                )
            }
        }
    }
}

impl std::error::Error for AdmissionError {}

impl AdmissionError {
    /// Shorthand for a validation failure.
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        AdmissionError::InvalidRequest {
            reason: reason.into(),
        }
    }
}
