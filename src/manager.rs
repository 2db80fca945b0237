//! Routing of admission requests to per-interface contexts.
//!
//! The manager owns the process-wide registry of [`InterfaceContext`]s,
//! keyed by interface name and created on first use. There is exactly one
//! manager per process, created at startup and passed explicitly to the
//! service; no ambient state.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::AdmissionError;
use crate::device::{DeviceRegistry, NetDevInfo};
use crate::effector::SystemBackend;
use crate::interface::{Admission, Interface, InterfaceContext};
use crate::proto::StreamQosRequest;
use crate::stream::{MacAddr, StreamConfig, TrafficSpec};

/// A decoded, domain-typed talker admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkerRequest {
    /// Interface the stream transmits on
    pub interface: String,
    pub stream: StreamConfig,
    pub spec: TrafficSpec,
    /// Upper bound of the transmit window, zero when unspecified
    pub txmax_ns: u64,
    /// Explicit schedule start, zero to compute from the cycle
    pub basetime_ns: u64,
}

impl TryFrom<&StreamQosRequest> for TalkerRequest {
    type Error = AdmissionError;

    fn try_from(request: &StreamQosRequest) -> Result<Self, Self::Error> {
        if !request.talker {
            return Err(AdmissionError::invalid(
                "only talker streams are supported",
            ));
        }
        if request.setup_socket {
            return Err(AdmissionError::invalid(
                "socket setup by the service is not supported",
            ));
        }
        if request.interface.is_empty() {
            return Err(AdmissionError::invalid("interface name is empty"));
        }
        let dmac = MacAddr::from_str(&request.dmac)
            .map_err(|e| AdmissionError::invalid(e.to_string()))?;
        let vid = u16::try_from(request.vid)
            .map_err(|_| AdmissionError::invalid(format!("vid {} out of range", request.vid)))?;
        let pcp = u8::try_from(request.pcp)
            .map_err(|_| AdmissionError::invalid(format!("pcp {} out of range", request.pcp)))?;
        Ok(TalkerRequest {
            interface: request.interface.clone(),
            stream: StreamConfig {
                dmac,
                vid,
                pcp,
                txoffset_ns: u64::from(request.txmin),
            },
            spec: TrafficSpec {
                interval_ns: u64::from(request.period),
                size_bytes: request.size,
            },
            txmax_ns: u64::from(request.txmax),
            basetime_ns: u64::from(request.basetime),
        })
    }
}

/// Process-wide owner of the interface contexts.
pub struct Manager {
    devices: DeviceRegistry,
    netdev: Arc<dyn NetDevInfo>,
    backend: Arc<dyn SystemBackend>,
    contexts: Mutex<HashMap<String, Arc<InterfaceContext>>>,
}

impl Manager {
    pub fn new(
        devices: DeviceRegistry,
        netdev: Arc<dyn NetDevInfo>,
        backend: Arc<dyn SystemBackend>,
    ) -> Self {
        Manager {
            devices,
            netdev,
            backend,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a talker stream on the interface named in the request.
    pub fn add_talker(&self, request: &TalkerRequest) -> Result<Admission, AdmissionError> {
        let context = self.context_for(&request.interface)?;
        context.add_talker(
            &request.stream,
            &request.spec,
            request.txmax_ns,
            request.basetime_ns,
        )
    }

    /// Looks up the context for an interface, creating it on first use.
    fn context_for(&self, interface: &str) -> Result<Arc<InterfaceContext>, AdmissionError> {
        if let Some(context) = self.contexts.lock().unwrap().get(interface) {
            return Ok(context.clone());
        }

        // Built outside the registry lock; the lock is only for
        // lookup/insertion. A racing creation loses to whichever insert
        // lands first, preserving one context per interface.
        let built = Arc::new(self.build_context(interface)?);
        let mut contexts = self.contexts.lock().unwrap();
        Ok(contexts
            .entry(interface.to_string())
            .or_insert(built)
            .clone())
    }

    fn build_context(&self, interface: &str) -> Result<InterfaceContext, AdmissionError> {
        let driver = self.netdev.driver(interface).map_err(|_| {
            AdmissionError::UnknownDevice {
                interface: interface.to_string(),
                driver: String::new(),
            }
        })?;
        let profile = self
            .devices
            .lookup(&driver)
            .ok_or_else(|| AdmissionError::UnknownDevice {
                interface: interface.to_string(),
                driver: driver.clone(),
            })?
            .clone();
        let link_bps = self.netdev.link_speed_bps(interface).map_err(|e| {
            AdmissionError::invalid(format!("cannot read link speed of {}: {}", interface, e))
        })?;
        log::info!(
            "interface {}: driver {} ({}), {} tx queues, {} bps",
            interface,
            driver,
            profile.model,
            profile.num_tx_queues,
            link_bps
        );
        Ok(InterfaceContext::new(
            Interface {
                name: interface.to_string(),
                profile,
                link_bps,
            },
            self.netdev.clone(),
            self.backend.clone(),
        ))
    }
}
