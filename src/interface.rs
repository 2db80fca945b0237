//! Per-interface admission pipeline.
//!
//! An [`InterfaceContext`] owns everything one interface accumulates across
//! admissions: the resource mapping, the scheduler, the admission records
//! and the bookkeeping about what has already been configured on the system
//! (installed schedule, created VLAN links, EEE and feature toggles). All of
//! it lives behind one mutex, held from validation right through the system
//! configuration, so admissions on the same interface are strictly
//! serialised while different interfaces proceed in parallel.
//!
//! The pipeline is tentative-then-commit: mapping and scheduler produce new
//! values without touching the committed state, the effector applies the
//! rendered actions, and only a fully applied transaction is committed. Any
//! failure leaves the context byte-identical to before the call.

use serde::Serialize;

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::AdmissionError;
use crate::device::{DeviceProfile, NetDevInfo};
use crate::effector::{Action, Effector, EffectorError, SystemBackend, TaprioSpec, vlan_name};
use crate::mapping::Mapping;
use crate::scheduler::{AdmittedStream, Scheduler};
use crate::stream::{StreamConfig, Traffic, TrafficSpec};

/// A kernel network interface bound to its device profile.
#[derive(Debug, Clone, Serialize)]
pub struct Interface {
    /// Kernel interface name
    pub name: String,
    /// Capabilities of the NIC behind it
    pub profile: DeviceProfile,
    /// Link speed in bits per second, read when the context was created
    pub link_bps: u64,
}

/// What a successful admission hands back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    /// VLAN sub-interface to transmit on, e.g. `eth0.3`
    pub vlan_interface: String,
    /// Socket priority selecting the stream's gated queue
    pub socket_priority: u8,
}

/// One admitted stream with the resources bound to it.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionRecord {
    pub traffic: Traffic,
    pub tc: u8,
    pub socket_priority: u8,
}

#[derive(Debug)]
struct ContextState {
    mapping: Mapping,
    scheduler: Scheduler,
    admissions: Vec<AdmissionRecord>,
    /// Spec of the schedule currently installed on the interface
    applied_taprio: Option<TaprioSpec>,
    /// VLAN ids this context has created links for
    vlans: Vec<u16>,
    eee_disabled: bool,
    features_applied: bool,
    /// Set after a failed rollback; admissions fail fast from then on
    degraded: bool,
}

/// Per-interface façade composing mapping, scheduler and effector.
pub struct InterfaceContext {
    interface: Interface,
    netdev: Arc<dyn NetDevInfo>,
    backend: Arc<dyn SystemBackend>,
    state: Mutex<ContextState>,
}

impl InterfaceContext {
    pub fn new(
        interface: Interface,
        netdev: Arc<dyn NetDevInfo>,
        backend: Arc<dyn SystemBackend>,
    ) -> Self {
        let mapping = Mapping::new(interface.profile.num_tx_queues);
        InterfaceContext {
            interface,
            netdev,
            backend,
            state: Mutex::new(ContextState {
                mapping,
                scheduler: Scheduler::new(),
                admissions: Vec::new(),
                applied_taprio: None,
                vlans: Vec::new(),
                eee_disabled: false,
                features_applied: false,
                degraded: false,
            }),
        }
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    /// Number of streams admitted so far.
    pub fn admitted(&self) -> usize {
        self.state.lock().unwrap().admissions.len()
    }

    /// Admits a scheduled talker stream.
    ///
    /// Validates the request, tentatively allocates resources and merges the
    /// schedule, applies the resulting system configuration through the
    /// effector and commits only on full success. `txmax_ns` is checked for
    /// consistency when non-zero; `basetime_ns` overrides the computed
    /// schedule start when non-zero.
    pub fn add_talker(
        &self,
        stream: &StreamConfig,
        spec: &TrafficSpec,
        txmax_ns: u64,
        basetime_ns: u64,
    ) -> Result<Admission, AdmissionError> {
        let duration_ns = self.validate(stream, spec, txmax_ns)?;

        // The interface lock: everything below, including the effector
        // transaction, runs serialised per interface.
        let mut state = self.state.lock().unwrap();
        if state.degraded {
            return Err(AdmissionError::InterfaceDegraded {
                interface: self.interface.name.clone(),
            });
        }

        // Tentative allocation; committed state stays untouched until the
        // system configuration is fully applied.
        let (mapping, allocation) = state.mapping.assign(stream.pcp)?;
        let (scheduler, schedule) = state.scheduler.with_stream(AdmittedStream {
            tc: allocation.tc,
            interval_ns: spec.interval_ns,
            txoffset_ns: stream.txoffset_ns,
            duration_ns,
        })?;

        let base_time_ns = if basetime_ns != 0 {
            basetime_ns
        } else {
            schedule.base_time_from(now_ns())
        };
        let taprio = TaprioSpec {
            num_tc: mapping.num_tc(),
            prio_to_tc: mapping.prio_to_tc(),
            queues: mapping.queues(),
            base_time_ns,
            entries: schedule.entries.clone(),
        };

        let (effector, adds_eee, adds_features, adds_vlan) =
            self.render_actions(&state, &mapping, &taprio, stream.vid);

        log::info!(
            "admitting stream on {}: vid {} pcp {} offset {} ns interval {} ns -> tc {} queue {} prio {}",
            self.interface.name,
            stream.vid,
            stream.pcp,
            stream.txoffset_ns,
            spec.interval_ns,
            allocation.tc,
            allocation.queue,
            allocation.socket_priority,
        );

        match effector.apply(self.backend.as_ref()) {
            Ok(()) => {}
            Err(EffectorError::Failed { action, error }) => {
                return Err(AdmissionError::EffectorFailed {
                    action,
                    error: error.to_string(),
                });
            }
            Err(EffectorError::Inconsistent { undo, error, .. }) => {
                state.degraded = true;
                log::error!(
                    "interface {} degraded: rollback step '{}' failed: {}",
                    self.interface.name,
                    undo,
                    error
                );
                return Err(AdmissionError::SystemInconsistent {
                    action: undo,
                    error: error.to_string(),
                });
            }
        }

        // Commit.
        state.mapping = mapping;
        state.scheduler = scheduler;
        state.applied_taprio = Some(taprio);
        state.eee_disabled |= adds_eee;
        state.features_applied |= adds_features;
        if adds_vlan {
            state.vlans.push(stream.vid);
        }
        state.admissions.push(AdmissionRecord {
            traffic: Traffic::scheduled(*stream, *spec),
            tc: allocation.tc,
            socket_priority: allocation.socket_priority,
        });

        let admission = Admission {
            vlan_interface: vlan_name(&self.interface.name, stream.vid),
            socket_priority: allocation.socket_priority,
        };
        log::info!(
            "admitted stream on {} as ({}, prio {})",
            self.interface.name,
            admission.vlan_interface,
            admission.socket_priority
        );
        Ok(admission)
    }

    /// Step-1 validation. Returns the stream's transmission duration.
    fn validate(
        &self,
        stream: &StreamConfig,
        spec: &TrafficSpec,
        txmax_ns: u64,
    ) -> Result<u64, AdmissionError> {
        let operstate = self
            .netdev
            .operstate(&self.interface.name)
            .map_err(|e| AdmissionError::invalid(format!("cannot query interface state: {}", e)))?;
        if operstate != "up" {
            return Err(AdmissionError::invalid(format!(
                "interface {} is {}, not up",
                self.interface.name, operstate
            )));
        }
        if spec.interval_ns == 0 {
            return Err(AdmissionError::invalid("interval must be positive"));
        }
        if stream.txoffset_ns >= spec.interval_ns {
            return Err(AdmissionError::invalid(format!(
                "txoffset {} ns must be less than the interval {} ns",
                stream.txoffset_ns, spec.interval_ns
            )));
        }
        if stream.pcp > 7 {
            return Err(AdmissionError::invalid(format!(
                "pcp {} out of range 0-7",
                stream.pcp
            )));
        }
        if stream.vid == 0 || stream.vid > 4094 {
            return Err(AdmissionError::invalid(format!(
                "vid {} out of range 1-4094",
                stream.vid
            )));
        }
        let profile = &self.interface.profile;
        if !profile.supports_frame_size(spec.size_bytes) {
            return Err(AdmissionError::invalid(format!(
                "frame size {} B exceeds the {} B device limit",
                spec.size_bytes, profile.max_frame_bytes
            )));
        }
        if !profile.supports_interval(spec.interval_ns) {
            return Err(AdmissionError::invalid(format!(
                "interval {} ns outside device limits {}-{} ns",
                spec.interval_ns, profile.min_interval_ns, profile.max_interval_ns
            )));
        }
        let duration_ns = spec.duration_ns(self.interface.link_bps);
        if duration_ns > spec.interval_ns {
            return Err(AdmissionError::invalid(format!(
                "transmission takes {} ns, longer than the {} ns interval",
                duration_ns, spec.interval_ns
            )));
        }
        if stream.txoffset_ns + duration_ns > spec.interval_ns {
            return Err(AdmissionError::invalid(format!(
                "transmission of {} ns starting at offset {} ns spills past the interval",
                duration_ns, stream.txoffset_ns
            )));
        }
        // txmin is authoritative; a txmax that disagrees with it is refused
        if txmax_ns != 0 && txmax_ns != stream.txoffset_ns + duration_ns {
            return Err(AdmissionError::invalid(format!(
                "txmax {} ns does not match txmin {} ns plus duration {} ns",
                txmax_ns, stream.txoffset_ns, duration_ns
            )));
        }
        Ok(duration_ns)
    }

    /// Renders the ordered action list for this admission. Returns the
    /// effector and which one-time actions it contains, so the caller can
    /// update the bookkeeping on commit.
    fn render_actions(
        &self,
        state: &ContextState,
        mapping: &Mapping,
        taprio: &TaprioSpec,
        vid: u16,
    ) -> (Effector, bool, bool, bool) {
        let name = &self.interface.name;
        let profile = &self.interface.profile;
        let mut effector = Effector::new();

        let adds_eee = profile.disable_eee && !state.eee_disabled;
        if adds_eee {
            effector.push(Action::DisableEee {
                interface: name.clone(),
            });
        }

        effector.push(Action::ReplaceQdisc {
            interface: name.clone(),
            spec: taprio.clone(),
            prior: state.applied_taprio.clone(),
        });

        let adds_vlan = !state.vlans.contains(&vid);
        if adds_vlan {
            effector.push(Action::AddVlan {
                interface: name.clone(),
                vid,
                egress: mapping.egress_qos_map(),
            });
        }

        let adds_features = !profile.features.is_empty() && !state.features_applied;
        if adds_features {
            for (feature, value) in &profile.features {
                effector.push(Action::SetFeature {
                    interface: name.clone(),
                    feature: feature.clone(),
                    value: value.clone(),
                });
            }
        }

        (effector, adds_eee, adds_features, adds_vlan)
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
