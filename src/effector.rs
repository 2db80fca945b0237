//! Transactional application of system configuration.
//!
//! An [`Effector`] is an ordered list of [`Action`]s, each a declarative,
//! reversible kernel-state change. Applying the list walks it front to back;
//! the first failure triggers an undo of the already-applied prefix in
//! reverse order. Undo data is snapshotted from the live system immediately
//! before each change, never assumed.
//!
//! The actions themselves never shell out. They are interpreted against a
//! [`SystemBackend`], which carries the primitive operations: the production
//! [`ShellBackend`] drives `ethtool`, `tc` and `ip`, while [`MockBackend`]
//! keeps an in-memory model of the kernel state for the test suite (and for
//! development hosts without a TSN NIC).

use serde::Serialize;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::process::Command;
use std::sync::Mutex;

use crate::scheduler::GateEntry;

/// The taprio qdisc configuration realising one merged schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaprioSpec {
    /// Number of traffic classes
    pub num_tc: u8,
    /// 16-entry socket-priority to traffic-class map
    pub prio_to_tc: [u8; 16],
    /// Per-class `(count, offset)` queue ranges, in class order
    pub queues: Vec<(u8, u8)>,
    /// Absolute schedule start in nanoseconds
    pub base_time_ns: u64,
    /// Gate-control list
    pub entries: Vec<GateEntry>,
}

impl TaprioSpec {
    /// The `tc qdisc ... taprio` argument list after the qdisc name.
    pub fn qdisc_args(&self) -> Vec<String> {
        let mut args = vec!["num_tc".to_string(), self.num_tc.to_string(), "map".to_string()];
        args.extend(self.prio_to_tc.iter().map(|tc| tc.to_string()));
        args.push("queues".to_string());
        args.extend(
            self.queues
                .iter()
                .map(|(count, offset)| format!("{}@{}", count, offset)),
        );
        args.push("base-time".to_string());
        args.push(self.base_time_ns.to_string());
        for entry in &self.entries {
            args.push("sched-entry".to_string());
            args.push("S".to_string());
            args.push(format!("{:02x}", entry.gate_mask));
            args.push(entry.duration_ns.to_string());
        }
        args.push("flags".to_string());
        args.push("0x2".to_string());
        args
    }
}

/// Name of the 802.1Q sub-interface created for a stream.
pub fn vlan_name(interface: &str, vid: u16) -> String {
    format!("{}.{}", interface, vid)
}

/// A single reversible system change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Action {
    /// Switch Energy-Efficient Ethernet off; undo restores the state read
    /// at apply time.
    DisableEee { interface: String },

    /// Set a device feature; undo restores the value read at apply time.
    SetFeature {
        interface: String,
        feature: String,
        value: String,
    },

    /// Install the taprio root qdisc. `prior` is the spec committed by the
    /// previous admission, if any; undo re-applies it, or deletes the root
    /// qdisc when this is the first schedule on the interface.
    ReplaceQdisc {
        interface: String,
        spec: TaprioSpec,
        prior: Option<TaprioSpec>,
    },

    /// Create the VLAN sub-interface with its egress priority-to-PCP map;
    /// undo deletes the link.
    AddVlan {
        interface: String,
        vid: u16,
        egress: Vec<(u8, u8)>,
    },
}

impl Action {
    fn describe(&self) -> String {
        match self {
            Action::DisableEee { interface } => format!("disable eee on {}", interface),
            Action::SetFeature {
                interface,
                feature,
                value,
            } => format!("set feature {}={} on {}", feature, value, interface),
            Action::ReplaceQdisc { interface, .. } => {
                format!("replace root qdisc on {}", interface)
            }
            Action::AddVlan { interface, vid, .. } => {
                format!("add vlan link {}", vlan_name(interface, *vid))
            }
        }
    }
}

/// Captured state needed to reverse one applied action.
#[derive(Debug, Clone)]
enum Undo {
    RestoreEee { interface: String, enabled: bool },
    RestoreFeature {
        interface: String,
        feature: String,
        value: String,
    },
    RestoreQdisc {
        interface: String,
        prior: Option<TaprioSpec>,
    },
    DeleteVlan { interface: String, vid: u16 },
}

impl Undo {
    fn describe(&self) -> String {
        match self {
            Undo::RestoreEee { interface, enabled } => {
                format!("restore eee={} on {}", enabled, interface)
            }
            Undo::RestoreFeature {
                interface,
                feature,
                value,
            } => format!("restore feature {}={} on {}", feature, value, interface),
            Undo::RestoreQdisc { interface, prior } => match prior {
                Some(_) => format!("restore previous qdisc on {}", interface),
                None => format!("delete root qdisc on {}", interface),
            },
            Undo::DeleteVlan { interface, vid } => {
                format!("delete vlan link {}", vlan_name(interface, *vid))
            }
        }
    }
}

/// A primitive backend operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The command ran and reported failure.
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
    /// The command could not be spawned or awaited.
    Io { command: String, error: String },
    /// Command output did not contain what was expected.
    Parse { command: String, detail: String },
    /// Failure injected by the test backend.
    Injected { operation: String },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Command {
                command,
                status,
                stderr,
            } => {
                write!(f, "'{}' exited with {}: {}", command, status, stderr.trim())
            }
            BackendError::Io { command, error } => {
                write!(f, "'{}' could not run: {}", command, error)
            }
            BackendError::Parse { command, detail } => {
                write!(f, "unexpected output from '{}': {}", command, detail)
            }
            BackendError::Injected { operation } => {
                write!(f, "injected failure in {}", operation)
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Outcome of applying an action list.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectorError {
    /// An action failed; the applied prefix was undone and the system is
    /// back in its pre-call state.
    Failed { action: String, error: BackendError },

    /// An action failed *and* one of the undo steps failed as well. The
    /// system state is unknown; the caller must not commit and should
    /// quarantine the interface.
    Inconsistent {
        action: String,
        undo: String,
        error: BackendError,
    },
}

impl fmt::Display for EffectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectorError::Failed { action, error } => {
                write!(f, "{} failed ({}); rolled back", action, error)
            }
            EffectorError::Inconsistent {
                action,
                undo,
                error,
            } => {
                write!(
                    f,
                    "{} failed and rollback step '{}' failed too: {}",
                    action, undo, error
                )
            }
        }
    }
}

impl std::error::Error for EffectorError {}

/// Primitive kernel operations the actions are interpreted against.
///
/// Read operations exist so the effector can snapshot prior state before a
/// change; undo always uses the snapshot.
pub trait SystemBackend: Send + Sync {
    fn read_eee(&self, interface: &str) -> Result<bool, BackendError>;
    fn set_eee(&self, interface: &str, enabled: bool) -> Result<(), BackendError>;
    fn read_feature(&self, interface: &str, feature: &str) -> Result<String, BackendError>;
    fn set_feature(
        &self,
        interface: &str,
        feature: &str,
        value: &str,
    ) -> Result<(), BackendError>;
    fn replace_qdisc(&self, interface: &str, spec: &TaprioSpec) -> Result<(), BackendError>;
    fn delete_qdisc(&self, interface: &str) -> Result<(), BackendError>;
    fn add_vlan(
        &self,
        interface: &str,
        vid: u16,
        egress: &[(u8, u8)],
    ) -> Result<(), BackendError>;
    fn delete_vlan(&self, interface: &str, vid: u16) -> Result<(), BackendError>;
}

/// An ordered list of reversible actions applied as one transaction.
///
/// # Examples
///
/// ```rust
/// use detd::{Action, Effector, MockBackend};
///
/// let backend = MockBackend::new();
/// let mut effector = Effector::new();
/// effector.push(Action::DisableEee { interface: "eth0".into() });
/// effector.apply(&backend).unwrap();
/// assert!(!backend.eee_enabled("eth0"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Effector {
    actions: Vec<Action>,
}

impl Effector {
    pub fn new() -> Self {
        Effector::default()
    }

    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Applies the actions in order.
    ///
    /// On the first failure the already-applied prefix is undone in reverse
    /// order using the snapshots taken at apply time. A clean rollback
    /// reports [`EffectorError::Failed`]; a rollback that itself fails
    /// reports [`EffectorError::Inconsistent`].
    pub fn apply(&self, backend: &dyn SystemBackend) -> Result<(), EffectorError> {
        let mut applied: Vec<Undo> = Vec::new();
        for action in &self.actions {
            match apply_one(backend, action) {
                Ok(undo) => {
                    log::info!("applied: {}", action.describe());
                    applied.push(undo);
                }
                Err(error) => {
                    log::warn!(
                        "{} failed ({}); rolling back {} applied action(s)",
                        action.describe(),
                        error,
                        applied.len()
                    );
                    if let Err((undo, undo_error)) = rollback(backend, &applied) {
                        log::error!(
                            "rollback step '{}' failed: {}; system state is inconsistent",
                            undo,
                            undo_error
                        );
                        return Err(EffectorError::Inconsistent {
                            action: action.describe(),
                            undo,
                            error: undo_error,
                        });
                    }
                    return Err(EffectorError::Failed {
                        action: action.describe(),
                        error,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Snapshots prior state, performs the change, returns the undo record.
fn apply_one(backend: &dyn SystemBackend, action: &Action) -> Result<Undo, BackendError> {
    match action {
        Action::DisableEee { interface } => {
            let enabled = backend.read_eee(interface)?;
            backend.set_eee(interface, false)?;
            Ok(Undo::RestoreEee {
                interface: interface.clone(),
                enabled,
            })
        }
        Action::SetFeature {
            interface,
            feature,
            value,
        } => {
            let prior = backend.read_feature(interface, feature)?;
            backend.set_feature(interface, feature, value)?;
            Ok(Undo::RestoreFeature {
                interface: interface.clone(),
                feature: feature.clone(),
                value: prior,
            })
        }
        Action::ReplaceQdisc {
            interface,
            spec,
            prior,
        } => {
            backend.replace_qdisc(interface, spec)?;
            Ok(Undo::RestoreQdisc {
                interface: interface.clone(),
                prior: prior.clone(),
            })
        }
        Action::AddVlan {
            interface,
            vid,
            egress,
        } => {
            backend.add_vlan(interface, *vid, egress)?;
            Ok(Undo::DeleteVlan {
                interface: interface.clone(),
                vid: *vid,
            })
        }
    }
}

/// Undoes applied actions in reverse order; stops at the first failure.
fn rollback(
    backend: &dyn SystemBackend,
    applied: &[Undo],
) -> Result<(), (String, BackendError)> {
    for undo in applied.iter().rev() {
        let result = match undo {
            Undo::RestoreEee { interface, enabled } => backend.set_eee(interface, *enabled),
            Undo::RestoreFeature {
                interface,
                feature,
                value,
            } => backend.set_feature(interface, feature, value),
            Undo::RestoreQdisc { interface, prior } => match prior {
                Some(spec) => backend.replace_qdisc(interface, spec),
                None => backend.delete_qdisc(interface),
            },
            Undo::DeleteVlan { interface, vid } => backend.delete_vlan(interface, *vid),
        };
        if let Err(error) = result {
            return Err((undo.describe(), error));
        }
        log::info!("rolled back: {}", undo.describe());
    }
    Ok(())
}

/// Backend driving the real toolchain: `ethtool`, `tc` and `ip`.
#[derive(Debug, Clone, Default)]
pub struct ShellBackend;

impl ShellBackend {
    pub fn new() -> Self {
        ShellBackend
    }

    fn run(&self, program: &str, args: &[String]) -> Result<String, BackendError> {
        let command = format!("{} {}", program, args.join(" "));
        log::debug!("run: {}", command);
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| BackendError::Io {
                command: command.clone(),
                error: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(BackendError::Command {
                command,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn strs(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl SystemBackend for ShellBackend {
    fn read_eee(&self, interface: &str) -> Result<bool, BackendError> {
        let command = format!("ethtool --show-eee {}", interface);
        let stdout = self.run("ethtool", &strs(&["--show-eee", interface]))?;
        for line in stdout.lines() {
            if let Some(value) = line.trim().strip_prefix("EEE status:") {
                return Ok(value.contains("enabled"));
            }
        }
        Err(BackendError::Parse {
            command,
            detail: "no 'EEE status:' line".to_string(),
        })
    }

    fn set_eee(&self, interface: &str, enabled: bool) -> Result<(), BackendError> {
        let value = if enabled { "on" } else { "off" };
        self.run("ethtool", &strs(&["--set-eee", interface, "eee", value]))?;
        Ok(())
    }

    fn read_feature(&self, interface: &str, feature: &str) -> Result<String, BackendError> {
        let command = format!("ethtool --show-features {}", interface);
        let stdout = self.run("ethtool", &strs(&["--show-features", interface]))?;
        for line in stdout.lines() {
            if let Some(value) = line.trim().strip_prefix(&format!("{}:", feature)) {
                // Values read "on", "off" or "off [fixed]"
                if let Some(word) = value.split_whitespace().next() {
                    return Ok(word.to_string());
                }
            }
        }
        Err(BackendError::Parse {
            command,
            detail: format!("feature {} not listed", feature),
        })
    }

    fn set_feature(
        &self,
        interface: &str,
        feature: &str,
        value: &str,
    ) -> Result<(), BackendError> {
        self.run("ethtool", &strs(&["--features", interface, feature, value]))?;
        Ok(())
    }

    fn replace_qdisc(&self, interface: &str, spec: &TaprioSpec) -> Result<(), BackendError> {
        let mut args = strs(&[
            "qdisc", "replace", "dev", interface, "parent", "root", "handle", "100", "taprio",
        ]);
        args.extend(spec.qdisc_args());
        self.run("tc", &args)?;
        Ok(())
    }

    fn delete_qdisc(&self, interface: &str) -> Result<(), BackendError> {
        self.run("tc", &strs(&["qdisc", "del", "dev", interface, "parent", "root"]))?;
        Ok(())
    }

    fn add_vlan(
        &self,
        interface: &str,
        vid: u16,
        egress: &[(u8, u8)],
    ) -> Result<(), BackendError> {
        let name = vlan_name(interface, vid);
        let vid_text = vid.to_string();
        let mut args = strs(&[
            "link", "add", "link", interface, "name", &name, "type", "vlan", "protocol",
            "802.1Q", "id", &vid_text, "egress-qos-map",
        ]);
        args.extend(egress.iter().map(|(prio, pcp)| format!("{}:{}", prio, pcp)));
        self.run("ip", &args)?;
        self.run("ip", &strs(&["link", "set", "dev", &name, "up"]))?;
        Ok(())
    }

    fn delete_vlan(&self, interface: &str, vid: u16) -> Result<(), BackendError> {
        let name = vlan_name(interface, vid);
        self.run("ip", &strs(&["link", "del", "dev", &name]))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// EEE state per interface; absent means enabled
    eee: HashMap<String, bool>,
    /// Feature values per `(interface, feature)`; absent means "off"
    features: HashMap<(String, String), String>,
    /// Installed taprio spec per interface; absent means pfifo_fast
    qdisc: HashMap<String, TaprioSpec>,
    /// Existing VLAN links with their egress maps
    vlans: HashMap<(String, u16), Vec<(u8, u8)>>,
    /// Successful operations in call order
    journal: Vec<String>,
    /// Operations forced to fail
    fail_on: HashSet<String>,
}

/// In-memory [`SystemBackend`] modelling the kernel state.
///
/// Used by the test suite and on development hosts; failures can be injected
/// per operation to exercise rollback paths.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend::default()
    }

    /// Makes every future call of `operation` fail until cleared.
    ///
    /// Operation names are the [`SystemBackend`] method names, e.g.
    /// `"add_vlan"` or `"delete_qdisc"`.
    pub fn fail_on(&self, operation: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_on
            .insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_on.clear();
    }

    /// Successful operations in call order.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().unwrap().journal.clone()
    }

    /// The installed taprio spec, `None` while pfifo_fast is in place.
    pub fn qdisc(&self, interface: &str) -> Option<TaprioSpec> {
        self.state.lock().unwrap().qdisc.get(interface).cloned()
    }

    pub fn has_vlan(&self, interface: &str, vid: u16) -> bool {
        self.state
            .lock()
            .unwrap()
            .vlans
            .contains_key(&(interface.to_string(), vid))
    }

    pub fn vlan_egress(&self, interface: &str, vid: u16) -> Option<Vec<(u8, u8)>> {
        self.state
            .lock()
            .unwrap()
            .vlans
            .get(&(interface.to_string(), vid))
            .cloned()
    }

    pub fn eee_enabled(&self, interface: &str) -> bool {
        *self
            .state
            .lock()
            .unwrap()
            .eee
            .get(interface)
            .unwrap_or(&true)
    }

    pub fn feature(&self, interface: &str, feature: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .features
            .get(&(interface.to_string(), feature.to_string()))
            .cloned()
            .unwrap_or_else(|| "off".to_string())
    }

    fn check(&self, state: &MockState, operation: &str) -> Result<(), BackendError> {
        if state.fail_on.contains(operation) {
            return Err(BackendError::Injected {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}

impl SystemBackend for MockBackend {
    fn read_eee(&self, interface: &str) -> Result<bool, BackendError> {
        let state = self.state.lock().unwrap();
        self.check(&state, "read_eee")?;
        Ok(*state.eee.get(interface).unwrap_or(&true))
    }

    fn set_eee(&self, interface: &str, enabled: bool) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state, "set_eee")?;
        state.eee.insert(interface.to_string(), enabled);
        state
            .journal
            .push(format!("set_eee {} {}", interface, if enabled { "on" } else { "off" }));
        Ok(())
    }

    fn read_feature(&self, interface: &str, feature: &str) -> Result<String, BackendError> {
        let state = self.state.lock().unwrap();
        self.check(&state, "read_feature")?;
        Ok(state
            .features
            .get(&(interface.to_string(), feature.to_string()))
            .cloned()
            .unwrap_or_else(|| "off".to_string()))
    }

    fn set_feature(
        &self,
        interface: &str,
        feature: &str,
        value: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state, "set_feature")?;
        state
            .features
            .insert((interface.to_string(), feature.to_string()), value.to_string());
        state
            .journal
            .push(format!("set_feature {} {} {}", interface, feature, value));
        Ok(())
    }

    fn replace_qdisc(&self, interface: &str, spec: &TaprioSpec) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state, "replace_qdisc")?;
        state.qdisc.insert(interface.to_string(), spec.clone());
        state
            .journal
            .push(format!("replace_qdisc {} num_tc {}", interface, spec.num_tc));
        Ok(())
    }

    fn delete_qdisc(&self, interface: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state, "delete_qdisc")?;
        if state.qdisc.remove(interface).is_none() {
            return Err(BackendError::Command {
                command: format!("tc qdisc del dev {} parent root", interface),
                status: 2,
                stderr: "Error: Cannot delete qdisc with handle of zero.".to_string(),
            });
        }
        state.journal.push(format!("delete_qdisc {}", interface));
        Ok(())
    }

    fn add_vlan(
        &self,
        interface: &str,
        vid: u16,
        egress: &[(u8, u8)],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state, "add_vlan")?;
        let key = (interface.to_string(), vid);
        if state.vlans.contains_key(&key) {
            return Err(BackendError::Command {
                command: format!("ip link add link {} name {}", interface, vlan_name(interface, vid)),
                status: 2,
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        state.vlans.insert(key, egress.to_vec());
        state
            .journal
            .push(format!("add_vlan {}", vlan_name(interface, vid)));
        Ok(())
    }

    fn delete_vlan(&self, interface: &str, vid: u16) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        self.check(&state, "delete_vlan")?;
        if state.vlans.remove(&(interface.to_string(), vid)).is_none() {
            return Err(BackendError::Command {
                command: format!("ip link del dev {}", vlan_name(interface, vid)),
                status: 1,
                stderr: "Cannot find device".to_string(),
            });
        }
        state
            .journal
            .push(format!("delete_vlan {}", vlan_name(interface, vid)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(base_time_ns: u64) -> TaprioSpec {
        let mut prio_to_tc = [0u8; 16];
        prio_to_tc[7] = 1;
        TaprioSpec {
            num_tc: 2,
            prio_to_tc,
            queues: vec![(1, 0), (1, 7)],
            base_time_ns,
            entries: vec![
                GateEntry {
                    gate_mask: 0x01,
                    duration_ns: 250_000,
                },
                GateEntry {
                    gate_mask: 0x02,
                    duration_ns: 12_176,
                },
                GateEntry {
                    gate_mask: 0x01,
                    duration_ns: 1_737_824,
                },
            ],
        }
    }

    fn admission_actions(backend_vid: u16, prior: Option<TaprioSpec>) -> Effector {
        let mut effector = Effector::new();
        effector.push(Action::DisableEee {
            interface: "eth0".to_string(),
        });
        effector.push(Action::ReplaceQdisc {
            interface: "eth0".to_string(),
            spec: spec(4_000_000),
            prior,
        });
        effector.push(Action::AddVlan {
            interface: "eth0".to_string(),
            vid: backend_vid,
            egress: vec![(7, 6)],
        });
        effector
    }

    #[test]
    fn renders_qdisc_arguments_in_tc_order() {
        let args = spec(4_000_000).qdisc_args().join(" ");
        assert_eq!(
            args,
            "num_tc 2 map 0 0 0 0 0 0 0 1 0 0 0 0 0 0 0 0 queues 1@0 1@7 \
             base-time 4000000 sched-entry S 01 250000 sched-entry S 02 12176 \
             sched-entry S 01 1737824 flags 0x2"
        );
    }

    #[test]
    fn applies_actions_in_order() {
        let backend = MockBackend::new();
        admission_actions(3, None).apply(&backend).unwrap();

        assert!(!backend.eee_enabled("eth0"));
        assert_eq!(backend.qdisc("eth0").unwrap().num_tc, 2);
        assert_eq!(backend.vlan_egress("eth0", 3).unwrap(), vec![(7, 6)]);
        assert_eq!(
            backend.journal(),
            vec![
                "set_eee eth0 off",
                "replace_qdisc eth0 num_tc 2",
                "add_vlan eth0.3",
            ]
        );
    }

    #[test]
    fn failure_rolls_back_applied_prefix_in_reverse() {
        let backend = MockBackend::new();
        backend.fail_on("add_vlan");
        let err = admission_actions(3, None).apply(&backend).unwrap_err();

        assert!(matches!(err, EffectorError::Failed { .. }));
        // Pre-call state: EEE enabled, pfifo_fast root, no VLAN link
        assert!(backend.eee_enabled("eth0"));
        assert_eq!(backend.qdisc("eth0"), None);
        assert!(!backend.has_vlan("eth0", 3));
        assert_eq!(
            backend.journal(),
            vec![
                "set_eee eth0 off",
                "replace_qdisc eth0 num_tc 2",
                "delete_qdisc eth0",
                "set_eee eth0 on",
            ]
        );
    }

    #[test]
    fn rollback_restores_previously_committed_qdisc() {
        let backend = MockBackend::new();
        let committed = spec(1_000_000);
        admission_actions(3, None).apply(&backend).unwrap();
        backend.fail_on("add_vlan");

        let mut second = Effector::new();
        second.push(Action::ReplaceQdisc {
            interface: "eth0".to_string(),
            spec: committed.clone(),
            prior: backend.qdisc("eth0"),
        });
        second.push(Action::AddVlan {
            interface: "eth0".to_string(),
            vid: 5,
            egress: vec![(8, 5)],
        });
        assert!(second.apply(&backend).is_err());

        // First admission's schedule is back in place, its VLAN untouched
        assert_eq!(backend.qdisc("eth0"), Some(spec(4_000_000)));
        assert!(backend.has_vlan("eth0", 3));
        assert!(!backend.has_vlan("eth0", 5));
    }

    #[test]
    fn feature_undo_restores_snapshotted_value() {
        let backend = MockBackend::new();
        backend
            .set_feature("eth0", "hw-tc-offload", "off")
            .unwrap();
        backend.fail_on("add_vlan");

        let mut effector = Effector::new();
        effector.push(Action::SetFeature {
            interface: "eth0".to_string(),
            feature: "hw-tc-offload".to_string(),
            value: "on".to_string(),
        });
        effector.push(Action::AddVlan {
            interface: "eth0".to_string(),
            vid: 3,
            egress: vec![(7, 6)],
        });
        assert!(effector.apply(&backend).is_err());
        assert_eq!(backend.feature("eth0", "hw-tc-offload"), "off");
    }

    #[test]
    fn failed_undo_reports_inconsistent_state() {
        let backend = MockBackend::new();
        backend.fail_on("add_vlan");
        backend.fail_on("delete_qdisc");
        let err = admission_actions(3, None).apply(&backend).unwrap_err();
        match err {
            EffectorError::Inconsistent { action, undo, .. } => {
                assert_eq!(action, "add vlan link eth0.3");
                assert_eq!(undo, "delete root qdisc on eth0");
            }
            other => panic!("expected inconsistent state, got {:?}", other),
        }
    }

    #[test]
    fn snapshot_failure_rolls_back_like_an_action_failure() {
        let backend = MockBackend::new();
        backend.fail_on("read_eee");
        let mut effector = Effector::new();
        effector.push(Action::AddVlan {
            interface: "eth0".to_string(),
            vid: 3,
            egress: vec![(7, 6)],
        });
        effector.push(Action::DisableEee {
            interface: "eth0".to_string(),
        });
        assert!(matches!(
            effector.apply(&backend),
            Err(EffectorError::Failed { .. })
        ));
        assert!(!backend.has_vlan("eth0", 3));
    }

    #[test]
    fn duplicate_vlan_link_is_refused_by_the_backend() {
        let backend = MockBackend::new();
        backend.add_vlan("eth0", 3, &[(7, 6)]).unwrap();
        let err = backend.add_vlan("eth0", 3, &[(7, 6)]).unwrap_err();
        assert!(matches!(err, BackendError::Command { status: 2, .. }));
    }
}
