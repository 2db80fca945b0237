//! Device profiles and the driver-keyed registry.
//!
//! A [`DeviceProfile`] captures what a NIC can do for scheduled traffic: how
//! many Tx queues it exposes, which cycle intervals its gate hardware
//! accepts, whether Energy-Efficient Ethernet must be switched off to keep
//! latency bounded, and which device features have to be toggled before the
//! offloaded schedule works. Profiles are looked up by the kernel driver
//! backing an interface, so adding hardware support means registering one
//! more record, not subclassing anything.
//!
//! Link facts that live in the kernel rather than in the catalogue (driver
//! name, operational state, link speed) are read through [`NetDevInfo`];
//! [`SysfsNetDevInfo`] is the production implementation on top of
//! `/sys/class/net`.

use serde::Serialize;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

/// Per-device constants consulted during admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    /// Human-readable device name
    pub model: String,
    /// Kernel driver this profile is registered under
    pub driver: String,
    /// Number of hardware Tx queues
    pub num_tx_queues: u8,
    /// Smallest cycle interval the gate hardware accepts
    pub min_interval_ns: u64,
    /// Largest cycle interval the gate hardware accepts
    pub max_interval_ns: u64,
    /// Largest frame, headers included, the device will launch on time
    pub max_frame_bytes: u32,
    /// Whether EEE must be disabled before scheduled traffic runs
    pub disable_eee: bool,
    /// Device features toggled before the first admission, `(feature, value)`
    pub features: Vec<(String, String)>,
}

impl DeviceProfile {
    /// Whether the hardware accepts a cycle of this length.
    pub fn supports_interval(&self, interval_ns: u64) -> bool {
        (self.min_interval_ns..=self.max_interval_ns).contains(&interval_ns)
    }

    /// Whether a frame of this size fits the device limits.
    pub fn supports_frame_size(&self, size_bytes: u32) -> bool {
        size_bytes > 0 && size_bytes <= self.max_frame_bytes
    }
}

/// Registry of device profiles keyed by kernel driver id.
///
/// The default registry knows the TSN NICs the service supports out of the
/// box; embedders can [`register`](DeviceRegistry::register) additional
/// profiles before the service starts.
///
/// # Examples
///
/// ```rust
/// use detd::DeviceRegistry;
///
/// let registry = DeviceRegistry::default();
/// assert_eq!(registry.lookup("stmmac").unwrap().num_tx_queues, 8);
/// assert!(registry.lookup("e1000e").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    profiles: HashMap<String, DeviceProfile>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        let mut registry = DeviceRegistry {
            profiles: HashMap::new(),
        };
        registry.register(DeviceProfile {
            model: "Intel Elkhart Lake GbE".to_string(),
            driver: "stmmac".to_string(),
            num_tx_queues: 8,
            min_interval_ns: 1_000,
            max_interval_ns: 1_000_000_000,
            max_frame_bytes: 1522,
            disable_eee: true,
            features: vec![("hw-tc-offload".to_string(), "on".to_string())],
        });
        registry.register(DeviceProfile {
            model: "Intel i210".to_string(),
            driver: "igb".to_string(),
            num_tx_queues: 4,
            min_interval_ns: 1_000,
            max_interval_ns: 1_000_000_000,
            max_frame_bytes: 1522,
            disable_eee: true,
            features: vec![("hw-tc-offload".to_string(), "on".to_string())],
        });
        registry.register(DeviceProfile {
            model: "Intel i225/i226".to_string(),
            driver: "igc".to_string(),
            num_tx_queues: 4,
            min_interval_ns: 1_000,
            max_interval_ns: 1_000_000_000,
            max_frame_bytes: 1522,
            disable_eee: true,
            features: vec![("hw-tc-offload".to_string(), "on".to_string())],
        });
        registry
    }
}

impl DeviceRegistry {
    /// A registry with no known devices, for embedders that register their
    /// own profiles.
    pub fn empty() -> Self {
        DeviceRegistry {
            profiles: HashMap::new(),
        }
    }

    /// Registers a profile, replacing any previous one for the same driver.
    pub fn register(&mut self, profile: DeviceProfile) {
        self.profiles.insert(profile.driver.clone(), profile);
    }

    /// Looks up the profile registered for a kernel driver.
    pub fn lookup(&self, driver: &str) -> Option<&DeviceProfile> {
        self.profiles.get(driver)
    }
}

/// Kernel-side facts about a network interface.
///
/// Implementations must be cheap enough to call on every admission; the
/// operational state is re-checked each time while driver and speed are read
/// once when an interface context is created.
pub trait NetDevInfo: Send + Sync {
    /// Kernel driver bound to the interface.
    fn driver(&self, interface: &str) -> io::Result<String>;

    /// Operational state, e.g. `up` or `down`.
    fn operstate(&self, interface: &str) -> io::Result<String>;

    /// Link speed in bits per second.
    fn link_speed_bps(&self, interface: &str) -> io::Result<u64>;
}

/// [`NetDevInfo`] backed by `/sys/class/net`.
#[derive(Debug, Clone)]
pub struct SysfsNetDevInfo {
    root: PathBuf,
}

impl Default for SysfsNetDevInfo {
    fn default() -> Self {
        SysfsNetDevInfo {
            root: PathBuf::from("/sys/class/net"),
        }
    }
}

impl SysfsNetDevInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different sysfs root, for tests running against a fake tree.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        SysfsNetDevInfo { root: root.into() }
    }
}

impl NetDevInfo for SysfsNetDevInfo {
    fn driver(&self, interface: &str) -> io::Result<String> {
        let link = self.root.join(interface).join("device/driver");
        let target = std::fs::read_link(&link)?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("driver link for {} has no name", interface),
                )
            })
    }

    fn operstate(&self, interface: &str) -> io::Result<String> {
        let path = self.root.join(interface).join("operstate");
        Ok(std::fs::read_to_string(path)?.trim().to_string())
    }

    fn link_speed_bps(&self, interface: &str) -> io::Result<u64> {
        let path = self.root.join(interface).join("speed");
        let text = std::fs::read_to_string(path)?;
        let mbps: i64 = text.trim().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unparsable link speed for {}: {:?}", interface, text.trim()),
            )
        })?;
        // The kernel reports -1 while the link is down
        if mbps <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("link speed unavailable for {}", interface),
            ));
        }
        Ok(mbps as u64 * 1_000_000)
    }
}
