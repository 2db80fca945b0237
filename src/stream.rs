//! Stream and traffic descriptions for talker admissions.
//!
//! A talker request names *what* it wants to send ([`StreamConfig`]: where the
//! frames go and when inside the cycle) and *how much* ([`TrafficSpec`]: how
//! often and how large). The two are bound together with a traffic kind into
//! a [`Traffic`] once an admission is accepted.

use nom::IResult;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::combinator::{all_consuming, map_res};
use serde::Serialize;

use std::fmt;
use std::str::FromStr;

/// 48-bit IEEE 802 MAC address.
///
/// Parsed from the colon-separated form carried on the wire and displayed
/// the way the kernel prints it (lowercase hex).
///
/// # Examples
///
/// ```rust
/// use detd::MacAddr;
///
/// let mac: MacAddr = "03:C0:FF:EE:FF:AB".parse().unwrap();
/// assert_eq!(mac.to_string(), "03:c0:ff:ee:ff:ab");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The input was not a `XX:XX:XX:XX:XX:XX` MAC address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidMacAddr(pub String);

impl fmt::Display for InvalidMacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address '{}'", self.0)
    }
}

impl std::error::Error for InvalidMacAddr {}

fn hex_octet(input: &str) -> IResult<&str, u8> {
    map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |digits: &str| u8::from_str_radix(digits, 16),
    )(input)
}

fn mac_address(input: &str) -> IResult<&str, MacAddr> {
    let (mut rest, first) = hex_octet(input)?;
    let mut octets = [first, 0, 0, 0, 0, 0];
    for octet in octets.iter_mut().skip(1) {
        let (r, _) = tag(":")(rest)?;
        let (r, value) = hex_octet(r)?;
        *octet = value;
        rest = r;
    }
    Ok((rest, MacAddr(octets)))
}

impl FromStr for MacAddr {
    type Err = InvalidMacAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match all_consuming(mac_address)(s) {
            Ok((_, mac)) => Ok(mac),
            Err(_) => Err(InvalidMacAddr(s.to_string())),
        }
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Where a stream's frames go and when they leave within the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamConfig {
    /// Destination MAC address
    pub dmac: MacAddr,
    /// VLAN identifier, 1-4094
    pub vid: u16,
    /// Priority code point stamped into the 802.1Q tag, 0-7
    pub pcp: u8,
    /// Transmission offset from cycle start, strictly less than the interval
    pub txoffset_ns: u64,
}

/// How often a stream transmits and how large its frames are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficSpec {
    /// Cycle interval in nanoseconds, positive
    pub interval_ns: u64,
    /// Frame size in bytes including headers, positive
    pub size_bytes: u32,
}

impl TrafficSpec {
    /// Transmission duration of one frame on a link of the given speed,
    /// rounded up to whole nanoseconds.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use detd::TrafficSpec;
    ///
    /// let spec = TrafficSpec { interval_ns: 2_000_000, size_bytes: 1522 };
    /// assert_eq!(spec.duration_ns(1_000_000_000), 12_176);
    /// ```
    pub fn duration_ns(&self, link_bps: u64) -> u64 {
        let bits = u64::from(self.size_bytes) * 8;
        (bits * 1_000_000_000).div_ceil(link_bps)
    }
}

/// Whether a stream runs through the gated schedule or the leftover time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrafficKind {
    /// Time-triggered stream with an exclusive gate slot
    Scheduled,
    /// Everything else, transmitted whenever no gate is claimed
    BestEffort,
}

/// An admitted `(stream, spec, kind)` triple.
///
/// Only [`TrafficKind::Scheduled`] talkers are admitted through the request
/// path; the best-effort kind exists for the complementary gate slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Traffic {
    pub stream: StreamConfig,
    pub spec: TrafficSpec,
    pub kind: TrafficKind,
}

impl Traffic {
    /// A scheduled talker stream.
    pub fn scheduled(stream: StreamConfig, spec: TrafficSpec) -> Self {
        Traffic {
            stream,
            spec,
            kind: TrafficKind::Scheduled,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self.kind, TrafficKind::Scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mac_address() {
        let mac: MacAddr = "ab:cd:ef:01:23:45".parse().unwrap();
        assert_eq!(mac, MacAddr([0xab, 0xcd, 0xef, 0x01, 0x23, 0x45]));
    }

    #[test]
    fn parses_uppercase_mac_address() {
        let mac: MacAddr = "AB:CD:EF:01:23:45".parse().unwrap();
        assert_eq!(mac.to_string(), "ab:cd:ef:01:23:45");
    }

    #[test]
    fn rejects_malformed_mac_addresses() {
        for bad in [
            "",
            "ab:cd:ef:01:23",
            "ab:cd:ef:01:23:45:67",
            "ab-cd-ef-01-23-45",
            "ab:cd:ef:01:23:4",
            "ab:cd:ef:01:23:45 ",
            "zz:cd:ef:01:23:45",
        ] {
            assert!(bad.parse::<MacAddr>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn derives_transmission_duration() {
        // 1522 B at 1 Gbps is the full-MTU reference case
        let spec = TrafficSpec {
            interval_ns: 2_000_000,
            size_bytes: 1522,
        };
        assert_eq!(spec.duration_ns(1_000_000_000), 12_176);

        let spec = TrafficSpec {
            interval_ns: 2_000_000,
            size_bytes: 512,
        };
        assert_eq!(spec.duration_ns(1_000_000_000), 4_096);

        // Non-divisible sizes round up
        let spec = TrafficSpec {
            interval_ns: 1_000_000,
            size_bytes: 100,
        };
        assert_eq!(spec.duration_ns(2_500_000_000), 320);
        let spec = TrafficSpec {
            interval_ns: 1_000_000,
            size_bytes: 101,
        };
        assert_eq!(spec.duration_ns(2_500_000_000), 324); // 323.2 rounded up
    }

    #[test]
    fn traffic_kind_helpers() {
        let stream = StreamConfig {
            dmac: "ff:ff:ff:ff:ff:01".parse().unwrap(),
            vid: 3,
            pcp: 6,
            txoffset_ns: 0,
        };
        let spec = TrafficSpec {
            interval_ns: 1_000_000,
            size_bytes: 64,
        };
        assert!(Traffic::scheduled(stream, spec).is_scheduled());
    }
}
