//! Networking utilities for cluster provisioning.
//!
//! This library provides helpers for:
//! - IPv4 CIDR parsing and containment checks
//! - The fixed address blocks used for default networks
//! - Port and protocol vocabulary for firewall rules

use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

// ============================================================================
// Address blocks
// ============================================================================

/// Address block of the default private network.
pub const DEFAULT_VPC_CIDR: &str = "192.168.0.0/16";

/// Address block of the default subnet inside the default private network.
pub const DEFAULT_SUBNET_CIDR: &str = "192.168.3.0/24";

/// Default pod address block handed to the cluster software.
pub const DEFAULT_CLUSTER_CIDR: &str = "10.42.0.0/16";

/// The "any source" block.
pub const ANY_IPV4: &str = "0.0.0.0/0";

/// IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    /// Network address (host bits cleared).
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Cidr {
    /// The universal block `0.0.0.0/0`.
    pub const ANY: Self = Self {
        address: Ipv4Addr::UNSPECIFIED,
        prefix_len: 0,
    };

    /// Create a new CIDR, masking the address to the prefix.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "192.168.3.0/24").
    ///
    /// A bare address is accepted as a /32.
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let (addr_str, prefix_len) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let len = prefix
                    .parse::<u8>()
                    .map_err(|_| NetworkError::InvalidPrefix(prefix.to_string()))?;
                (addr, len)
            }
            None => (s, 32),
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this block.
    pub fn contains_addr(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Check if another block lies entirely within this block.
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix_len >= self.prefix_len && self.contains_addr(other.address)
    }

    /// Returns true for `0.0.0.0/0`.
    pub fn is_universal(&self) -> bool {
        self.prefix_len == 0
    }

    /// Number of addresses in this block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

/// Check whether a rule's source block satisfies a required scope.
///
/// The rule covers the requirement when it names the same network or is the
/// universal block. Unparseable rule blocks never cover anything.
pub fn source_covers(rule_cidr: &str, required: &Ipv4Cidr) -> bool {
    match Ipv4Cidr::from_cidr(rule_cidr) {
        Ok(rule) => rule.is_universal() || rule == *required,
        Err(_) => false,
    }
}

// ============================================================================
// Firewall vocabulary
// ============================================================================

/// Firewall rule protocol.
///
/// Groups may carry rules this crate never writes (GRE, service templates
/// with an empty protocol); those are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
    Other(String),
}

impl Protocol {
    /// Provider spelling of the protocol.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::All => "ALL",
            Self::Other(raw) => raw,
        }
    }

    /// Map a provider protocol string. Never fails.
    pub fn from_provider(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Self::Tcp,
            "UDP" => Self::Udp,
            "ICMP" => Self::Icmp,
            "ALL" => Self::All,
            _ => Self::Other(s.to_string()),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_provider(s))
    }
}

/// Parse a provider port expression (`"22"`, `"22,80"`) into port numbers.
///
/// Entries that are not plain numbers (ranges, `ALL`) are skipped.
pub fn parse_port_list(ports: &str) -> Vec<u16> {
    ports
        .split(',')
        .filter_map(|p| p.trim().parse::<u16>().ok())
        .collect()
}
