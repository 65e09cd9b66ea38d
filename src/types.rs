//! Common types for port mapping operations

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Protocols available for port mapping
///
/// The variant carries whatever protocol-specific state is needed to delete
/// the mapping again. PCP mappings can only be deleted by the holder of the
/// nonce that was echoed back when the mapping was created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MappingProtocol {
    /// NAT Port Mapping Protocol (RFC 6886)
    NatPmp,
    /// Port Control Protocol (RFC 6887)
    Pcp {
        /// The 96-bit mapping nonce echoed by the gateway
        nonce: [u32; 3],
    },
    /// Universal Plug and Play IGD
    Upnp,
}

impl MappingProtocol {
    /// Short protocol name for logs and summaries
    pub fn name(&self) -> &'static str {
        match self {
            Self::NatPmp => "NAT-PMP",
            Self::Pcp { .. } => "PCP",
            Self::Upnp => "UPnP",
        }
    }
}

/// An active port mapping on the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mapping {
    /// Protocol that created the mapping
    pub protocol: MappingProtocol,
    /// Local interface address the mapping points at
    pub internal_ip: Ipv4Addr,
    /// Local port the mapping points at
    pub internal_port: u16,
    /// External IP reported by the gateway; only PCP reports one
    pub external_ip: Option<Ipv4Addr>,
    /// External port actually granted by the gateway
    pub external_port: u16,
    /// Lifetime the gateway actually granted, in seconds
    ///
    /// May differ from the requested lifetime; renewal scheduling is derived
    /// from the difference.
    pub lifetime_secs: u32,
}

/// Per-protocol support reported by [`probe_protocol_support`]
///
/// [`probe_protocol_support`]: crate::PortMapper::probe_protocol_support
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolSupport {
    /// Gateway answered a NAT-PMP mapping request
    pub nat_pmp: bool,
    /// Gateway answered a PCP MAP request
    pub pcp: bool,
    /// Gateway accepted a UPnP AddPortMapping action
    pub upnp: bool,
}

impl ProtocolSupport {
    /// Whether any protocol worked
    pub fn any(&self) -> bool {
        self.nat_pmp || self.pcp || self.upnp
    }

    /// Get a summary string of the probe results (for UX display)
    pub fn summary(&self) -> String {
        let mark = |ok: bool| if ok { "ok" } else { "unsupported" };
        format!(
            "NAT-PMP: {} → PCP: {} → UPnP: {}",
            mark(self.nat_pmp),
            mark(self.pcp),
            mark(self.upnp)
        )
    }
}

/// Errors that can occur during port mapping
#[derive(Debug, Error)]
pub enum MappingError {
    /// Network timeout waiting for response
    #[error("Mapping request timed out")]
    Timeout,

    /// Invalid response from gateway
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Gateway returned an error
    #[error("Gateway error: {0}")]
    GatewayError(String),

    /// No gateway answered on the network
    #[error("No gateway found")]
    NoGateway,

    /// No local IPv4 address could be discovered
    ///
    /// Fatal for every protocol: no mapping can be requested without a
    /// candidate internal address.
    #[error("No private IPv4 address found")]
    NoPrivateAddress,

    /// No mapping is recorded for the given external port
    #[error("No active mapping for external port {0}")]
    UnknownMapping(u16),

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error during UPnP communication
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
