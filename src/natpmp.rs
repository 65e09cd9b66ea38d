//! NAT-PMP (NAT Port Mapping Protocol) client - RFC 6886
//!
//! NAT-PMP is a legacy protocol supported by older routers, particularly
//! Apple AirPort devices and some Cisco routers. Requests are 12 bytes,
//! responses 16 bytes, both over UDP port 5351.
//!
//! A NAT-PMP request carries no explicit source address: the gateway maps
//! whatever address the datagram arrived from. The internal IP of a new
//! mapping is therefore recovered after the fact by a longest-prefix match
//! of the local addresses against the gateway that answered.

use crate::deadline::{first_success, with_deadline};
use crate::resolver::longest_prefix_match;
use crate::types::{Mapping, MappingError, MappingProtocol};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// NAT-PMP protocol version
pub(crate) const NATPMP_VERSION: u8 = 0;

/// Opcode for a UDP port mapping request
pub(crate) const OPCODE_MAP_UDP: u8 = 1;

/// Per-gateway deadline for a NAT-PMP exchange
const NATPMP_TIMEOUT: Duration = Duration::from_millis(2000);

/// NAT-PMP result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum NatPmpResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl NatPmpResultCode {
    pub(crate) fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::NetworkFailure),
            4 => Some(Self::OutOfResources),
            5 => Some(Self::UnsupportedOpcode),
            _ => None,
        }
    }

    pub(crate) fn to_error_message(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::UnsupportedVersion => "Unsupported NAT-PMP version",
            Self::NotAuthorized => "Not authorized/refused",
            Self::NetworkFailure => "Network failure",
            Self::OutOfResources => "Out of resources",
            Self::UnsupportedOpcode => "Unsupported opcode",
        }
    }
}

/// Fields of a parsed NAT-PMP MAP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapResponse {
    pub external_port: u16,
    pub lifetime_secs: u32,
}

/// Build a 12-byte NAT-PMP MAP-UDP request
pub(crate) fn build_map_request(internal_port: u16, external_port: u16, lifetime_secs: u32) -> [u8; 12] {
    let mut request = [0u8; 12];

    request[0] = NATPMP_VERSION;
    request[1] = OPCODE_MAP_UDP;
    // Bytes 2-3 reserved, must be zero
    request[4..6].copy_from_slice(&internal_port.to_be_bytes());
    request[6..8].copy_from_slice(&external_port.to_be_bytes());
    request[8..12].copy_from_slice(&lifetime_secs.to_be_bytes());

    request
}

/// Parse a 16-byte NAT-PMP MAP response
///
/// A well-formed response with a non-success result code is a protocol-level
/// failure ([`MappingError::GatewayError`]); it fails this gateway attempt
/// without aborting siblings.
pub(crate) fn parse_map_response(response: &[u8]) -> Result<MapResponse, MappingError> {
    if response.len() < 16 {
        return Err(MappingError::InvalidResponse(format!(
            "Response too short: {} bytes (expected 16)",
            response.len()
        )));
    }

    let version = response[0];
    if version != NATPMP_VERSION {
        return Err(MappingError::InvalidResponse(format!(
            "Invalid version: {} (expected {})",
            version, NATPMP_VERSION
        )));
    }

    // Response opcode is 128 + request opcode
    if response[1] < 128 {
        return Err(MappingError::InvalidResponse(
            "Received request instead of response".to_string(),
        ));
    }

    let result_code = u16::from_be_bytes([response[2], response[3]]);
    let result = NatPmpResultCode::from_u16(result_code).ok_or_else(|| {
        MappingError::InvalidResponse(format!("Unknown result code: {}", result_code))
    })?;
    if result != NatPmpResultCode::Success {
        return Err(MappingError::GatewayError(result.to_error_message().to_string()));
    }

    Ok(MapResponse {
        external_port: u16::from_be_bytes([response[10], response[11]]),
        lifetime_secs: u32::from_be_bytes([response[12], response[13], response[14], response[15]]),
    })
}

/// Send one NAT-PMP request and wait for the gateway's reply
///
/// Returns the responding gateway's address along with the parsed response.
/// The socket is dropped when this future completes or is aborted, so a
/// losing race participant releases its port exactly once.
async fn exchange(
    gateway: SocketAddr,
    request: [u8; 12],
) -> Result<(IpAddr, MapResponse), MappingError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(&request, gateway).await?;
    debug!("Sent NAT-PMP request to {}", gateway);

    with_deadline(NATPMP_TIMEOUT, async {
        let mut buf = [0u8; 16];
        let (len, from) = socket.recv_from(&mut buf).await?;
        let response = parse_map_response(&buf[..len])?;
        Ok((from.ip(), response))
    })
    .await
}

/// Request a NAT-PMP mapping from every candidate gateway in parallel
///
/// The first gateway that answers with a success response wins; the other
/// attempts are aborted and their sockets closed. The mapping's internal IP
/// is inferred from the winner's address by longest-prefix match against
/// `private_ips`.
pub(crate) async fn request_mapping(
    gateways: &[SocketAddr],
    private_ips: &[Ipv4Addr],
    internal_port: u16,
    external_port: u16,
    lifetime_secs: u32,
) -> Result<Mapping, MappingError> {
    info!(
        "Attempting NAT-PMP mapping {} -> {} (lifetime: {}s)",
        internal_port, external_port, lifetime_secs
    );

    let request = build_map_request(internal_port, external_port, lifetime_secs);
    let (gateway_ip, response) =
        first_success(gateways.iter().map(|&gw| exchange(gw, request))).await?;

    let gateway_v4 = match gateway_ip {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => {
            return Err(MappingError::InvalidResponse(
                "NAT-PMP response from an IPv6 source".to_string(),
            ));
        }
    };
    let internal_ip =
        longest_prefix_match(private_ips, gateway_v4).ok_or(MappingError::NoPrivateAddress)?;

    let mapping = Mapping {
        protocol: MappingProtocol::NatPmp,
        internal_ip,
        internal_port,
        external_ip: None,
        external_port: response.external_port,
        lifetime_secs: response.lifetime_secs,
    };

    info!(
        "NAT-PMP mapping successful: external port {} (lifetime: {}s)",
        mapping.external_port, mapping.lifetime_secs
    );

    Ok(mapping)
}

/// Delete a NAT-PMP mapping on whichever gateway holds it
///
/// Per the protocol, deletion is a MAP request for the recorded internal
/// port with external port 0 and lifetime 0. Any gateway answering with a
/// success code confirms the deletion.
pub(crate) async fn delete_mapping(gateways: &[SocketAddr], internal_port: u16) -> bool {
    let request = build_map_request(internal_port, 0, 0);

    let confirmed = first_success(gateways.iter().map(|&gw| async move {
        let (_, _) = exchange(gw, request).await?;
        Ok(())
    }))
    .await;

    match confirmed {
        Ok(()) => {
            info!("NAT-PMP mapping for internal port {} deleted", internal_port);
            true
        }
        Err(e) => {
            debug!("NAT-PMP delete failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_map_request_layout() {
        let request = build_map_request(8080, 50123, 3600);

        assert_eq!(request.len(), 12, "NAT-PMP MAP request should be 12 bytes");
        assert_eq!(request[0], NATPMP_VERSION);
        assert_eq!(request[1], OPCODE_MAP_UDP);
        assert_eq!(&request[2..4], &[0, 0], "Reserved bytes must be zero");
        assert_eq!(u16::from_be_bytes([request[4], request[5]]), 8080);
        assert_eq!(u16::from_be_bytes([request[6], request[7]]), 50123);
        assert_eq!(
            u32::from_be_bytes([request[8], request[9], request[10], request[11]]),
            3600
        );
    }

    #[test]
    fn test_build_delete_request_zeroes_port_and_lifetime() {
        let request = build_map_request(8080, 0, 0);
        assert_eq!(&request[6..8], &[0, 0]);
        assert_eq!(&request[8..12], &[0, 0, 0, 0]);
    }

    fn success_response(external_port: u16, lifetime: u32) -> Vec<u8> {
        let mut response = Vec::with_capacity(16);
        response.push(NATPMP_VERSION);
        response.push(128 + OPCODE_MAP_UDP);
        response.extend_from_slice(&0u16.to_be_bytes()); // result code
        response.extend_from_slice(&1234567u32.to_be_bytes()); // seconds since epoch
        response.extend_from_slice(&8080u16.to_be_bytes()); // internal port
        response.extend_from_slice(&external_port.to_be_bytes());
        response.extend_from_slice(&lifetime.to_be_bytes());
        response
    }

    #[test]
    fn test_parse_map_response_success() {
        let parsed = parse_map_response(&success_response(50123, 7200)).unwrap();
        assert_eq!(parsed.external_port, 50123);
        assert_eq!(parsed.lifetime_secs, 7200);
    }

    #[test]
    fn test_parse_map_response_too_short() {
        let result = parse_map_response(&[0u8; 10]);
        assert!(matches!(result, Err(MappingError::InvalidResponse(_))));
    }

    #[test]
    fn test_parse_map_response_invalid_version() {
        let mut response = success_response(50123, 7200);
        response[0] = 99;
        let result = parse_map_response(&response);
        assert!(matches!(result, Err(MappingError::InvalidResponse(_))));
    }

    #[test]
    fn test_parse_map_response_request_echo_rejected() {
        // Opcode below 128 means we somehow read back a request
        let mut response = success_response(50123, 7200);
        response[1] = OPCODE_MAP_UDP;
        let result = parse_map_response(&response);
        assert!(matches!(result, Err(MappingError::InvalidResponse(_))));
    }

    #[test]
    fn test_parse_map_response_gateway_error() {
        let mut response = success_response(0, 0);
        response[2..4].copy_from_slice(&3u16.to_be_bytes()); // network failure
        match parse_map_response(&response) {
            Err(MappingError::GatewayError(msg)) => assert_eq!(msg, "Network failure"),
            other => panic!("expected gateway error, got {:?}", other),
        }
    }

    #[test]
    fn test_result_code_conversion() {
        assert_eq!(NatPmpResultCode::from_u16(0), Some(NatPmpResultCode::Success));
        assert_eq!(
            NatPmpResultCode::from_u16(2),
            Some(NatPmpResultCode::NotAuthorized)
        );
        assert_eq!(NatPmpResultCode::from_u16(999), None);
    }
}
