//! PCP (Port Control Protocol) client - RFC 6887
//!
//! PCP is the successor to NAT-PMP and shares its UDP port 5351. A MAP
//! request is 60 bytes and carries the client's own address (as an
//! IPv4-mapped IPv6 address) plus a random 96-bit nonce. The gateway echoes
//! the nonce in its response and requires it again to delete the mapping,
//! so the nonce is recorded alongside the mapping.

use crate::deadline::{first_success, with_deadline};
use crate::resolver::longest_prefix_match;
use crate::types::{Mapping, MappingError, MappingProtocol};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// PCP protocol version
pub(crate) const PCP_VERSION: u8 = 2;

/// PCP MAP opcode
pub(crate) const OPCODE_MAP: u8 = 1;

/// IANA protocol number for UDP
const PROTOCOL_UDP: u8 = 17;

/// Per-gateway deadline for a PCP exchange
const PCP_TIMEOUT: Duration = Duration::from_millis(2000);

/// PCP result codes (RFC 6887 section 7.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PcpResultCode {
    Success = 0,
    UnsuppVersion = 1,
    NotAuthorized = 2,
    MalformedRequest = 3,
    UnsuppOpcode = 4,
    UnsuppOption = 5,
    MalformedOption = 6,
    NetworkFailure = 7,
    NoResources = 8,
    UnsuppProtocol = 9,
    UserExQuota = 10,
    CannotProvideExternal = 11,
    AddressMismatch = 12,
    ExcessiveRemotePeers = 13,
}

impl PcpResultCode {
    pub(crate) fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsuppVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::MalformedRequest),
            4 => Some(Self::UnsuppOpcode),
            5 => Some(Self::UnsuppOption),
            6 => Some(Self::MalformedOption),
            7 => Some(Self::NetworkFailure),
            8 => Some(Self::NoResources),
            9 => Some(Self::UnsuppProtocol),
            10 => Some(Self::UserExQuota),
            11 => Some(Self::CannotProvideExternal),
            12 => Some(Self::AddressMismatch),
            13 => Some(Self::ExcessiveRemotePeers),
            _ => None,
        }
    }

    pub(crate) fn to_error_message(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::UnsuppVersion => "Unsupported PCP version",
            Self::NotAuthorized => "Not authorized",
            Self::MalformedRequest => "Malformed request",
            Self::UnsuppOpcode => "Unsupported opcode",
            Self::UnsuppOption => "Unsupported option",
            Self::MalformedOption => "Malformed option",
            Self::NetworkFailure => "Network failure",
            Self::NoResources => "Out of resources",
            Self::UnsuppProtocol => "Unsupported protocol",
            Self::UserExQuota => "Per-user quota exceeded",
            Self::CannotProvideExternal => "Cannot provide requested external address",
            Self::AddressMismatch => "Client address mismatch",
            Self::ExcessiveRemotePeers => "Excessive remote peers",
        }
    }
}

/// Generate a fresh 96-bit mapping nonce
pub(crate) fn generate_nonce() -> [u32; 3] {
    [rand::random(), rand::random(), rand::random()]
}

/// Fields of a parsed PCP MAP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapResponse {
    pub external_port: u16,
    pub external_ip: Ipv4Addr,
    pub lifetime_secs: u32,
}

/// Build a 60-byte PCP MAP request
///
/// The client address goes in as an IPv4-mapped IPv6 address and the
/// suggested external address is left at all-zeroes, letting the gateway
/// choose.
pub(crate) fn build_map_request(
    client_ip: Ipv4Addr,
    nonce: [u32; 3],
    internal_port: u16,
    external_port: u16,
    lifetime_secs: u32,
) -> [u8; 60] {
    let mut request = [0u8; 60];

    request[0] = PCP_VERSION;
    request[1] = OPCODE_MAP;
    // Bytes 2-3 reserved
    request[4..8].copy_from_slice(&lifetime_secs.to_be_bytes());

    // Client IP as ::ffff:a.b.c.d
    request[18] = 0xff;
    request[19] = 0xff;
    request[20..24].copy_from_slice(&client_ip.octets());

    request[24..28].copy_from_slice(&nonce[0].to_be_bytes());
    request[28..32].copy_from_slice(&nonce[1].to_be_bytes());
    request[32..36].copy_from_slice(&nonce[2].to_be_bytes());

    request[36] = PROTOCOL_UDP;
    // Bytes 37-39 reserved
    request[40..42].copy_from_slice(&internal_port.to_be_bytes());
    request[42..44].copy_from_slice(&external_port.to_be_bytes());
    // Bytes 44-59: suggested external address, all zeroes

    request
}

/// Result codes a delete request treats as confirmation
///
/// `NoResources` is included because several gateway implementations return
/// it when asked to delete a mapping they no longer hold, which is the
/// outcome the caller wanted anyway.
fn delete_accepts(code: PcpResultCode) -> bool {
    matches!(code, PcpResultCode::Success | PcpResultCode::NoResources)
}

fn read_result_code(response: &[u8]) -> Result<PcpResultCode, MappingError> {
    if response.len() < 60 {
        return Err(MappingError::InvalidResponse(format!(
            "Response too short: {} bytes (expected 60)",
            response.len()
        )));
    }
    if response[0] != PCP_VERSION {
        return Err(MappingError::InvalidResponse(format!(
            "Invalid version: {} (expected {})",
            response[0], PCP_VERSION
        )));
    }
    PcpResultCode::from_u8(response[3]).ok_or_else(|| {
        MappingError::InvalidResponse(format!("Unknown result code: {}", response[3]))
    })
}

/// Parse a 60-byte PCP MAP response
///
/// The echoed nonce must match the one sent; a mismatch means the response
/// belongs to someone else's transaction and the attempt fails.
pub(crate) fn parse_map_response(
    response: &[u8],
    expected_nonce: [u32; 3],
) -> Result<MapResponse, MappingError> {
    let result = read_result_code(response)?;
    if result != PcpResultCode::Success {
        return Err(MappingError::GatewayError(result.to_error_message().to_string()));
    }

    let echoed = [
        u32::from_be_bytes([response[24], response[25], response[26], response[27]]),
        u32::from_be_bytes([response[28], response[29], response[30], response[31]]),
        u32::from_be_bytes([response[32], response[33], response[34], response[35]]),
    ];
    if echoed != expected_nonce {
        return Err(MappingError::InvalidResponse("Nonce mismatch".to_string()));
    }

    Ok(MapResponse {
        external_port: u16::from_be_bytes([response[42], response[43]]),
        external_ip: Ipv4Addr::new(response[56], response[57], response[58], response[59]),
        lifetime_secs: u32::from_be_bytes([response[4], response[5], response[6], response[7]]),
    })
}

async fn exchange(gateway: SocketAddr, request: [u8; 60]) -> Result<Vec<u8>, MappingError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(&request, gateway).await?;
    debug!("Sent PCP request to {}", gateway);

    with_deadline(PCP_TIMEOUT, async {
        let mut buf = [0u8; 1100];
        let (len, _) = socket.recv_from(&mut buf).await?;
        Ok(buf[..len].to_vec())
    })
    .await
}

/// Request a PCP mapping from every candidate gateway in parallel
///
/// Unlike NAT-PMP the request itself names the client address, so each
/// gateway attempt picks the local address closest to that gateway before
/// sending. A fresh nonce creates a mapping; sending a mapping's recorded
/// nonce again refreshes it. The nonce is stored in the returned [`Mapping`]
/// for renewal and deletion.
pub(crate) async fn request_mapping(
    gateways: &[SocketAddr],
    private_ips: &[Ipv4Addr],
    nonce: [u32; 3],
    internal_port: u16,
    external_port: u16,
    lifetime_secs: u32,
) -> Result<Mapping, MappingError> {
    info!(
        "Attempting PCP mapping {} -> {} (lifetime: {}s)",
        internal_port, external_port, lifetime_secs
    );

    let attempts: Vec<_> = gateways
        .iter()
        .filter_map(|&gw| {
            let gateway_v4 = match gw.ip() {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => return None,
            };
            let client_ip = longest_prefix_match(private_ips, gateway_v4)?;
            let request =
                build_map_request(client_ip, nonce, internal_port, external_port, lifetime_secs);
            Some(async move {
                let response = exchange(gw, request).await?;
                let parsed = parse_map_response(&response, nonce)?;
                Ok((client_ip, parsed))
            })
        })
        .collect();

    if attempts.is_empty() {
        return Err(MappingError::NoPrivateAddress);
    }

    let (internal_ip, response) = first_success(attempts).await?;

    let mapping = Mapping {
        protocol: MappingProtocol::Pcp { nonce },
        internal_ip,
        internal_port,
        external_ip: Some(response.external_ip),
        external_port: response.external_port,
        lifetime_secs: response.lifetime_secs,
    };

    info!(
        "PCP mapping successful: {}:{} (lifetime: {}s)",
        response.external_ip, response.external_port, response.lifetime_secs
    );

    Ok(mapping)
}

/// Delete a PCP mapping on whichever gateway holds it
///
/// Deletion is a MAP request with lifetime 0 carrying the nonce recorded at
/// creation time. The first gateway answering with `Success` or
/// `NoResources` confirms it.
pub(crate) async fn delete_mapping(
    gateways: &[SocketAddr],
    private_ips: &[Ipv4Addr],
    internal_port: u16,
    nonce: [u32; 3],
) -> bool {
    let attempts: Vec<_> = gateways
        .iter()
        .filter_map(|&gw| {
            let gateway_v4 = match gw.ip() {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => return None,
            };
            let client_ip = longest_prefix_match(private_ips, gateway_v4)?;
            let request = build_map_request(client_ip, nonce, internal_port, 0, 0);
            Some(async move {
                let response = exchange(gw, request).await?;
                let result = read_result_code(&response)?;
                if delete_accepts(result) {
                    Ok(())
                } else {
                    Err(MappingError::GatewayError(
                        result.to_error_message().to_string(),
                    ))
                }
            })
        })
        .collect();

    match first_success(attempts).await {
        Ok(()) => {
            info!("PCP mapping for internal port {} deleted", internal_port);
            true
        }
        Err(e) => {
            debug!("PCP delete failed: {}", e);
            false
        }
    }
}
