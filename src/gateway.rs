//! Candidate gateway addresses
//!
//! NAT-PMP and PCP have no discovery mechanism of their own, so requests are
//! fanned out to a fixed list of common default-router addresses. On
//! platforms where the routing table is readable, the actual default gateway
//! is queried first and prepended to the list.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// UDP port gateways listen on for both NAT-PMP and PCP (IANA assigned)
pub const MAPPING_PORT: u16 = 5351;

/// Common default-router addresses
///
/// Covers the factory defaults of the major consumer router vendors.
pub const ROUTER_IPS: [Ipv4Addr; 20] = [
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 2, 1),
    Ipv4Addr::new(192, 168, 11, 1),
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 0, 30),
    Ipv4Addr::new(192, 168, 0, 50),
    Ipv4Addr::new(192, 168, 20, 1),
    Ipv4Addr::new(192, 168, 30, 1),
    Ipv4Addr::new(192, 168, 62, 1),
    Ipv4Addr::new(192, 168, 100, 1),
    Ipv4Addr::new(192, 168, 102, 1),
    Ipv4Addr::new(192, 168, 1, 254),
    Ipv4Addr::new(192, 168, 10, 1),
    Ipv4Addr::new(192, 168, 123, 254),
    Ipv4Addr::new(192, 168, 4, 1),
    Ipv4Addr::new(10, 0, 1, 1),
    Ipv4Addr::new(10, 1, 1, 1),
    Ipv4Addr::new(10, 0, 0, 13),
    Ipv4Addr::new(10, 0, 0, 2),
    Ipv4Addr::new(10, 0, 0, 138),
];

/// Build the candidate gateway list used for NAT-PMP/PCP fan-out
///
/// The platform default gateway (if one can be read from the routing table)
/// comes first, followed by the fixed list of common router addresses, with
/// duplicates removed.
pub fn candidate_gateways() -> Vec<SocketAddr> {
    let mut ips: Vec<Ipv4Addr> = Vec::with_capacity(ROUTER_IPS.len() + 1);

    if let Some(gateway) = find_default_gateway() {
        ips.push(gateway);
    }
    for ip in ROUTER_IPS {
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    ips.into_iter()
        .map(|ip| SocketAddr::new(IpAddr::V4(ip), MAPPING_PORT))
        .collect()
}

/// Find the default gateway IP address
///
/// Best effort: returns `None` when the routing table cannot be read or has
/// no default route. On Linux it reads `/proc/net/route`, on macOS it parses
/// `netstat`, on Windows `route print`.
pub fn find_default_gateway() -> Option<Ipv4Addr> {
    #[cfg(target_os = "linux")]
    {
        find_gateway_linux()
    }

    #[cfg(target_os = "macos")]
    {
        find_gateway_macos()
    }

    #[cfg(target_os = "windows")]
    {
        find_gateway_windows()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

#[cfg(target_os = "linux")]
fn find_gateway_linux() -> Option<Ipv4Addr> {
    let route_table = std::fs::read_to_string("/proc/net/route").ok()?;

    for line in route_table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }

        // Default route has destination 00000000
        if fields[1] == "00000000" {
            // Gateway is in field 2, hex little-endian
            if let Ok(gateway_u32) = u32::from_str_radix(fields[2], 16) {
                if gateway_u32 != 0 {
                    return Some(Ipv4Addr::from(gateway_u32.to_be()));
                }
            }
        }
    }

    None
}

#[cfg(target_os = "macos")]
fn find_gateway_macos() -> Option<Ipv4Addr> {
    use std::process::Command;

    let output = Command::new("netstat").args(["-rn", "-f", "inet"]).output().ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    for line in stdout.lines() {
        if line.starts_with("default") {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 2 {
                if let Ok(ip) = fields[1].parse::<Ipv4Addr>() {
                    return Some(ip);
                }
            }
        }
    }

    None
}

#[cfg(target_os = "windows")]
fn find_gateway_windows() -> Option<Ipv4Addr> {
    use std::process::Command;

    let output = Command::new("route").args(["print", "0.0.0.0"]).output().ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("0.0.0.0") {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() >= 3 {
                if let Ok(ip) = fields[2].parse::<Ipv4Addr>() {
                    return Some(ip);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_gateways_cover_fixed_list() {
        let candidates = candidate_gateways();
        assert!(candidates.len() >= ROUTER_IPS.len());

        for ip in ROUTER_IPS {
            let addr = SocketAddr::new(IpAddr::V4(ip), MAPPING_PORT);
            assert!(candidates.contains(&addr), "missing candidate {}", addr);
        }
    }

    #[test]
    fn test_candidate_gateways_have_no_duplicates() {
        let candidates = candidate_gateways();
        for (i, addr) in candidates.iter().enumerate() {
            assert!(!candidates[i + 1..].contains(addr), "duplicate candidate {}", addr);
        }
    }

    #[test]
    fn test_candidate_gateways_use_mapping_port() {
        for addr in candidate_gateways() {
            assert_eq!(addr.port(), MAPPING_PORT);
        }
    }
}
