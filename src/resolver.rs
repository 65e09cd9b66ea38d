//! Private address discovery and interface selection
//!
//! A multi-homed host has several private IPv4 addresses and a request must
//! carry (PCP, UPnP) or be attributed to (NAT-PMP) the address of whichever
//! interface actually reaches the gateway. The interface is picked by a
//! longest-prefix match between the local addresses and the gateway address.

use crate::types::MappingError;
use std::net::Ipv4Addr;
use tracing::debug;

/// Source of the host's private IPv4 addresses
///
/// Injected into [`PortMapper`](crate::PortMapper) so tests can substitute a
/// fixed address list for real interface enumeration.
pub trait AddressSource: Send + Sync {
    /// Return all local IPv4 addresses usable as a mapping's internal IP
    ///
    /// Fails with [`MappingError::NoPrivateAddress`] when none exist; no
    /// protocol can proceed in that case.
    fn private_ipv4_addresses(&self) -> Result<Vec<Ipv4Addr>, MappingError>;
}

/// [`AddressSource`] backed by the operating system's interface table
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAddressSource;

impl AddressSource for SystemAddressSource {
    fn private_ipv4_addresses(&self) -> Result<Vec<Ipv4Addr>, MappingError> {
        let interfaces = if_addrs::get_if_addrs()
            .map_err(|e| MappingError::Internal(format!("Failed to enumerate interfaces: {}", e)))?;

        let mut addresses = Vec::new();
        for interface in interfaces {
            if interface.is_loopback() {
                continue;
            }
            if let std::net::IpAddr::V4(ip) = interface.ip() {
                if !addresses.contains(&ip) {
                    addresses.push(ip);
                }
            }
        }

        debug!("Discovered local IPv4 addresses: {:?}", addresses);

        if addresses.is_empty() {
            return Err(MappingError::NoPrivateAddress);
        }
        Ok(addresses)
    }
}

/// Pick the candidate sharing the longest leading bit prefix with `reference`
///
/// Match lengths are capped at 31 bits, so an identical address scores the
/// same as a /31 neighbor. Ties are broken by first occurrence in
/// `candidates`.
///
/// # Example
///
/// ```
/// use std::net::Ipv4Addr;
/// use portmap::resolver::longest_prefix_match;
///
/// let candidates = [Ipv4Addr::new(192, 168, 1, 5), Ipv4Addr::new(10, 0, 0, 2)];
/// let best = longest_prefix_match(&candidates, Ipv4Addr::new(192, 168, 1, 1));
/// assert_eq!(best, Some(Ipv4Addr::new(192, 168, 1, 5)));
/// ```
pub fn longest_prefix_match(candidates: &[Ipv4Addr], reference: Ipv4Addr) -> Option<Ipv4Addr> {
    let mut best: Option<(u32, Ipv4Addr)> = None;

    for &candidate in candidates {
        let common = (u32::from(candidate) ^ u32::from(reference))
            .leading_zeros()
            .min(31);
        match best {
            Some((best_len, _)) if best_len >= common => {}
            _ => best = Some((common, candidate)),
        }
    }

    best.map(|(_, ip)| ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_match_picks_matching_subnet() {
        let candidates = [Ipv4Addr::new(192, 168, 1, 5), Ipv4Addr::new(10, 0, 0, 2)];
        let best = longest_prefix_match(&candidates, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(best, Some(Ipv4Addr::new(192, 168, 1, 5)));
    }

    #[test]
    fn test_longest_prefix_match_order_independent_when_unambiguous() {
        let candidates = [Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(192, 168, 1, 5)];
        let best = longest_prefix_match(&candidates, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(best, Some(Ipv4Addr::new(192, 168, 1, 5)));
    }

    #[test]
    fn test_longest_prefix_match_tie_break_is_first_occurrence() {
        // Both candidates share the same 24-bit prefix with the reference
        let candidates = [Ipv4Addr::new(192, 168, 1, 130), Ipv4Addr::new(192, 168, 1, 131)];
        let best = longest_prefix_match(&candidates, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(best, Some(Ipv4Addr::new(192, 168, 1, 130)));
    }

    #[test]
    fn test_longest_prefix_match_identical_address_caps_at_31() {
        let candidates = [Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 0)];
        // Identical and the /31 neighbor both score 31; first occurrence wins
        let best = longest_prefix_match(&candidates, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(best, Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_longest_prefix_match_empty_list() {
        assert_eq!(longest_prefix_match(&[], Ipv4Addr::new(192, 168, 1, 1)), None);
    }
}
