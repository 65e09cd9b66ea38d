//! Port mapping orchestration
//!
//! [`PortMapper`] owns the registry of active mappings and drives the
//! protocol fallback chain: NAT-PMP first, then PCP, then UPnP. Each
//! registered mapping gets a background task that either renews it before
//! the gateway-granted lease runs out or drops it from the registry when the
//! lease expires. Deleting a mapping cancels its task and tells the gateway
//! to release the port.

use crate::gateway::candidate_gateways;
use crate::resolver::{AddressSource, SystemAddressSource};
use crate::types::{Mapping, MappingError, MappingProtocol, ProtocolSupport};
use crate::{natpmp, pcp, upnp};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Wire lifetime used when the caller asks for a permanent mapping
///
/// Gateways reject or silently cap unbounded lifetimes, so "permanent" is
/// expressed as a 24-hour lease re-added on a fixed 24-hour cadence.
const PERMANENT_LIFETIME: u32 = 86_400;

/// External ports used by [`PortMapper::probe_protocol_support`]
const PROBE_PORTS: [u16; 3] = [55_555, 55_556, 55_557];

/// Lifetime of probe mappings, in seconds
const PROBE_LIFETIME: u32 = 120;

/// What the background task should do once a mapping is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followup {
    /// Leave the mapping alone until deleted (UPnP permanent lease)
    None,
    /// Re-request the mapping after `after_secs` with `lifetime_secs`
    Renew { after_secs: u64, lifetime_secs: u32 },
    /// Drop the registry entry after `after_secs`; the lease lapses on its own
    Expire { after_secs: u64 },
}

/// Lifetime actually put on the wire for a requested lifetime
fn wire_lifetime(requested_secs: u32) -> u32 {
    if requested_secs == 0 {
        PERMANENT_LIFETIME
    } else {
        requested_secs
    }
}

/// Decide the follow-up action for a granted mapping
///
/// UPnP gateways grant exactly what was asked, so their mappings are never
/// renewed. For NAT-PMP and PCP a permanent request (0) is re-added on the
/// fixed 24-hour cadence regardless of what the gateway granted; a short
/// grant gets one renewal at the granted mark asking for the remainder; a
/// full grant just expires.
fn plan_followup(protocol: &MappingProtocol, requested_secs: u32, granted_secs: u32) -> Followup {
    if let MappingProtocol::Upnp = protocol {
        return if granted_secs == 0 {
            Followup::None
        } else {
            Followup::Expire {
                after_secs: u64::from(granted_secs),
            }
        };
    }

    if requested_secs == 0 {
        return Followup::Renew {
            after_secs: u64::from(PERMANENT_LIFETIME),
            lifetime_secs: 0,
        };
    }
    if granted_secs < requested_secs {
        return Followup::Renew {
            after_secs: u64::from(granted_secs),
            lifetime_secs: requested_secs - granted_secs,
        };
    }
    Followup::Expire {
        after_secs: u64::from(granted_secs),
    }
}

/// A registered mapping plus its renewal/expiry task
struct Entry {
    mapping: Mapping,
    timer: Option<JoinHandle<()>>,
}

/// Configuration for a [`PortMapper`]
#[derive(Debug, Clone)]
pub struct PortMapperConfig {
    /// Gateway addresses NAT-PMP and PCP requests are fanned out to
    pub gateways: Vec<SocketAddr>,
    /// Address SSDP searches are sent to
    pub ssdp_target: String,
    /// Description attached to UPnP mappings
    pub description: String,
}

impl Default for PortMapperConfig {
    fn default() -> Self {
        Self {
            gateways: candidate_gateways(),
            ssdp_target: upnp::SSDP_MULTICAST.to_string(),
            description: "portmap".to_string(),
        }
    }
}

struct Inner {
    gateways: Vec<SocketAddr>,
    ssdp_target: String,
    description: String,
    http: reqwest::Client,
    address_source: Arc<dyn AddressSource>,
    registry: Mutex<HashMap<u16, Entry>>,
}

/// Automatic NAT port mapper
///
/// Cheap to clone; clones share the same mapping registry.
///
/// # Example
///
/// ```no_run
/// use portmap::PortMapper;
///
/// # async fn run() -> Result<(), portmap::MappingError> {
/// let mapper = PortMapper::new();
/// let mapping = mapper.add_mapping(8080, 50123, 3600).await?;
/// println!("reachable on external port {}", mapping.external_port);
/// mapper.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PortMapper {
    inner: Arc<Inner>,
}

impl PortMapper {
    /// Create a mapper with the default gateway list and address source
    pub fn new() -> Self {
        Self::with_config(PortMapperConfig::default(), Arc::new(SystemAddressSource))
    }

    /// Create a mapper with explicit configuration and address source
    pub fn with_config(config: PortMapperConfig, address_source: Arc<dyn AddressSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateways: config.gateways,
                ssdp_target: config.ssdp_target,
                description: config.description,
                http: reqwest::Client::new(),
                address_source,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Map `internal_port` to `external_port` on the gateway
    ///
    /// Tries NAT-PMP, then PCP, then UPnP, returning as soon as one
    /// succeeds. A `lifetime_secs` of 0 requests a permanent mapping, kept
    /// alive by re-adding it every 24 hours. On success the mapping is
    /// registered and renewed/expired automatically until
    /// [`delete_mapping`](Self::delete_mapping) or [`close`](Self::close).
    ///
    /// # Arguments
    ///
    /// * `internal_port` - Local UDP port to expose
    /// * `external_port` - Desired external UDP port
    /// * `lifetime_secs` - Requested lifetime in seconds, 0 for permanent
    pub async fn add_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    ) -> Result<Mapping, MappingError> {
        let private_ips = self.inner.address_source.private_ipv4_addresses()?;

        match self
            .inner
            .try_natpmp(&private_ips, internal_port, external_port, lifetime_secs)
            .await
        {
            Ok(mapping) => return Ok(mapping),
            Err(e) => warn!("NAT-PMP failed ({}), falling back to PCP", e),
        }

        match self
            .inner
            .try_pcp(&private_ips, internal_port, external_port, lifetime_secs)
            .await
        {
            Ok(mapping) => return Ok(mapping),
            Err(e) => warn!("PCP failed ({}), falling back to UPnP", e),
        }

        match self
            .inner
            .try_upnp(&private_ips, internal_port, external_port, lifetime_secs)
            .await
        {
            Ok(mapping) => Ok(mapping),
            Err(e) => {
                warn!("UPnP failed ({}), no mapping protocol succeeded", e);
                Err(e)
            }
        }
    }

    /// Delete the mapping registered for `external_port`
    ///
    /// Asks the gateway to release the port using whichever protocol created
    /// the mapping. Only a confirmed deletion removes the registry entry and
    /// cancels its renewal/expiry task; an unconfirmed one leaves the
    /// mapping registered and renewing, since it is still live on the
    /// gateway. Returns `false` when no such mapping is registered or the
    /// gateway did not confirm; it never fails.
    pub async fn delete_mapping(&self, external_port: u16) -> bool {
        let mapping = match self.inner.registry.lock().await.get(&external_port) {
            Some(entry) => entry.mapping.clone(),
            None => {
                debug!("{}", MappingError::UnknownMapping(external_port));
                return false;
            }
        };

        let confirmed = match mapping.protocol {
            MappingProtocol::NatPmp => {
                natpmp::delete_mapping(&self.inner.gateways, mapping.internal_port).await
            }
            MappingProtocol::Pcp { nonce } => {
                match self.inner.address_source.private_ipv4_addresses() {
                    Ok(private_ips) => {
                        pcp::delete_mapping(
                            &self.inner.gateways,
                            &private_ips,
                            mapping.internal_port,
                            nonce,
                        )
                        .await
                    }
                    Err(e) => {
                        warn!("PCP delete skipped, no local address: {}", e);
                        false
                    }
                }
            }
            MappingProtocol::Upnp => {
                upnp::delete_mapping(&self.inner.http, &self.inner.ssdp_target, external_port).await
            }
        };

        if !confirmed {
            warn!(
                "Gateway did not confirm deletion of external port {}, keeping mapping",
                external_port
            );
            return false;
        }

        if let Some(entry) = self.inner.registry.lock().await.remove(&external_port) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
        true
    }

    /// Check which mapping protocols the gateway supports
    ///
    /// Requests one short-lived probe mapping per protocol, all three
    /// concurrently, on external ports 55555-55557. Successful probes are
    /// registered as ordinary mappings and cleaned up like any other.
    pub async fn probe_protocol_support(&self) -> ProtocolSupport {
        let private_ips = match self.inner.address_source.private_ipv4_addresses() {
            Ok(ips) => ips,
            Err(e) => {
                warn!("Protocol probe aborted: {}", e);
                return ProtocolSupport::default();
            }
        };

        let (nat_pmp, pcp_probe, upnp_probe) = tokio::join!(
            self.inner
                .try_natpmp(&private_ips, PROBE_PORTS[0], PROBE_PORTS[0], PROBE_LIFETIME),
            self.inner
                .try_pcp(&private_ips, PROBE_PORTS[1], PROBE_PORTS[1], PROBE_LIFETIME),
            self.inner
                .try_upnp(&private_ips, PROBE_PORTS[2], PROBE_PORTS[2], PROBE_LIFETIME),
        );

        let support = ProtocolSupport {
            nat_pmp: nat_pmp.is_ok(),
            pcp: pcp_probe.is_ok(),
            upnp: upnp_probe.is_ok(),
        };
        info!("Protocol support: {}", support.summary());
        support
    }

    /// Snapshot of the currently registered mappings
    pub async fn active_mappings(&self) -> Vec<Mapping> {
        self.inner
            .registry
            .lock()
            .await
            .values()
            .map(|entry| entry.mapping.clone())
            .collect()
    }

    /// Release every registered mapping
    ///
    /// Call before shutdown so gateways do not accumulate stale mappings
    /// until their leases run out.
    pub async fn close(&self) {
        let ports: Vec<u16> = self.inner.registry.lock().await.keys().copied().collect();
        if ports.is_empty() {
            return;
        }
        info!("Releasing {} active mapping(s)", ports.len());

        let mut deletions = JoinSet::new();
        for port in ports {
            let mapper = self.clone();
            deletions.spawn(async move { mapper.delete_mapping(port).await });
        }
        while deletions.join_next().await.is_some() {}
    }
}

impl Default for PortMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    async fn try_natpmp(
        self: &Arc<Self>,
        private_ips: &[Ipv4Addr],
        internal_port: u16,
        external_port: u16,
        requested_secs: u32,
    ) -> Result<Mapping, MappingError> {
        let mapping = natpmp::request_mapping(
            &self.gateways,
            private_ips,
            internal_port,
            external_port,
            wire_lifetime(requested_secs),
        )
        .await?;
        self.register(requested_secs, mapping.clone()).await;
        Ok(mapping)
    }

    async fn try_pcp(
        self: &Arc<Self>,
        private_ips: &[Ipv4Addr],
        internal_port: u16,
        external_port: u16,
        requested_secs: u32,
    ) -> Result<Mapping, MappingError> {
        let mapping = pcp::request_mapping(
            &self.gateways,
            private_ips,
            pcp::generate_nonce(),
            internal_port,
            external_port,
            wire_lifetime(requested_secs),
        )
        .await?;
        self.register(requested_secs, mapping.clone()).await;
        Ok(mapping)
    }

    async fn try_upnp(
        self: &Arc<Self>,
        private_ips: &[Ipv4Addr],
        internal_port: u16,
        external_port: u16,
        requested_secs: u32,
    ) -> Result<Mapping, MappingError> {
        let mapping = upnp::request_mapping(
            &self.http,
            &self.ssdp_target,
            private_ips,
            internal_port,
            external_port,
            requested_secs,
            &self.description,
        )
        .await?;
        self.register(requested_secs, mapping.clone()).await;
        Ok(mapping)
    }

    /// Insert a mapping into the registry and start its follow-up task
    ///
    /// A mapping already registered on the same external port is replaced
    /// and its task cancelled.
    async fn register(self: &Arc<Self>, requested_secs: u32, mapping: Mapping) {
        let timer = match plan_followup(&mapping.protocol, requested_secs, mapping.lifetime_secs) {
            Followup::None => None,
            _ => Some(tokio::spawn(followup_loop(
                Arc::clone(self),
                requested_secs,
                mapping.clone(),
            ))),
        };

        let mut registry = self.registry.lock().await;
        if let Some(previous) = registry.insert(mapping.external_port, Entry { mapping, timer }) {
            if let Some(timer) = previous.timer {
                timer.abort();
            }
        }
    }

    /// Re-request an existing mapping on the protocol that created it
    async fn renew(&self, mapping: &Mapping, lifetime_secs: u32) -> Result<Mapping, MappingError> {
        let private_ips = self.address_source.private_ipv4_addresses()?;
        match mapping.protocol {
            MappingProtocol::NatPmp => {
                natpmp::request_mapping(
                    &self.gateways,
                    &private_ips,
                    mapping.internal_port,
                    mapping.external_port,
                    wire_lifetime(lifetime_secs),
                )
                .await
            }
            MappingProtocol::Pcp { nonce } => {
                pcp::request_mapping(
                    &self.gateways,
                    &private_ips,
                    nonce,
                    mapping.internal_port,
                    mapping.external_port,
                    wire_lifetime(lifetime_secs),
                )
                .await
            }
            MappingProtocol::Upnp => Err(MappingError::Internal(
                "UPnP mappings are not renewed".to_string(),
            )),
        }
    }
}

/// Renewal/expiry loop for a single registered mapping
///
/// Runs until the mapping expires, a renewal fails, or the registry entry
/// disappears (deleted concurrently). A renewal that comes back with a
/// different external port re-keys the entry in place.
async fn followup_loop(inner: Arc<Inner>, mut requested_secs: u32, mut mapping: Mapping) {
    loop {
        match plan_followup(&mapping.protocol, requested_secs, mapping.lifetime_secs) {
            Followup::None => return,
            Followup::Expire { after_secs } => {
                tokio::time::sleep(Duration::from_secs(after_secs)).await;
                let removed = inner.registry.lock().await.remove(&mapping.external_port);
                if removed.is_some() {
                    info!("Mapping for external port {} expired", mapping.external_port);
                }
                return;
            }
            Followup::Renew {
                after_secs,
                lifetime_secs,
            } => {
                tokio::time::sleep(Duration::from_secs(after_secs)).await;
                debug!(
                    "Renewing {} mapping for external port {}",
                    mapping.protocol.name(),
                    mapping.external_port
                );
                match inner.renew(&mapping, lifetime_secs).await {
                    Ok(renewed) => {
                        let mut registry = inner.registry.lock().await;
                        let Some(mut entry) = registry.remove(&mapping.external_port) else {
                            // Deleted while the renewal was in flight
                            return;
                        };
                        entry.mapping = renewed.clone();
                        registry.insert(renewed.external_port, entry);
                        drop(registry);
                        mapping = renewed;
                        requested_secs = lifetime_secs;
                    }
                    Err(e) => {
                        warn!(
                            "Renewal of external port {} failed, dropping mapping: {}",
                            mapping.external_port, e
                        );
                        inner.registry.lock().await.remove(&mapping.external_port);
                        return;
                    }
                }
            }
        }
    }
}
