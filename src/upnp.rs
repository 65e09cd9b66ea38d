//! UPnP IGD (Internet Gateway Device) client
//!
//! The most widely deployed of the three protocols and the only one over
//! HTTP. Discovery is an SSDP multicast search; every response received
//! within a fixed window is collected rather than raced, because not every
//! announced device description yields a usable control URL; the first one
//! that does owns the session.
//! The device description is scanned textually for the WANIPConnection
//! control URL, and mappings are managed with SOAP AddPortMapping /
//! DeletePortMapping actions.
//!
//! IGDs grant exactly the requested external port and lifetime or fail, so
//! a UPnP mapping never needs renewal, only expiry.

use crate::deadline::with_deadline;
use crate::resolver::longest_prefix_match;
use crate::types::{Mapping, MappingError, MappingProtocol};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info};

/// Standard SSDP multicast address and port
pub(crate) const SSDP_MULTICAST: &str = "239.255.255.250:1900";

/// How long SSDP responses are collected after the search is sent
const SSDP_WINDOW: Duration = Duration::from_millis(1000);

/// Deadline for each HTTP exchange with a gateway
const HTTP_TIMEOUT: Duration = Duration::from_millis(1000);

const SOAP_ADD: &str = "\"urn:schemas-upnp-org:service:WANIPConnection:1#AddPortMapping\"";
const SOAP_DELETE: &str = "\"urn:schemas-upnp-org:service:WANIPConnection:1#DeletePortMapping\"";

/// A gateway located via SSDP, ready to receive SOAP actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ControlPoint {
    /// Absolute URL of the WANIPConnection control endpoint
    pub control_url: String,
    /// Gateway address, taken from the description URL's host
    pub gateway_ip: Ipv4Addr,
}

/// Build the SSDP M-SEARCH datagram for IGD root devices
pub(crate) fn build_search_request() -> String {
    [
        "M-SEARCH * HTTP/1.1",
        "HOST: 239.255.255.250:1900",
        "MAN: \"ssdp:discover\"",
        "MX: 2",
        "ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1",
        "",
        "",
    ]
    .join("\r\n")
}

/// Extract the LOCATION header from an SSDP response
pub(crate) fn extract_location(response: &str) -> Option<String> {
    for line in response.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("location") {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Find the WANIPConnection control URL in a device description
///
/// The description is an XML document, but a full parse is unnecessary: the
/// control URL is the first `<controlURL>` element after the
/// `WANIPConnection` service type marker.
pub(crate) fn find_control_url(description: &str) -> Option<String> {
    let marker = description.find("WANIPConnection")?;
    let after = &description[marker..];
    let start = after.find("<controlURL>")? + "<controlURL>".len();
    let end = after[start..].find("</controlURL>")? + start;
    let url = after[start..end].trim();
    if url.is_empty() {
        return None;
    }
    Some(url.to_string())
}

/// Resolve a control URL that may be relative to the description URL
pub(crate) fn resolve_control_url(location: &str, control_url: &str) -> Result<String, MappingError> {
    let base = reqwest::Url::parse(location)
        .map_err(|e| MappingError::InvalidResponse(format!("Bad LOCATION URL: {}", e)))?;
    let resolved = base
        .join(control_url)
        .map_err(|e| MappingError::InvalidResponse(format!("Bad control URL: {}", e)))?;
    Ok(resolved.to_string())
}

/// Extract `<errorDescription>` from a SOAP fault body, if present
pub(crate) fn extract_error_description(body: &str) -> Option<String> {
    let start = body.find("<errorDescription>")? + "<errorDescription>".len();
    let end = body[start..].find("</errorDescription>")? + start;
    Some(body[start..end].trim().to_string())
}

/// Build an AddPortMapping SOAP envelope
pub(crate) fn build_add_request(
    external_port: u16,
    internal_port: u16,
    internal_client: Ipv4Addr,
    description: &str,
    lifetime_secs: u32,
) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\"?>\r\n",
            "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" ",
            "s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\r\n",
            "<s:Body>\r\n",
            "<u:AddPortMapping xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">\r\n",
            "<NewRemoteHost></NewRemoteHost>\r\n",
            "<NewExternalPort>{external_port}</NewExternalPort>\r\n",
            "<NewProtocol>UDP</NewProtocol>\r\n",
            "<NewInternalPort>{internal_port}</NewInternalPort>\r\n",
            "<NewInternalClient>{internal_client}</NewInternalClient>\r\n",
            "<NewEnabled>1</NewEnabled>\r\n",
            "<NewPortMappingDescription>{description}</NewPortMappingDescription>\r\n",
            "<NewLeaseDuration>{lifetime}</NewLeaseDuration>\r\n",
            "</u:AddPortMapping>\r\n",
            "</s:Body>\r\n",
            "</s:Envelope>\r\n",
        ),
        external_port = external_port,
        internal_port = internal_port,
        internal_client = internal_client,
        description = description,
        lifetime = lifetime_secs,
    )
}

/// Build a DeletePortMapping SOAP envelope
pub(crate) fn build_delete_request(external_port: u16) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\"?>\r\n",
            "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" ",
            "s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\r\n",
            "<s:Body>\r\n",
            "<u:DeletePortMapping xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">\r\n",
            "<NewRemoteHost></NewRemoteHost>\r\n",
            "<NewExternalPort>{external_port}</NewExternalPort>\r\n",
            "<NewProtocol>UDP</NewProtocol>\r\n",
            "</u:DeletePortMapping>\r\n",
            "</s:Body>\r\n",
            "</s:Envelope>\r\n",
        ),
        external_port = external_port,
    )
}

/// Multicast an M-SEARCH and collect LOCATION URLs for the full window
///
/// Every distinct responder within the window is kept; discovery is a
/// collection, not a race, because the first IGD to answer is not
/// necessarily one that accepts mappings.
pub(crate) async fn discover_locations(ssdp_target: &str) -> Result<Vec<String>, MappingError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(build_search_request().as_bytes(), ssdp_target).await?;
    debug!("Sent SSDP M-SEARCH to {}", ssdp_target);

    let mut locations: Vec<String> = Vec::new();
    let deadline = Instant::now() + SSDP_WINDOW;
    let mut buf = [0u8; 2048];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let response = String::from_utf8_lossy(&buf[..len]);
                if let Some(location) = extract_location(&response) {
                    debug!("SSDP response from {}: {}", from, location);
                    if !locations.contains(&location) {
                        locations.push(location);
                    }
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }

    debug!("SSDP discovery collected {} location(s)", locations.len());
    Ok(locations)
}

/// Fetch a device description and resolve its WANIPConnection control point
async fn resolve_control_point(
    http: &reqwest::Client,
    location: &str,
) -> Result<ControlPoint, MappingError> {
    let url = reqwest::Url::parse(location)
        .map_err(|e| MappingError::InvalidResponse(format!("Bad LOCATION URL: {}", e)))?;
    let gateway_ip = match url.host_str().and_then(|h| h.parse::<Ipv4Addr>().ok()) {
        Some(ip) => ip,
        None => {
            return Err(MappingError::InvalidResponse(format!(
                "LOCATION host is not an IPv4 address: {}",
                location
            )));
        }
    };

    let description = with_deadline(HTTP_TIMEOUT, async {
        let response = http.get(url).send().await?;
        Ok(response.text().await?)
    })
    .await?;

    let control_url = find_control_url(&description).ok_or_else(|| {
        MappingError::InvalidResponse("No WANIPConnection control URL in description".to_string())
    })?;

    Ok(ControlPoint {
        control_url: resolve_control_url(location, &control_url)?,
        gateway_ip,
    })
}

/// POST a SOAP action to a control URL
///
/// HTTP 200 is success; any other status is a gateway error, with the SOAP
/// fault's `<errorDescription>` used as the message when one is present.
async fn soap_post(
    http: &reqwest::Client,
    control_url: &str,
    action: &str,
    body: String,
) -> Result<(), MappingError> {
    let response = with_deadline(HTTP_TIMEOUT, async {
        Ok(http
            .post(control_url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", action)
            .body(body)
            .send()
            .await?)
    })
    .await?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let fault = response.text().await.unwrap_or_default();
    let message = extract_error_description(&fault)
        .unwrap_or_else(|| format!("SOAP request failed with HTTP {}", status.as_u16()));
    Err(MappingError::GatewayError(message))
}

/// Find the gateway for this session: the first discovered device whose
/// description yields a control URL
///
/// Devices without a usable control URL are skipped, but once one resolves
/// it owns the session; a later SOAP failure is not retried elsewhere.
async fn session_control_point(
    http: &reqwest::Client,
    ssdp_target: &str,
) -> Result<ControlPoint, MappingError> {
    let locations = discover_locations(ssdp_target).await?;
    if locations.is_empty() {
        return Err(MappingError::NoGateway);
    }

    let mut last_error = MappingError::NoGateway;
    for location in &locations {
        match resolve_control_point(http, location).await {
            Ok(point) => return Ok(point),
            Err(e) => {
                debug!("Skipping IGD at {}: {}", location, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// Discover the session IGD and request a UPnP mapping from it
///
/// The granted mapping always matches the request exactly: IGDs have no way
/// to assign a different external port or shorten the lease.
pub(crate) async fn request_mapping(
    http: &reqwest::Client,
    ssdp_target: &str,
    private_ips: &[Ipv4Addr],
    internal_port: u16,
    external_port: u16,
    lifetime_secs: u32,
    description: &str,
) -> Result<Mapping, MappingError> {
    info!(
        "Attempting UPnP mapping {} -> {} (lifetime: {}s)",
        internal_port, external_port, lifetime_secs
    );

    let point = session_control_point(http, ssdp_target).await?;
    let internal_ip = longest_prefix_match(private_ips, point.gateway_ip)
        .ok_or(MappingError::NoPrivateAddress)?;

    let body = build_add_request(
        external_port,
        internal_port,
        internal_ip,
        description,
        lifetime_secs,
    );
    soap_post(http, &point.control_url, SOAP_ADD, body).await?;

    info!(
        "UPnP mapping successful via {}: external port {}",
        point.control_url, external_port
    );
    Ok(Mapping {
        protocol: MappingProtocol::Upnp,
        internal_ip,
        internal_port,
        external_ip: None,
        external_port,
        lifetime_secs,
    })
}

/// Delete a UPnP mapping on the session IGD
pub(crate) async fn delete_mapping(
    http: &reqwest::Client,
    ssdp_target: &str,
    external_port: u16,
) -> bool {
    let point = match session_control_point(http, ssdp_target).await {
        Ok(point) => point,
        Err(e) => {
            debug!("UPnP delete discovery failed: {}", e);
            return false;
        }
    };

    let body = build_delete_request(external_port);
    match soap_post(http, &point.control_url, SOAP_DELETE, body).await {
        Ok(()) => {
            info!("UPnP mapping for external port {} deleted", external_port);
            true
        }
        Err(e) => {
            debug!("UPnP DeletePortMapping via {} failed: {}", point.control_url, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_search_request_format() {
        let request = build_search_request();
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(request.contains("ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_extract_location_case_insensitive() {
        let response = "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=120\r\nLocation: http://192.168.1.1:5000/rootDesc.xml\r\n\r\n";
        assert_eq!(
            extract_location(response),
            Some("http://192.168.1.1:5000/rootDesc.xml".to_string())
        );

        let lower = "HTTP/1.1 200 OK\r\nlocation: http://192.168.1.1:1900/igd.xml\r\n\r\n";
        assert_eq!(
            extract_location(lower),
            Some("http://192.168.1.1:1900/igd.xml".to_string())
        );
    }

    #[test]
    fn test_extract_location_missing() {
        assert_eq!(extract_location("HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n\r\n"), None);
    }

    #[test]
    fn test_find_control_url_after_wan_ip_connection() {
        let description = concat!(
            "<serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>",
            "<controlURL>/l3f</controlURL>",
            "<serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>",
            "<controlURL>/ctl/IPConn</controlURL>",
        );
        assert_eq!(find_control_url(description), Some("/ctl/IPConn".to_string()));
    }

    #[test]
    fn test_find_control_url_missing_service() {
        let description = "<serviceType>urn:schemas-upnp-org:service:WANPPPConnection:1</serviceType><controlURL>/ppp</controlURL>";
        assert_eq!(find_control_url(description), None);
    }

    #[test]
    fn test_resolve_control_url_relative_and_absolute() {
        let location = "http://192.168.1.1:5000/rootDesc.xml";
        assert_eq!(
            resolve_control_url(location, "/ctl/IPConn").unwrap(),
            "http://192.168.1.1:5000/ctl/IPConn"
        );
        assert_eq!(
            resolve_control_url(location, "http://192.168.1.1:49152/soap").unwrap(),
            "http://192.168.1.1:49152/soap"
        );
    }

    #[test]
    fn test_build_add_request_fields() {
        let body = build_add_request(50123, 8080, Ipv4Addr::new(192, 168, 1, 5), "portmap", 3600);
        assert!(body.contains("<u:AddPortMapping xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">"));
        assert!(body.contains("<NewExternalPort>50123</NewExternalPort>"));
        assert!(body.contains("<NewProtocol>UDP</NewProtocol>"));
        assert!(body.contains("<NewInternalPort>8080</NewInternalPort>"));
        assert!(body.contains("<NewInternalClient>192.168.1.5</NewInternalClient>"));
        assert!(body.contains("<NewEnabled>1</NewEnabled>"));
        assert!(body.contains("<NewPortMappingDescription>portmap</NewPortMappingDescription>"));
        assert!(body.contains("<NewLeaseDuration>3600</NewLeaseDuration>"));
    }

    #[test]
    fn test_build_delete_request_fields() {
        let body = build_delete_request(50123);
        assert!(body.contains("<u:DeletePortMapping xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">"));
        assert!(body.contains("<NewExternalPort>50123</NewExternalPort>"));
        assert!(body.contains("<NewProtocol>UDP</NewProtocol>"));
        assert!(!body.contains("NewInternalClient"));
    }

    #[test]
    fn test_extract_error_description() {
        let fault = concat!(
            "<s:Envelope><s:Body><s:Fault>",
            "<detail><UPnPError><errorCode>718</errorCode>",
            "<errorDescription>ConflictInMappingEntry</errorDescription>",
            "</UPnPError></detail>",
            "</s:Fault></s:Body></s:Envelope>",
        );
        assert_eq!(
            extract_error_description(fault),
            Some("ConflictInMappingEntry".to_string())
        );
        assert_eq!(extract_error_description("<s:Envelope/>"), None);
    }

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn header_end(data: &[u8]) -> Option<usize> {
        data.windows(4).position(|w| w == b"\r\n\r\n")
    }

    /// Read one HTTP request, honoring Content-Length so the response is
    /// not sent before the client finishes writing
    async fn read_request(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let Ok(n) = stream.read(&mut buf).await else { break };
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(end) = header_end(&data) {
                let headers = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
                let content_length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + content_length {
                    break;
                }
            }
        }
        data
    }

    /// Mock IGD: serves a description with a control URL, then answers
    /// AddPortMapping with 200 or a 718 fault
    async fn spawn_igd(accepts: bool, hits: Arc<AtomicUsize>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                hits.fetch_add(1, Ordering::SeqCst);

                let request = read_request(&mut stream).await;
                let request = String::from_utf8_lossy(&request);
                let (status, body) = if request.starts_with("GET") {
                    (
                        "200 OK",
                        concat!(
                            "<serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>",
                            "<controlURL>/ctl/IPConn</controlURL>",
                        ),
                    )
                } else if accepts {
                    ("200 OK", "<s:Envelope><s:Body/></s:Envelope>")
                } else {
                    (
                        "500 Internal Server Error",
                        "<errorDescription>ConflictInMappingEntry</errorDescription>",
                    )
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        port
    }

    /// Mock SSDP endpoint answering every search with one response per
    /// location, in order
    async fn spawn_ssdp_responder(locations: Vec<String>) -> String {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = socket.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((_, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                for location in &locations {
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\nLOCATION: {}\r\n\r\n",
                        location
                    );
                    let _ = socket.send_to(response.as_bytes(), &from).await;
                }
            }
        });

        target
    }

    #[tokio::test]
    async fn test_first_control_point_owns_the_session() {
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));
        let rejecting = spawn_igd(false, first_hits.clone()).await;
        let accepting = spawn_igd(true, second_hits.clone()).await;
        let target = spawn_ssdp_responder(vec![
            format!("http://127.0.0.1:{}/rootDesc.xml", rejecting),
            format!("http://127.0.0.1:{}/rootDesc.xml", accepting),
        ])
        .await;

        let http = reqwest::Client::new();
        let result = request_mapping(
            &http,
            &target,
            &[Ipv4Addr::new(127, 0, 0, 2)],
            8080,
            50123,
            120,
            "portmap-test",
        )
        .await;

        // The first device's SOAP fault decides the outcome
        match result {
            Err(MappingError::GatewayError(msg)) => assert_eq!(msg, "ConflictInMappingEntry"),
            other => panic!("expected the session gateway's fault, got {:?}", other),
        }
        assert!(first_hits.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            second_hits.load(Ordering::SeqCst),
            0,
            "later devices must not be contacted once a control URL resolved"
        );
    }
}
