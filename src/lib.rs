//! portmap - Automatic NAT port mapping
//!
//! This library opens UDP port mappings on the local gateway using whichever
//! of the three common mapping protocols the gateway speaks, falling back
//! from NAT-PMP (RFC 6886) to PCP (RFC 6887) to UPnP IGD. Mappings are
//! tracked in a registry and renewed or expired in the background for as
//! long as the [`PortMapper`] lives.
//!
//! # Example
//!
//! ```no_run
//! use portmap::PortMapper;
//!
//! # async fn run() -> Result<(), portmap::MappingError> {
//! let mapper = PortMapper::new();
//!
//! // Expose local UDP port 8080 as external port 50123 for an hour
//! let mapping = mapper.add_mapping(8080, 50123, 3600).await?;
//! println!("mapped via {}", mapping.protocol.name());
//!
//! // Release everything before shutdown
//! mapper.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod deadline;
pub mod gateway;
mod natpmp;
mod pcp;
pub mod resolver;
pub mod types;
mod upnp;

mod mapper;

pub use mapper::{PortMapper, PortMapperConfig};
pub use resolver::{AddressSource, SystemAddressSource};
pub use types::{Mapping, MappingError, MappingProtocol, ProtocolSupport};

/// Initialize the portmap library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}
