//! Proxmox VE adapter: transport, client, resolver, driver, and the
//! multi-host lister, layered in that dependency order (§4.1–§4.5).

pub mod client;
pub mod driver;
pub mod multi_host;
pub mod resolver;
pub mod transport;

pub use client::{ProxmoxClient, ProxmoxNodeConfig};
pub use driver::ProxmoxDriver;
pub use multi_host::{MultiHostLister, ProxmoxHost};
pub use resolver::VMResolver;
pub use transport::{ApiToken, HttpMethod, HttpTransport, RawResponse, ReqwestTransport};
