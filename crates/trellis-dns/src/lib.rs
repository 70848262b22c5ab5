//! Trellis DNS management
//!
//! Composes the node-provided DNS policy with the host's existing
//! configuration and imposes the result on the host, either as the
//! primary resolver or as per-suffix split DNS:
//! - Policy compilation (pure)
//! - Host configurators (resolv.conf, Windows registry/NRPT)
//! - Teardown and restore on shutdown

pub mod config;
pub mod error;
pub mod fqdn;
pub mod manager;
pub mod os;

pub use config::{DnsConfig, OsConfig, Resolver, ResolverConfig, MESH_DNS_IP};
pub use error::{DnsError, DnsResult};
pub use fqdn::Fqdn;
pub use manager::{compile, LoggingSink, Manager, ResolverSink};
pub use os::{DirectOsConfigurator, NoopOsConfigurator, OsConfigurator};
#[cfg(windows)]
pub use os::windows::WindowsOsConfigurator;
