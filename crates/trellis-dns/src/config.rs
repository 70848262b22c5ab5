//! DNS configuration types
//!
//! Three layers: [`DnsConfig`] is the logical policy the node hands down,
//! [`OsConfig`] is what gets imposed on the host, and [`ResolverConfig`] is
//! what the in-daemon forwarder consumes. The compiler in [`crate::manager`]
//! turns the first into the other two.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::fqdn::Fqdn;

/// The mesh service IP the OS is pointed at whenever the in-daemon
/// resolver has to see queries.
pub const MESH_DNS_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(100, 100, 100, 100));

/// Where queries for some suffix should be sent: a UDP `ip[:port]`
/// or a DNS-over-HTTPS URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolver {
    pub addr: String,
}

impl Resolver {
    pub fn new(addr: impl Into<String>) -> Resolver {
        Resolver { addr: addr.into() }
    }

    pub fn from_ip(ip: &IpAddr) -> Resolver {
        Resolver { addr: ip.to_string() }
    }

    /// The resolver's IP, if it is a plain UDP resolver on port 53.
    /// DoH URLs and nonstandard ports return `None`.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        if let Ok(ip) = self.addr.parse::<IpAddr>() {
            return Some(ip);
        }
        if let Ok(sa) = self.addr.parse::<SocketAddr>() {
            if sa.port() == 53 {
                return Some(sa.ip());
            }
        }
        None
    }
}

/// The logical DNS policy supplied by the node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Resolvers for all queries not matched by `routes`. Non-empty means
    /// the daemon becomes the host's primary resolver.
    #[serde(default)]
    pub default_resolvers: Vec<Resolver>,
    /// Per-suffix upstreams. An empty list means the suffix is answered
    /// locally (magic DNS).
    #[serde(default)]
    pub routes: BTreeMap<Fqdn, Vec<Resolver>>,
    /// Suffixes appended to unqualified names.
    #[serde(default)]
    pub search_domains: Vec<Fqdn>,
    /// Static answers served by the in-daemon resolver.
    #[serde(default)]
    pub hosts: BTreeMap<Fqdn, Vec<IpAddr>>,
}

impl DnsConfig {
    pub fn is_empty(&self) -> bool {
        self.default_resolvers.is_empty()
            && self.routes.is_empty()
            && self.search_domains.is_empty()
            && self.hosts.is_empty()
    }

    pub(crate) fn has_default_resolvers(&self) -> bool {
        !self.default_resolvers.is_empty()
    }

    pub(crate) fn has_routes(&self) -> bool {
        !self.routes.is_empty()
    }

    /// Whether any queries have to flow through the daemon or an
    /// overridden OS resolver at all.
    pub(crate) fn needs_os_resolver(&self) -> bool {
        self.has_default_resolvers() || self.has_routes()
    }

    /// True when the config is nothing but plain-IP default resolvers,
    /// which the OS can be handed directly.
    pub(crate) fn has_default_ip_resolvers_only(&self) -> bool {
        self.has_default_resolvers()
            && !self.has_routes()
            && self
                .default_resolvers
                .iter()
                .all(|r| r.ip_addr().is_some())
    }

    /// If every route forwards to the same non-empty resolver set, that
    /// set; otherwise `None`.
    pub(crate) fn single_resolver_set(&self) -> Option<&Vec<Resolver>> {
        let mut iter = self.routes.values();
        let first = iter.next()?;
        if first.is_empty() {
            return None;
        }
        for set in iter {
            if set != first {
                return None;
            }
        }
        Some(first)
    }

    /// Every route suffix, sorted and deduplicated; what the OS should
    /// match on in split mode.
    pub(crate) fn match_domains(&self) -> Vec<Fqdn> {
        self.routes.keys().cloned().collect()
    }
}

/// What the OS is told to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsConfig {
    /// Resolvers the OS should use. Empty leaves the OS alone.
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
    /// Search list written on our interface.
    #[serde(default)]
    pub search_domains: Vec<Fqdn>,
    /// If non-empty the OS is in split mode: only these suffixes are
    /// resolved through `nameservers`.
    #[serde(default)]
    pub match_domains: Vec<Fqdn>,
}

impl OsConfig {
    pub fn is_zero(&self) -> bool {
        self.nameservers.is_empty() && self.search_domains.is_empty() && self.match_domains.is_empty()
    }
}

/// What the in-daemon forwarder is told to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Per-suffix upstreams; the root key `"."` is the default route.
    #[serde(default)]
    pub routes: BTreeMap<Fqdn, Vec<Resolver>>,
    /// Static answers.
    #[serde(default)]
    pub hosts: BTreeMap<Fqdn, Vec<IpAddr>>,
    /// Suffixes answered authoritatively: a miss inside one of these is
    /// NXDOMAIN, never forwarded.
    #[serde(default)]
    pub local_domains: Vec<Fqdn>,
}

impl ResolverConfig {
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.hosts.is_empty() && self.local_domains.is_empty()
    }

    /// Longest-suffix route lookup for `name`.
    pub fn route_for(&self, name: &Fqdn) -> Option<(&Fqdn, &Vec<Resolver>)> {
        self.routes
            .iter()
            .filter(|(suffix, _)| suffix.contains(name))
            .max_by_key(|(suffix, _)| suffix.as_str().len())
    }
}
