//! DNS manager
//!
//! Takes the logical DNS policy handed down by the node, compiles it
//! against the host's capabilities into an OS-level config plus an
//! in-daemon forwarder config, and imposes both. The compilation is pure:
//! the same (policy, split capability, base config) triple always yields
//! the same pair of outputs.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::{DnsConfig, OsConfig, Resolver, ResolverConfig, MESH_DNS_IP};
use crate::error::{DnsError, DnsResult};
use crate::fqdn::Fqdn;
use crate::os::OsConfigurator;

/// Consumer of compiled forwarder configs, normally the in-daemon
/// resolver.
pub trait ResolverSink: Send + Sync {
    fn set_config(&self, cfg: ResolverConfig);
}

/// Sink that only logs; for nodes running without the in-daemon resolver.
pub struct LoggingSink;

impl ResolverSink for LoggingSink {
    fn set_config(&self, cfg: ResolverConfig) {
        debug!(
            routes = cfg.routes.len(),
            hosts = cfg.hosts.len(),
            local_domains = cfg.local_domains.len(),
            "resolver config updated"
        );
    }
}

/// Compile a logical policy into the forwarder config and the OS config.
///
/// `os` supplies only the host's split capability and, when split has to
/// be simulated, its pre-existing base configuration.
pub fn compile(cfg: &DnsConfig, os: &dyn OsConfigurator) -> DnsResult<(ResolverConfig, OsConfig)> {
    let mut rcfg = ResolverConfig::default();
    let mut ocfg = OsConfig::default();

    // Nothing is routed or overridden: the OS keeps its resolvers, we
    // keep the static hosts, and only the search list changes.
    if !cfg.needs_os_resolver() {
        rcfg.hosts = cfg.hosts.clone();
        ocfg.search_domains = cfg.search_domains.clone();
        return Ok((rcfg, ocfg));
    }

    // Plain-IP default resolvers and nothing else: hand them straight to
    // the OS and stay out of the query path entirely.
    if cfg.has_default_ip_resolvers_only() {
        ocfg.nameservers = ips_only(&cfg.default_resolvers);
        ocfg.search_domains = cfg.search_domains.clone();
        return Ok((rcfg, ocfg));
    }

    // Split the routes: an empty upstream list means the suffix is
    // answered locally, anything else is forwarded.
    let mut forwarded = std::collections::BTreeMap::new();
    for (suffix, resolvers) in &cfg.routes {
        if resolvers.is_empty() {
            rcfg.local_domains.push(suffix.clone());
        } else {
            forwarded.insert(suffix.clone(), resolvers.clone());
        }
    }

    if cfg.has_default_resolvers() {
        // We are the primary resolver and something else is going on too
        // (routes, hosts, or non-IP defaults): every query funnels
        // through the in-daemon resolver.
        rcfg.routes = forwarded;
        rcfg.routes.insert(Fqdn::root(), cfg.default_resolvers.clone());
        rcfg.hosts = cfg.hosts.clone();
        ocfg.nameservers = vec![MESH_DNS_IP];
        ocfg.search_domains = cfg.search_domains.clone();
        return Ok((rcfg, ocfg));
    }

    // Only some suffixes are overridden.
    if os.supports_split_dns() {
        // If all split suffixes go to one set of plain-IP resolvers and
        // nothing needs local answers, the OS can do the whole job.
        if rcfg.local_domains.is_empty() && cfg.hosts.is_empty() {
            if let Some(set) = cfg.single_resolver_set() {
                let ips = ips_only(set);
                if ips.len() == set.len() {
                    ocfg.nameservers = ips;
                    ocfg.search_domains = cfg.search_domains.clone();
                    ocfg.match_domains = cfg.match_domains();
                    return Ok((ResolverConfig::default(), ocfg));
                }
            }
        }
        rcfg.routes = forwarded;
        rcfg.hosts = cfg.hosts.clone();
        ocfg.nameservers = vec![MESH_DNS_IP];
        ocfg.search_domains = cfg.search_domains.clone();
        ocfg.match_domains = cfg.match_domains();
        return Ok((rcfg, ocfg));
    }

    // The host cannot split, so we simulate it: we become the primary
    // resolver and forward everything that is not overridden to whatever
    // the host was using before.
    let base = os.get_base_config()?;
    rcfg.routes = forwarded;
    rcfg.routes.insert(
        Fqdn::root(),
        base.nameservers.iter().map(Resolver::from_ip).collect(),
    );
    rcfg.hosts = cfg.hosts.clone();
    ocfg.nameservers = vec![MESH_DNS_IP];
    ocfg.search_domains = cfg.search_domains.clone();
    for dom in base.search_domains {
        if !ocfg.search_domains.contains(&dom) {
            ocfg.search_domains.push(dom);
        }
    }
    Ok((rcfg, ocfg))
}

fn ips_only(resolvers: &[Resolver]) -> Vec<std::net::IpAddr> {
    resolvers.iter().filter_map(|r| r.ip_addr()).collect()
}

/// Owns the host configurator and the forwarder sink; serializes every
/// mutation.
pub struct Manager {
    os: Arc<dyn OsConfigurator>,
    sink: Arc<dyn ResolverSink>,
    lock: Mutex<()>,
}

impl Manager {
    pub fn new(os: Arc<dyn OsConfigurator>, sink: Arc<dyn ResolverSink>) -> Self {
        Self {
            os,
            sink,
            lock: Mutex::new(()),
        }
    }

    /// Compile and apply `cfg`. The forwarder is reconfigured before the
    /// OS flips, so queries arriving mid-transition still get answers.
    pub fn set(&self, cfg: &DnsConfig) -> DnsResult<()> {
        let _guard = self.lock.lock().unwrap();
        let (rcfg, ocfg) = compile(cfg, self.os.as_ref())?;
        // The compiler never emits split output for a non-split host;
        // this guard is the last line against that invariant breaking.
        if !ocfg.match_domains.is_empty() && !self.os.supports_split_dns() {
            return Err(DnsError::SplitNotSupported);
        }
        debug!(
            nameservers = ocfg.nameservers.len(),
            match_domains = ocfg.match_domains.len(),
            routes = rcfg.routes.len(),
            "applying DNS configuration"
        );
        self.sink.set_config(rcfg);
        self.os.set_dns(&ocfg)?;
        Ok(())
    }

    /// Tear down: clear the forwarder and restore the host.
    pub fn close(&self) -> DnsResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.sink.set_config(ResolverConfig::default());
        self.os.close()?;
        info!("DNS configuration cleared");
        Ok(())
    }
}
