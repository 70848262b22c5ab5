//! Host DNS configurators
//!
//! An [`OsConfigurator`] knows how to impose an [`OsConfig`] on one
//! platform and how to take it back off. The compiler consults
//! `supports_split_dns` before emitting split output, so a configurator
//! receiving `match_domains` it cannot honor may simply refuse.

use crate::config::OsConfig;
use crate::error::DnsResult;

pub mod direct;
#[cfg(windows)]
pub mod windows;

pub use direct::DirectOsConfigurator;

/// Platform-specific application of a compiled OS DNS policy.
pub trait OsConfigurator: Send + Sync {
    /// Impose `cfg` on the host. Passing a zero config clears all state
    /// this configurator owns; the call is idempotent.
    fn set_dns(&self, cfg: &OsConfig) -> DnsResult<()>;

    /// Whether the host can route queries per suffix while leaving its
    /// primary resolver alone.
    fn supports_split_dns(&self) -> bool;

    /// The host's DNS configuration from before we touched it. Used to
    /// simulate split DNS on hosts that cannot do it natively.
    fn get_base_config(&self) -> DnsResult<OsConfig>;

    /// Clear our configuration and release any long-lived handles.
    fn close(&self) -> DnsResult<()>;
}

/// Configurator that does nothing; for platforms without host
/// integration and for tests.
#[derive(Default)]
pub struct NoopOsConfigurator;

impl OsConfigurator for NoopOsConfigurator {
    fn set_dns(&self, _cfg: &OsConfig) -> DnsResult<()> {
        Ok(())
    }

    fn supports_split_dns(&self) -> bool {
        false
    }

    fn get_base_config(&self) -> DnsResult<OsConfig> {
        Ok(OsConfig::default())
    }

    fn close(&self) -> DnsResult<()> {
        Ok(())
    }
}
