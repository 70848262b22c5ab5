//! DNS subsystem errors

use thiserror::Error;

/// Errors from compiling or applying DNS configuration
#[derive(Debug, Error)]
pub enum DnsError {
    /// Caller asked for per-suffix routing on a host that cannot do it
    #[error("split DNS is not supported on this host")]
    SplitNotSupported,

    /// Host cannot report its pre-existing DNS configuration
    #[error("reading the host's base DNS configuration is not supported")]
    BaseConfigNotSupported,

    /// Malformed domain name
    #[error("invalid domain name {0:?}")]
    InvalidName(String),

    /// I/O against resolv.conf, the registry, or helper processes
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything else the host reports
    #[error("{0}")]
    Other(String),
}

/// Result type for DNS operations
pub type DnsResult<T> = Result<T, DnsError>;
