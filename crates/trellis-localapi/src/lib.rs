//! Trellis local control API
//!
//! The daemon's IPC surface: an HTTP/1.1 server on a local transport,
//! multiplexing status, preferences, file transfer, debug, metrics and
//! DNS operations, with a per-connection capability gate and a
//! connection-hijacking dial-through path.

mod dial;
pub mod handler;
pub mod permit;
pub mod response;
pub mod server;

pub use handler::{Handler, DIAL_UPGRADE_PROTO, LOCALAPI_PREFIX, VERSION_HEADER};
pub use permit::{permit_for, PeerIdentity, Permit};
pub use response::{ApiBody, ApiError};
pub use server::{generate_token, Server};
