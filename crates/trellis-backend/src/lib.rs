//! Trellis node backend contract
//!
//! The local API server and the DNS manager drive the node through the
//! [`LocalBackend`] trait defined here. The trait is a capability bundle:
//! handlers call it, never reach past it. The tunnel datapath, key exchange
//! and packet routing live behind it and are out of scope for this crate.

pub mod backend;
pub mod error;
pub mod mem;
pub mod prefs;
pub mod status;
pub mod types;

pub use backend::{BoxConn, Conn, Dialer, LocalBackend};
pub use error::{BackendError, BackendResult};
pub use mem::MemBackend;
pub use prefs::{MaskedPrefs, Prefs};
pub use status::{PeerStatus, Status};
pub use types::{
    DerpMap, DerpRegion, FileTarget, NetMap, Node, PingResult, PingType, StableNodeId,
    TokenRequest, UserProfile, WaitingFile, WhoIsResponse,
};

/// Capability version advertised in signed upstream requests.
pub const CAP_VERSION: u32 = 1;
