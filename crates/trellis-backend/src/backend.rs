//! The backend trait consumed by the local API

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::BackendResult;
use crate::prefs::{MaskedPrefs, Prefs};
use crate::status::Status;
use crate::types::{
    DerpMap, FileTarget, NetMap, PingResult, PingType, WaitingFile, WhoIsResponse,
};

/// A raw bidirectional byte stream.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// Owned connection handed across the backend boundary.
pub type BoxConn = Box<dyn Conn>;

/// Readable stream for a waiting file's contents.
pub type FileReader = Pin<Box<dyn AsyncRead + Send>>;

/// Outbound dialing capabilities of the node.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial a TCP address on behalf of a local client. The connection may
    /// cross the node's own tunnel.
    async fn user_dial(&self, addr: &str) -> BackendResult<BoxConn>;

    /// Open the authenticated transport to a peer's peer API, given its
    /// advertised base URL.
    async fn peer_api_dial(&self, peer_api_url: &str) -> BackendResult<BoxConn>;
}

/// Everything the local API needs from the node.
///
/// All exchanges across this boundary are values; callers never see tunnel
/// state. Implementations must make `edit_prefs` atomic: a patch that fails
/// validation leaves the stored preferences bit-identical.
#[async_trait]
pub trait LocalBackend: Send + Sync {
    /// Current status snapshot; `peers=false` elides the peer list.
    async fn status(&self, peers: bool) -> Status;

    /// Current preferences.
    async fn prefs(&self) -> Prefs;

    /// Apply a validated patch atomically, returning the new preferences.
    async fn edit_prefs(&self, mp: MaskedPrefs) -> BackendResult<Prefs>;

    /// Validate a candidate preferences value without committing it.
    async fn check_prefs(&self, prefs: Prefs) -> BackendResult<()>;

    /// Kick off an interactive login flow; returns immediately.
    async fn start_login_interactive(&self);

    /// Log out and block until the control plane acknowledges.
    async fn logout(&self) -> BackendResult<()>;

    /// Resolve a mesh `ip:port` to its node, owner and capabilities.
    async fn who_is(&self, addr: SocketAddr) -> Option<WhoIsResponse>;

    /// Files received from peers and not yet consumed.
    async fn waiting_files(&self) -> BackendResult<Vec<WaitingFile>>;

    /// Open a waiting file for reading; returns the stream and its size.
    async fn open_file(&self, name: &str) -> BackendResult<(FileReader, u64)>;

    /// Delete a waiting file by name.
    async fn delete_file(&self, name: &str) -> BackendResult<()>;

    /// Peers currently accepting direct file pushes.
    async fn file_targets(&self) -> BackendResult<Vec<FileTarget>>;

    /// Issue a typed probe to a peer IP.
    async fn ping(&self, ip: IpAddr, ping_type: PingType) -> BackendResult<PingResult>;

    /// Err describes why routed traffic would not be forwarded.
    async fn check_ip_forwarding(&self) -> BackendResult<()>;

    /// Re-bind the node's UDP sockets.
    async fn debug_rebind(&self) -> BackendResult<()>;

    /// Re-run endpoint discovery.
    async fn debug_restun(&self) -> BackendResult<()>;

    /// Publish a DNS TXT record through the coordination service
    /// (ACME DNS-01).
    async fn set_dns_txt(&self, name: &str, value: &str) -> BackendResult<()>;

    /// Advance the node-key expiry to no later than `unix_secs`.
    async fn set_expiry_sooner(&self, unix_secs: i64) -> BackendResult<()>;

    /// Current relay map, if any.
    async fn derp_map(&self) -> Option<DerpMap>;

    /// Current network map, if any.
    async fn net_map(&self) -> Option<NetMap>;

    /// Perform a node-key-signed HTTP round trip against the coordination
    /// service. Returns the upstream status and body verbatim.
    async fn do_upstream_request(
        &self,
        method: &str,
        path: &str,
        body: Vec<u8>,
    ) -> BackendResult<(u16, Vec<u8>)>;

    /// Fetch (or mint) the TLS certificate and key for one of this node's
    /// DNS names, both PEM encoded.
    async fn cert_pair(&self, domain: &str) -> BackendResult<(Vec<u8>, Vec<u8>)>;

    /// The node's outbound dialer.
    fn dialer(&self) -> Arc<dyn Dialer>;
}
