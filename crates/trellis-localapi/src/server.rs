//! Local API listeners
//!
//! Two transports, both local-only and without TLS:
//!
//!  - A Unix socket with mode 0600. The peer's uid comes from
//!    `SO_PEERCRED`, and each connection's permit is derived once at
//!    accept.
//!  - Loopback TCP for platforms without peer credentials. A one-shot
//!    token minted at startup is printed for clients; presenting it via
//!    basic auth is what grants read+write.
//!
//! Every accepted connection is served HTTP/1.1 by its own task, with
//! upgrades enabled for `/dial`.

use std::convert::Infallible;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, error, info};

use trellis_backend::LocalBackend;
use trellis_metrics::Registry;

use crate::handler::{rand_hex, Handler};
#[cfg(unix)]
use crate::permit::{permit_for, PeerIdentity};
use crate::permit::Permit;

/// The local API server: owns everything the per-connection handlers
/// share.
pub struct Server {
    backend: Arc<dyn LocalBackend>,
    metrics: Arc<Registry>,
    required_password: Option<String>,
    log_id: String,
    conns: trellis_metrics::Metric,
}

impl Server {
    pub fn new(backend: Arc<dyn LocalBackend>, metrics: Arc<Registry>, log_id: String) -> Self {
        let conns = metrics.new_counter("trellisd_localapi_conns");
        Self {
            backend,
            metrics,
            required_password: None,
            log_id,
            conns,
        }
    }

    /// Force all requests to carry this basic-auth password, on top of the
    /// transport-derived permits.
    pub fn with_required_password(mut self, password: Option<String>) -> Self {
        self.required_password = password;
        self
    }

    /// Listen on a Unix socket, deriving each connection's permit from
    /// its peer credentials. Runs until the task is dropped.
    #[cfg(unix)]
    pub async fn run_unix(self: Arc<Self>, path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A previous daemon may have left its socket behind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        let daemon_uid = unsafe { libc::getuid() };
        info!("local API listening on {}", path.display());

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    self.conns.add(1);
                    let identity = match stream.peer_cred() {
                        Ok(cred) => PeerIdentity::Uid(cred.uid()),
                        Err(e) => {
                            debug!("peer credentials unavailable: {e}");
                            PeerIdentity::Unknown
                        }
                    };
                    let permit = permit_for(identity, daemon_uid);
                    let handler = Arc::new(
                        Handler::new(
                            self.backend.clone(),
                            self.metrics.clone(),
                            permit,
                            self.log_id.clone(),
                        )
                        .with_required_password(self.required_password.clone()),
                    );
                    tokio::spawn(serve_conn(handler, stream));
                }
                Err(e) => {
                    error!("local API accept error: {e}");
                }
            }
        }
    }

    /// Listen on loopback TCP with token authentication. `token` should
    /// come from [`generate_token`] and be surfaced to clients out of
    /// band.
    pub async fn run_tcp(self: Arc<Self>, port: u16, token: String) -> io::Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr).await?;
        self.run_tcp_listener(listener, token).await
    }

    /// Like [`Server::run_tcp`], but on an already bound listener.
    pub async fn run_tcp_listener(
        self: Arc<Self>,
        listener: TcpListener,
        token: String,
    ) -> io::Result<()> {
        info!("local API listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    if !remote.ip().is_loopback() {
                        debug!("rejecting non-loopback local API connection from {remote}");
                        continue;
                    }
                    self.conns.add(1);
                    // No peer credentials on TCP: all authority comes from
                    // the token, checked per request.
                    let handler = Arc::new(
                        Handler::new(
                            self.backend.clone(),
                            self.metrics.clone(),
                            Permit::NONE,
                            self.log_id.clone(),
                        )
                        .with_required_password(self.required_password.clone())
                        .with_auth_token(Some(token.clone())),
                    );
                    tokio::spawn(serve_conn(handler, stream));
                }
                Err(e) => {
                    error!("local API accept error: {e}");
                }
            }
        }
    }
}

async fn serve_conn<S>(handler: Arc<Handler>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });
    if let Err(e) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        debug!("local API connection ended: {e}");
    }
}

/// Mint the per-process token for the loopback TCP transport. Rotates
/// every daemon start.
pub fn generate_token() -> String {
    rand_hex(16)
}
