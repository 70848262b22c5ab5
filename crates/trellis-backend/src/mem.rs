//! In-memory backend
//!
//! A complete [`LocalBackend`] implementation with no tunnel underneath.
//! The daemon uses it in dev mode and the local API tests run against it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::backend::{BoxConn, Dialer, FileReader, LocalBackend};
use crate::error::{BackendError, BackendResult};
use crate::prefs::{MaskedPrefs, Prefs};
use crate::status::{PeerStatus, Status};
use crate::types::{
    DerpMap, FileTarget, NetMap, Node, PingResult, PingType, StableNodeId, UserProfile,
    WaitingFile, WhoIsResponse,
};

/// A peer as held by the in-memory backend.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub node: Node,
    pub user: UserProfile,
    pub caps: Vec<String>,
}

/// Dialer that opens plain TCP connections; no tunnel crossing.
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn user_dial(&self, addr: &str) -> BackendResult<BoxConn> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BackendError::Dial(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn peer_api_dial(&self, peer_api_url: &str) -> BackendResult<BoxConn> {
        let url = url::Url::parse(peer_api_url)
            .map_err(|e| BackendError::Dial(format!("bad peer API URL: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| BackendError::Dial("peer API URL has no host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| BackendError::Dial("peer API URL has no port".to_string()))?;
        self.user_dial(&format!("{host}:{port}")).await
    }
}

/// In-memory [`LocalBackend`].
pub struct MemBackend {
    prefs: RwLock<Prefs>,
    netmap: RwLock<Option<NetMap>>,
    derp_map: RwLock<Option<DerpMap>>,
    peers: RwLock<Vec<PeerEntry>>,
    file_targets: RwLock<Vec<FileTarget>>,
    /// Spool directory for waiting files; `None` means no file sharing.
    file_dir: Option<PathBuf>,
    cert_dir: Option<PathBuf>,
    txt_records: RwLock<HashMap<String, String>>,
    key_expiry: RwLock<Option<i64>>,
    /// Canned reply for signed upstream requests.
    upstream: RwLock<Option<(u16, Vec<u8>)>>,
    dialer: Arc<dyn Dialer>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            prefs: RwLock::new(Prefs::default()),
            netmap: RwLock::new(None),
            derp_map: RwLock::new(None),
            peers: RwLock::new(Vec::new()),
            file_targets: RwLock::new(Vec::new()),
            file_dir: None,
            cert_dir: None,
            txt_records: RwLock::new(HashMap::new()),
            key_expiry: RwLock::new(None),
            upstream: RwLock::new(None),
            dialer: Arc::new(DirectDialer),
        }
    }

    /// Use `dir` as the waiting-file spool.
    pub fn with_file_dir(mut self, dir: PathBuf) -> Self {
        self.file_dir = Some(dir);
        self
    }

    /// Serve `cert_pair` from `<dir>/<domain>.crt` and `<dir>/<domain>.key`.
    pub fn with_cert_dir(mut self, dir: PathBuf) -> Self {
        self.cert_dir = Some(dir);
        self
    }

    pub async fn set_netmap(&self, nm: Option<NetMap>) {
        *self.netmap.write().await = nm;
    }

    pub async fn set_derp_map(&self, dm: Option<DerpMap>) {
        *self.derp_map.write().await = dm;
    }

    pub async fn add_peer(&self, node: Node, user: UserProfile, caps: Vec<String>) {
        self.peers.write().await.push(PeerEntry { node, user, caps });
    }

    pub async fn set_file_targets(&self, targets: Vec<FileTarget>) {
        *self.file_targets.write().await = targets;
    }

    /// Set the reply `do_upstream_request` relays.
    pub async fn set_upstream_response(&self, status: u16, body: Vec<u8>) {
        *self.upstream.write().await = Some((status, body));
    }

    pub async fn txt_record(&self, name: &str) -> Option<String> {
        self.txt_records.read().await.get(name).cloned()
    }

    pub async fn key_expiry(&self) -> Option<i64> {
        *self.key_expiry.read().await
    }

    fn file_path(&self, name: &str) -> BackendResult<PathBuf> {
        let dir = self
            .file_dir
            .as_ref()
            .ok_or_else(|| BackendError::Other("file sharing not configured".to_string()))?;
        // Waiting files are flat; reject anything that could escape the
        // spool directory.
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
        {
            return Err(BackendError::FileNotFound(name.to_string()));
        }
        Ok(dir.join(name))
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalBackend for MemBackend {
    async fn status(&self, peers: bool) -> Status {
        let prefs = self.prefs.read().await;
        let netmap = self.netmap.read().await;

        let backend_state = match (netmap.as_ref(), prefs.want_running) {
            (None, _) => "NeedsLogin",
            (Some(_), true) => "Running",
            (Some(_), false) => "Stopped",
        };

        let host_name = if prefs.hostname.is_empty() {
            "trellis-node".to_string()
        } else {
            prefs.hostname.clone()
        };
        let self_node = PeerStatus {
            id: 0,
            stable_id: StableNodeId("self".to_string()),
            host_name,
            dns_name: netmap.as_ref().map(|nm| nm.name.clone()).unwrap_or_default(),
            addresses: Vec::new(),
            online: netmap.is_some() && prefs.want_running,
            last_seen: None,
        };

        let peer_list = if peers {
            let peers = self.peers.read().await;
            Some(
                peers
                    .iter()
                    .map(|p| PeerStatus {
                        id: p.node.id,
                        stable_id: p.node.stable_id.clone(),
                        host_name: p.node.name.trim_end_matches('.').to_string(),
                        dns_name: p.node.name.clone(),
                        addresses: p.node.addresses.clone(),
                        online: p.node.online,
                        last_seen: None,
                    })
                    .collect(),
            )
        } else {
            None
        };

        Status {
            backend_state: backend_state.to_string(),
            self_node,
            peers: peer_list,
            dns_suffix: netmap.as_ref().map(|nm| nm.domain.clone()).unwrap_or_default(),
        }
    }

    async fn prefs(&self) -> Prefs {
        self.prefs.read().await.clone()
    }

    async fn edit_prefs(&self, mp: MaskedPrefs) -> BackendResult<Prefs> {
        let mut prefs = self.prefs.write().await;
        let mut candidate = prefs.clone();
        mp.apply(&mut candidate);
        candidate
            .validate()
            .map_err(BackendError::InvalidPrefs)?;
        *prefs = candidate.clone();
        info!("prefs updated");
        Ok(candidate)
    }

    async fn check_prefs(&self, prefs: Prefs) -> BackendResult<()> {
        prefs.validate().map_err(BackendError::InvalidPrefs)
    }

    async fn start_login_interactive(&self) {
        info!("interactive login requested");
    }

    async fn logout(&self) -> BackendResult<()> {
        *self.netmap.write().await = None;
        self.prefs.write().await.want_running = false;
        info!("logged out");
        Ok(())
    }

    async fn who_is(&self, addr: SocketAddr) -> Option<WhoIsResponse> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .find(|p| p.node.addresses.contains(&addr.ip()))
            .map(|p| WhoIsResponse {
                node: p.node.clone(),
                user_profile: p.user.clone(),
                caps: p.caps.clone(),
            })
    }

    async fn waiting_files(&self) -> BackendResult<Vec<WaitingFile>> {
        let dir = match &self.file_dir {
            Some(dir) => dir.clone(),
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            out.push(WaitingFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn open_file(&self, name: &str) -> BackendResult<(FileReader, u64)> {
        let path = self.file_path(name)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::FileNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok((Box::pin(file), size))
    }

    async fn delete_file(&self, name: &str) -> BackendResult<()> {
        let path = self.file_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::FileNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn file_targets(&self) -> BackendResult<Vec<FileTarget>> {
        if self.netmap.read().await.is_none() {
            return Err(BackendError::NoNetMap);
        }
        Ok(self.file_targets.read().await.clone())
    }

    async fn ping(&self, ip: IpAddr, ping_type: PingType) -> BackendResult<PingResult> {
        let peers = self.peers.read().await;
        let peer = peers
            .iter()
            .find(|p| p.node.addresses.contains(&ip))
            .ok_or(BackendError::UnknownPeer)?;
        debug!(%ip, ?ping_type, "ping");
        Ok(PingResult {
            ip,
            latency_ms: 0.0,
            endpoint: peer.node.online.then(|| format!("{ip}:0")),
            derp_region_id: None,
        })
    }

    async fn check_ip_forwarding(&self) -> BackendResult<()> {
        let prefs = self.prefs.read().await;
        if prefs.advertise_routes.is_empty() {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            let v = tokio::fs::read_to_string("/proc/sys/net/ipv4/ip_forward")
                .await
                .unwrap_or_default();
            if v.trim() != "1" {
                return Err(BackendError::Other(
                    "subnet routes are advertised but IP forwarding is disabled; \
                     set net.ipv4.ip_forward=1"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn debug_rebind(&self) -> BackendResult<()> {
        info!("rebind requested");
        Ok(())
    }

    async fn debug_restun(&self) -> BackendResult<()> {
        info!("re-STUN requested");
        Ok(())
    }

    async fn set_dns_txt(&self, name: &str, value: &str) -> BackendResult<()> {
        if self.netmap.read().await.is_none() {
            return Err(BackendError::NoNetMap);
        }
        self.txt_records
            .write()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn set_expiry_sooner(&self, unix_secs: i64) -> BackendResult<()> {
        if self.netmap.read().await.is_none() {
            return Err(BackendError::NoNetMap);
        }
        let mut expiry = self.key_expiry.write().await;
        match *expiry {
            Some(cur) if cur <= unix_secs => {}
            _ => *expiry = Some(unix_secs),
        }
        Ok(())
    }

    async fn derp_map(&self) -> Option<DerpMap> {
        self.derp_map.read().await.clone()
    }

    async fn net_map(&self) -> Option<NetMap> {
        self.netmap.read().await.clone()
    }

    async fn do_upstream_request(
        &self,
        method: &str,
        path: &str,
        _body: Vec<u8>,
    ) -> BackendResult<(u16, Vec<u8>)> {
        debug!(method, path, "upstream request");
        self.upstream
            .read()
            .await
            .clone()
            .ok_or_else(|| BackendError::Upstream("no control connection".to_string()))
    }

    async fn cert_pair(&self, domain: &str) -> BackendResult<(Vec<u8>, Vec<u8>)> {
        let dir = self
            .cert_dir
            .as_ref()
            .ok_or(BackendError::Unsupported)?;
        if domain.is_empty() || domain.contains('/') || domain.contains('\\') {
            return Err(BackendError::FileNotFound(domain.to_string()));
        }
        let cert = tokio::fs::read(dir.join(format!("{domain}.crt")))
            .await
            .map_err(|_| BackendError::FileNotFound(domain.to_string()))?;
        let key = tokio::fs::read(dir.join(format!("{domain}.key")))
            .await
            .map_err(|_| BackendError::FileNotFound(domain.to_string()))?;
        Ok((cert, key))
    }

    fn dialer(&self) -> Arc<dyn Dialer> {
        self.dialer.clone()
    }
}
