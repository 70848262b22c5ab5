//! Node status snapshots

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::types::StableNodeId;

/// One node's view in a status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: u64,
    pub stable_id: StableNodeId,
    pub host_name: String,
    /// MagicDNS name, trailing dot included.
    pub dns_name: String,
    pub addresses: Vec<IpAddr>,
    pub online: bool,
    /// Unix seconds of last activity, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

/// Snapshot of the whole node as reported to local clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    /// State machine name: "NoState", "NeedsLogin", "Stopped", "Running".
    pub backend_state: String,
    pub self_node: PeerStatus,
    /// Peer list; omitted when the client asked for `peers=false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<PeerStatus>>,
    /// The mesh's MagicDNS suffix, if logged in.
    pub dns_suffix: String,
}
