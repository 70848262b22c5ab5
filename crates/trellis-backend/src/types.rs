//! Core data model shared across the control plane

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Stable node identifier, assigned at first registration and kept for the
/// node's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StableNodeId(pub String);

impl std::fmt::Display for StableNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user known to the coordination service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: u64,
    pub login_name: String,
    pub display_name: String,
}

/// A node as seen in the network map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub stable_id: StableNodeId,
    /// MagicDNS name, trailing dot included.
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub online: bool,
}

/// Result of resolving a mesh address to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoIsResponse {
    pub node: Node,
    pub user_profile: UserProfile,
    /// Capability strings granted to the peer by policy.
    pub caps: Vec<String>,
}

/// A peer that currently accepts direct file pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTarget {
    pub node: Node,
    /// Base URL of the peer's peer API, reachable via the mesh dialer.
    pub peer_api_url: String,
}

/// A file received from a peer and not yet consumed locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingFile {
    pub name: String,
    pub size: u64,
}

/// Probe flavor for `ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingType {
    /// Path discovery probe over the control channel
    Disco,
    /// In-tunnel probe answered by the peer's daemon
    Tsmp,
    /// Plain ICMP echo through the tunnel
    Icmp,
}

impl std::str::FromStr for PingType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disco" => Ok(PingType::Disco),
            "tsmp" => Ok(PingType::Tsmp),
            "icmp" => Ok(PingType::Icmp),
            _ => Err(()),
        }
    }
}

/// Result of a typed probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub ip: IpAddr,
    pub latency_ms: f64,
    /// Direct endpoint used, if the path was direct.
    pub endpoint: Option<String>,
    /// Relay region used, if the path was relayed.
    pub derp_region_id: Option<u16>,
}

/// One relay region in the relay map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerpRegion {
    pub region_id: u16,
    pub region_code: String,
    pub hostname: String,
}

/// Snapshot of the relay map the node currently uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerpMap {
    pub regions: Vec<DerpRegion>,
}

/// The slice of the network map the control plane needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetMap {
    /// This node's public key, hex encoded.
    pub node_key: String,
    /// This node's MagicDNS name, trailing dot included.
    pub name: String,
    /// The mesh's MagicDNS suffix.
    pub domain: String,
}

/// Body of the signed id-token request relayed upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub cap_version: u32,
    pub audience: String,
    pub node_key: String,
}
