//! Node preferences
//!
//! Preferences describe desired node behavior. Clients either replace the
//! whole value or send a [`MaskedPrefs`] patch carrying only the fields to
//! change. Patches are validated against the merged result and applied
//! atomically; a failed patch leaves the previous preferences untouched.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Desired node behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prefs {
    /// Coordination server base URL.
    pub control_url: String,
    /// Whether the node should be up at all.
    pub want_running: bool,
    /// Whether to accept the mesh-provided DNS configuration.
    pub corp_dns: bool,
    /// Whether to accept subnet routes advertised by peers.
    pub accept_routes: bool,
    /// Mesh IP of the exit node to route through, if any.
    pub exit_node: Option<IpAddr>,
    /// Subnet routes this node advertises, as CIDR strings.
    pub advertise_routes: Vec<String>,
    /// Drop all inbound connections.
    pub shields_up: bool,
    /// Hostname override; empty means use the OS hostname.
    pub hostname: String,
    /// Non-root user allowed to operate the daemon.
    pub operator_user: String,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            control_url: "https://login.trellis.net".to_string(),
            want_running: false,
            corp_dns: true,
            accept_routes: false,
            exit_node: None,
            advertise_routes: Vec::new(),
            shields_up: false,
            hostname: String::new(),
            operator_user: String::new(),
        }
    }
}

impl Prefs {
    /// Validate the preferences as a whole.
    pub fn validate(&self) -> Result<(), String> {
        if !self.control_url.is_empty()
            && !self.control_url.starts_with("https://")
            && !self.control_url.starts_with("http://")
        {
            return Err(format!("control URL {:?} is not an HTTP(S) URL", self.control_url));
        }
        if !self.hostname.is_empty() {
            if self.hostname.len() > 63 {
                return Err("hostname too long (max 63 bytes)".to_string());
            }
            if !self
                .hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(format!("hostname {:?} contains invalid characters", self.hostname));
            }
        }
        let mut advertises_default = false;
        for route in &self.advertise_routes {
            let net: IpNet = route
                .parse()
                .map_err(|_| format!("invalid advertised route {route:?}"))?;
            if net.prefix_len() == 0 {
                advertises_default = true;
            }
        }
        if advertises_default && self.exit_node.is_some() {
            return Err("cannot advertise an exit route and use an exit node at the same time"
                .to_string());
        }
        Ok(())
    }
}

/// A preferences patch: only the populated fields are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskedPrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub want_running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corp_dns: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_routes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_node: Option<Option<IpAddr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_routes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shields_up: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_user: Option<String>,
}

impl MaskedPrefs {
    /// Apply the populated fields onto `prefs`.
    pub fn apply(&self, prefs: &mut Prefs) {
        if let Some(v) = &self.control_url {
            prefs.control_url = v.clone();
        }
        if let Some(v) = self.want_running {
            prefs.want_running = v;
        }
        if let Some(v) = self.corp_dns {
            prefs.corp_dns = v;
        }
        if let Some(v) = self.accept_routes {
            prefs.accept_routes = v;
        }
        if let Some(v) = self.exit_node {
            prefs.exit_node = v;
        }
        if let Some(v) = &self.advertise_routes {
            prefs.advertise_routes = v.clone();
        }
        if let Some(v) = self.shields_up {
            prefs.shields_up = v;
        }
        if let Some(v) = &self.hostname {
            prefs.hostname = v.clone();
        }
        if let Some(v) = &self.operator_user {
            prefs.operator_user = v.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_only_touches_masked_fields() {
        let mut prefs = Prefs::default();
        prefs.hostname = "box".to_string();

        let mp = MaskedPrefs {
            want_running: Some(true),
            advertise_routes: Some(vec!["10.1.0.0/16".to_string()]),
            ..Default::default()
        };
        mp.apply(&mut prefs);

        assert!(prefs.want_running);
        assert_eq!(prefs.advertise_routes, vec!["10.1.0.0/16"]);
        assert_eq!(prefs.hostname, "box");
        assert!(prefs.corp_dns);
    }

    #[test]
    fn test_exit_node_can_be_cleared() {
        let mut prefs = Prefs {
            exit_node: Some("100.64.0.9".parse().unwrap()),
            ..Default::default()
        };
        let mp = MaskedPrefs {
            exit_node: Some(None),
            ..Default::default()
        };
        mp.apply(&mut prefs);
        assert_eq!(prefs.exit_node, None);
    }

    #[test]
    fn test_validate_rejects_bad_route() {
        let prefs = Prefs {
            advertise_routes: vec!["not-a-cidr".to_string()],
            ..Default::default()
        };
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_exit_node_with_default_route() {
        let prefs = Prefs {
            exit_node: Some("100.64.0.9".parse().unwrap()),
            advertise_routes: vec!["0.0.0.0/0".to_string()],
            ..Default::default()
        };
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_hostname() {
        let prefs = Prefs {
            hostname: "bad host".to_string(),
            ..Default::default()
        };
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn test_masked_prefs_json_skips_unset() {
        let mp = MaskedPrefs {
            shields_up: Some(true),
            ..Default::default()
        };
        let j = serde_json::to_string(&mp).unwrap();
        assert_eq!(j, r#"{"shields_up":true}"#);
    }
}
