//! Daemon configuration

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// On-disk daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Local API settings
    pub api: ApiConfig,
    /// Host DNS settings
    pub dns: DnsSettings,
    /// File sharing settings
    pub files: FilesConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Local API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Unix socket path (POSIX transports)
    pub socket_path: String,
    /// Loopback TCP port; set to use the token transport instead of the
    /// Unix socket
    pub tcp_port: Option<u16>,
    /// Extra basic-auth password required on every request
    pub required_password: Option<String>,
}

/// Host DNS settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    /// Whether the daemon may rewrite the host's DNS configuration
    pub manage_host: bool,
    /// Tunnel interface GUID (Windows only)
    pub interface_guid: String,
}

/// File sharing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Spool directory for files received from peers
    pub spool_dir: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                socket_path: default_socket_path(),
                tcp_port: None,
                required_password: None,
            },
            dns: DnsSettings {
                manage_host: true,
                interface_guid: String::new(),
            },
            files: FilesConfig { spool_dir: None },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api.socket_path.is_empty() && self.api.tcp_port.is_none() {
            anyhow::bail!("either api.socket_path or api.tcp_port must be set");
        }
        if let Some(pw) = &self.api.required_password {
            if pw.is_empty() {
                anyhow::bail!("api.required_password must not be empty when set");
            }
        }
        Ok(())
    }
}

pub fn default_socket_path() -> String {
    if cfg!(windows) {
        String::new()
    } else {
        "/var/run/trellis/trellisd.sock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellisd.toml");

        let config = DaemonConfig::load_or_create(&path).await.unwrap();
        assert!(path.exists());
        config.validate().unwrap();

        let again = DaemonConfig::load(&path).await.unwrap();
        assert_eq!(again.api.socket_path, config.api.socket_path);
    }

    #[test]
    fn test_validate_rejects_empty_password() {
        let mut config = DaemonConfig::default();
        config.api.required_password = Some(String::new());
        assert!(config.validate().is_err());
    }
}
