//! Direct resolv.conf management
//!
//! The lowest-common-denominator POSIX configurator: rewrite
//! `/etc/resolv.conf` wholesale, keeping a backup of the original so it can
//! be restored on teardown. No split support; the compiler simulates split
//! by folding the base config (parsed from the backup) into the in-daemon
//! resolver.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::config::OsConfig;
use crate::error::{DnsError, DnsResult};
use crate::fqdn::Fqdn;
use crate::os::OsConfigurator;

const HEADER: &str = "# resolv.conf(5) file generated by trellisd\n\
                      # DO NOT EDIT THIS FILE BY HAND -- CHANGES WILL BE OVERWRITTEN\n";

/// resolv.conf-rewriting configurator.
pub struct DirectOsConfigurator {
    resolv_conf: PathBuf,
    backup: PathBuf,
    // Serializes every mutation of the two files.
    lock: Mutex<()>,
}

impl DirectOsConfigurator {
    pub fn new() -> Self {
        Self::with_paths(
            PathBuf::from("/etc/resolv.conf"),
            PathBuf::from("/etc/resolv.pre-trellis-backup.conf"),
        )
    }

    /// Operate on explicit paths. Tests use this with a temp dir.
    pub fn with_paths(resolv_conf: PathBuf, backup: PathBuf) -> Self {
        Self {
            resolv_conf,
            backup,
            lock: Mutex::new(()),
        }
    }

    fn render(cfg: &OsConfig) -> String {
        let mut out = String::from(HEADER);
        for ns in &cfg.nameservers {
            out.push_str(&format!("nameserver {ns}\n"));
        }
        if !cfg.search_domains.is_empty() {
            out.push_str("search");
            for dom in &cfg.search_domains {
                out.push(' ');
                out.push_str(dom.without_trailing_dot());
            }
            out.push('\n');
        }
        out
    }

    fn write_atomically(path: &Path, contents: &str) -> DnsResult<()> {
        let tmp = path.with_extension("trellis-tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(contents.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Save the host's resolv.conf before the first overwrite. A backup
    /// that already exists is older than anything we wrote, so it wins.
    fn ensure_backup(&self) -> DnsResult<()> {
        if self.backup.exists() {
            return Ok(());
        }
        match fs::copy(&self.resolv_conf, &self.backup) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn restore_backup(&self) -> DnsResult<()> {
        if !self.backup.exists() {
            debug!("no resolv.conf backup to restore");
            return Ok(());
        }
        fs::rename(&self.backup, &self.resolv_conf)?;
        info!("restored original resolv.conf");
        Ok(())
    }

    fn parse_resolv_conf(contents: &str) -> OsConfig {
        let mut cfg = OsConfig::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    if let Some(Ok(ip)) = fields.next().map(|v| v.parse()) {
                        cfg.nameservers.push(ip);
                    }
                }
                Some("search") | Some("domain") => {
                    for dom in fields {
                        if let Ok(fqdn) = Fqdn::parse(dom) {
                            cfg.search_domains.push(fqdn);
                        }
                    }
                }
                _ => {}
            }
        }
        cfg
    }
}

impl Default for DirectOsConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

impl OsConfigurator for DirectOsConfigurator {
    fn set_dns(&self, cfg: &OsConfig) -> DnsResult<()> {
        if !cfg.match_domains.is_empty() {
            return Err(DnsError::SplitNotSupported);
        }
        let _guard = self.lock.lock().unwrap();
        if cfg.is_zero() {
            return self.restore_backup();
        }
        self.ensure_backup()?;
        Self::write_atomically(&self.resolv_conf, &Self::render(cfg))?;
        debug!(nameservers = cfg.nameservers.len(), "wrote resolv.conf");
        Ok(())
    }

    fn supports_split_dns(&self) -> bool {
        false
    }

    fn get_base_config(&self) -> DnsResult<OsConfig> {
        let _guard = self.lock.lock().unwrap();
        // Prefer the backup: once we have overwritten resolv.conf, the live
        // file only describes ourselves.
        let path = if self.backup.exists() {
            &self.backup
        } else {
            &self.resolv_conf
        };
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse_resolv_conf(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OsConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> DnsResult<()> {
        let _guard = self.lock.lock().unwrap();
        if let Err(e) = self.restore_backup() {
            warn!("restoring resolv.conf: {e}");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fqdns(names: &[&str]) -> Vec<Fqdn> {
        names.iter().map(|n| Fqdn::parse(n).unwrap()).collect()
    }

    fn setup() -> (tempfile::TempDir, DirectOsConfigurator) {
        let dir = tempfile::tempdir().unwrap();
        let resolv = dir.path().join("resolv.conf");
        fs::write(&resolv, "nameserver 8.8.8.8\nsearch coffee.shop\n").unwrap();
        let cfg = DirectOsConfigurator::with_paths(resolv, dir.path().join("resolv.backup"));
        (dir, cfg)
    }

    #[test]
    fn test_set_and_restore() {
        let (dir, os) = setup();

        os.set_dns(&OsConfig {
            nameservers: vec!["100.100.100.100".parse().unwrap()],
            search_domains: fqdns(&["example.ts"]),
            match_domains: Vec::new(),
        })
        .unwrap();

        let live = fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert!(live.contains("nameserver 100.100.100.100"));
        assert!(live.contains("search example.ts"));
        assert!(dir.path().join("resolv.backup").exists());

        // Teardown restores the original bytes.
        os.set_dns(&OsConfig::default()).unwrap();
        let live = fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert_eq!(live, "nameserver 8.8.8.8\nsearch coffee.shop\n");
        assert!(!dir.path().join("resolv.backup").exists());
    }

    #[test]
    fn test_base_config_prefers_backup() {
        let (_dir, os) = setup();

        let base = os.get_base_config().unwrap();
        assert_eq!(base.nameservers, vec!["8.8.8.8".parse::<std::net::IpAddr>().unwrap()]);
        assert_eq!(base.search_domains, fqdns(&["coffee.shop"]));

        os.set_dns(&OsConfig {
            nameservers: vec!["100.100.100.100".parse().unwrap()],
            ..Default::default()
        })
        .unwrap();

        // After the overwrite the base config still describes the
        // pre-existing state, not us.
        let base = os.get_base_config().unwrap();
        assert_eq!(base.nameservers, vec!["8.8.8.8".parse::<std::net::IpAddr>().unwrap()]);
    }

    #[test]
    fn test_rejects_split() {
        let (_dir, os) = setup();
        let err = os
            .set_dns(&OsConfig {
                nameservers: vec!["2.2.2.2".parse().unwrap()],
                match_domains: fqdns(&["corp.com"]),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, DnsError::SplitNotSupported));
    }

    #[test]
    fn test_set_twice_is_idempotent() {
        let (dir, os) = setup();
        let cfg = OsConfig {
            nameservers: vec!["1.1.1.1".parse().unwrap()],
            ..Default::default()
        };
        os.set_dns(&cfg).unwrap();
        let first = fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        os.set_dns(&cfg).unwrap();
        let second = fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert_eq!(first, second);
        // The backup still holds the original, not our own output.
        let backup = fs::read_to_string(dir.path().join("resolv.backup")).unwrap();
        assert!(backup.contains("8.8.8.8"));
    }

    #[test]
    fn test_close_restores() {
        let (dir, os) = setup();
        os.set_dns(&OsConfig {
            nameservers: vec!["1.1.1.1".parse().unwrap()],
            ..Default::default()
        })
        .unwrap();
        os.close().unwrap();
        let live = fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert!(live.contains("8.8.8.8"));
    }
}
