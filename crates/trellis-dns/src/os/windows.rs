//! Windows DNS configuration
//!
//! Two modes, mirroring how the host actually works:
//!
//!  - Primary mode writes `NameServer` and `SearchList` on our interface's
//!    Tcpip registry keys. Our interface metric is very low, so the host
//!    treats those resolvers as its only resolvers.
//!  - Split mode installs NRPT (Name Resolution Policy Table) rules, one
//!    per suffix, and writes only the search list on the interface.
//!
//! The two modes are an XOR: every transition clears the other mode's
//! state before writing. NRPT needs Windows 10; on older hosts only
//! primary mode is offered and the compiler simulates split.

use std::io;
use std::process::Command;
use std::sync::Mutex;

use tracing::{debug, info, warn};
use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ, REG_MULTI_SZ};
use winreg::{RegKey, RegValue};

use crate::config::OsConfig;
use crate::error::{DnsError, DnsResult};
use crate::fqdn::Fqdn;
use crate::os::OsConfigurator;

const IPV4_BASE: &str = r"SYSTEM\CurrentControlSet\Services\Tcpip\Parameters";
const IPV6_BASE: &str = r"SYSTEM\CurrentControlSet\Services\Tcpip6\Parameters";
const NRPT_BASE: &str = r"SYSTEM\CurrentControlSet\Services\Dnscache\Parameters\DnsPolicyConfig";
const VERSION_KEY: &str = r"SOFTWARE\Microsoft\Windows NT\CurrentVersion";

// Our NRPT rule keys all share this prefix; the per-suffix index goes in
// the last GUID group.
const RULE_PREFIX: &str = "{5c3b05a9-2b63-4d31-8c42-";

/// Env knob: also push the config into WSL distributions.
const WSL_ENV: &str = "TRELLIS_DEBUG_CONFIGURE_WSL";

/// Registry-backed configurator for Windows.
pub struct WindowsOsConfigurator {
    /// GUID of our tunnel interface, braces included.
    guid: String,
    nrpt: bool,
    lock: Mutex<()>,
}

impl WindowsOsConfigurator {
    pub fn new(interface_guid: &str) -> Self {
        let nrpt = is_windows_10_or_better();
        if !nrpt {
            info!("NRPT unavailable; split DNS disabled");
        }
        Self {
            guid: interface_guid.to_string(),
            nrpt,
            lock: Mutex::new(()),
        }
    }

    fn if_path(&self, base: &str) -> String {
        format!(r"{base}\Interfaces\{}", self.guid)
    }

    fn open_set(&self, path: &str) -> DnsResult<RegKey> {
        RegKey::predef(HKEY_LOCAL_MACHINE)
            .create_subkey(path)
            .map(|(key, _)| key)
            .map_err(|e| DnsError::Other(format!("opening {path}: {e}")))
    }

    /// Set the given resolvers and search domains as our interface's DNS
    /// configuration. Resolvers make us the host's primary resolver;
    /// domains alone just extend the global search list.
    fn set_primary_dns(&self, resolvers: &[std::net::IpAddr], domains: &[Fqdn]) -> DnsResult<()> {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for ip in resolvers {
            if ip.is_ipv4() {
                v4.push(ip.to_string());
            } else {
                v6.push(ip.to_string());
            }
        }
        let search: Vec<String> = domains
            .iter()
            .map(|d| d.without_trailing_dot().to_string())
            .collect();

        for (base, ips) in [(IPV4_BASE, &v4), (IPV6_BASE, &v6)] {
            let key = self.open_set(&self.if_path(base))?;
            if ips.is_empty() {
                del_value(&key, "NameServer")?;
            } else {
                key.set_value("NameServer", &ips.join(","))
                    .map_err(DnsError::Io)?;
            }
            if search.is_empty() {
                del_value(&key, "SearchList")?;
            } else {
                key.set_value("SearchList", &search.join(","))
                    .map_err(DnsError::Io)?;
            }
            // No multicast, no LLMNR on a point-to-point tunnel.
            key.set_value("EnableMulticast", &0u32).map_err(DnsError::Io)?;
        }
        Ok(())
    }

    /// Install one NRPT rule per suffix routing it at `resolvers`, or
    /// delete all our rules when `domains` is empty.
    fn set_split_dns(&self, resolvers: &[std::net::IpAddr], domains: &[Fqdn]) -> DnsResult<()> {
        if !self.nrpt {
            if resolvers.is_empty() {
                return Ok(());
            }
            return Err(DnsError::SplitNotSupported);
        }
        self.delete_our_rules()?;
        if resolvers.is_empty() {
            return Ok(());
        }
        let servers = resolvers
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(";");
        let nrpt = self.open_set(NRPT_BASE)?;
        for (i, dom) in domains.iter().enumerate() {
            let rule = format!("{RULE_PREFIX}{i:012x}}}");
            let (key, _) = nrpt
                .create_subkey(&rule)
                .map_err(|e| DnsError::Other(format!("creating NRPT rule: {e}")))?;
            key.set_value("Version", &1u32).map_err(DnsError::Io)?;
            key.set_raw_value(
                "Name",
                &multi_sz(&[format!(".{}", dom.without_trailing_dot())]),
            )
            .map_err(DnsError::Io)?;
            key.set_value("GenericDNSServers", &servers).map_err(DnsError::Io)?;
            // 0x8 = the rule carries generic DNS servers.
            key.set_value("ConfigOptions", &8u32).map_err(DnsError::Io)?;
            key.set_value("Comment", &"trellisd").map_err(DnsError::Io)?;
        }
        debug!(rules = domains.len(), "wrote NRPT rules");
        Ok(())
    }

    fn delete_our_rules(&self) -> DnsResult<()> {
        let nrpt = match RegKey::predef(HKEY_LOCAL_MACHINE).open_subkey(NRPT_BASE) {
            Ok(key) => key,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let ours: Vec<String> = nrpt
            .enum_keys()
            .filter_map(|k| k.ok())
            .filter(|k| k.starts_with(RULE_PREFIX))
            .collect();
        for rule in ours {
            if let Err(e) = nrpt.delete_subkey_all(&rule) {
                warn!("deleting NRPT rule {rule}: {e}");
            }
        }
        Ok(())
    }

    /// Stop the DHCP client from sending dynamic DNS updates for our
    /// interface to AD domain controllers.
    fn disable_dynamic_updates(&self) -> DnsResult<()> {
        for base in [IPV4_BASE, IPV6_BASE] {
            let key = self.open_set(&self.if_path(base))?;
            key.set_value("DisableDynamicUpdate", &1u32).map_err(DnsError::Io)?;
        }
        Ok(())
    }

    /// Force the host to notice the adapter change and drop cached
    /// split-horizon answers. Slow, so it runs detached.
    fn spawn_flush(&self, cfg: OsConfig) {
        let configure_wsl = std::env::var(WSL_ENV).map(|v| v == "1" || v == "true").unwrap_or(false);
        std::thread::spawn(move || {
            for args in [["/registerdns"], ["/flushdns"]] {
                match Command::new("ipconfig").args(args).output() {
                    Ok(out) if out.status.success() => debug!("ran ipconfig {}", args[0]),
                    Ok(out) => warn!("ipconfig {} exited {}", args[0], out.status),
                    Err(e) => warn!("running ipconfig {}: {e}", args[0]),
                }
            }
            if configure_wsl {
                if let Err(e) = configure_wsl_dns(&cfg) {
                    warn!("WSL DNS configuration: {e}");
                }
            }
        });
    }
}

impl OsConfigurator for WindowsOsConfigurator {
    fn set_dns(&self, cfg: &OsConfig) -> DnsResult<()> {
        let _guard = self.lock.lock().unwrap();

        if let Err(e) = self.disable_dynamic_updates() {
            warn!("disabling dynamic DNS updates: {e}");
        }

        // Primary and split are an XOR; clear the other mode first so a
        // transition never leaves both behind.
        if cfg.match_domains.is_empty() {
            self.set_split_dns(&[], &[])?;
            self.set_primary_dns(&cfg.nameservers, &cfg.search_domains)?;
        } else {
            self.set_split_dns(&cfg.nameservers, &cfg.match_domains)?;
            // NRPT only routes queries; search expansion still comes from
            // the interface.
            self.set_primary_dns(&[], &cfg.search_domains)?;
        }

        self.spawn_flush(cfg.clone());
        Ok(())
    }

    fn supports_split_dns(&self) -> bool {
        self.nrpt
    }

    fn get_base_config(&self) -> DnsResult<OsConfig> {
        // Best guess at the pre-existing primary resolvers: the global
        // Tcpip parameters, static before DHCP. Search domains are left
        // out; the host blends search lists from all interfaces by itself.
        let params = RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey_with_flags(IPV4_BASE, KEY_READ)
            .map_err(DnsError::Io)?;
        let mut nameservers = Vec::new();
        for value in ["NameServer", "DhcpNameServer"] {
            let raw: String = params.get_value(value).unwrap_or_default();
            for part in raw.split([',', ' ']).filter(|s| !s.is_empty()) {
                if let Ok(ip) = part.parse() {
                    nameservers.push(ip);
                }
            }
            if !nameservers.is_empty() {
                break;
            }
        }
        Ok(OsConfig {
            nameservers,
            ..Default::default()
        })
    }

    fn close(&self) -> DnsResult<()> {
        self.set_dns(&OsConfig::default())
    }
}

fn del_value(key: &RegKey, name: &str) -> DnsResult<()> {
    match key.delete_value(name) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// REG_MULTI_SZ encoding: UTF-16LE strings, NUL separated, double NUL
/// terminated.
fn multi_sz(values: &[String]) -> RegValue {
    let mut wide: Vec<u16> = Vec::new();
    for v in values {
        wide.extend(v.encode_utf16());
        wide.push(0);
    }
    wide.push(0);
    let mut bytes = Vec::with_capacity(wide.len() * 2);
    for w in wide {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    RegValue {
        bytes,
        vtype: REG_MULTI_SZ,
    }
}

fn is_windows_10_or_better() -> bool {
    // The value only exists on Windows 10 and later; its presence is the
    // whole check. Fail toward the older host.
    RegKey::predef(HKEY_LOCAL_MACHINE)
        .open_subkey_with_flags(VERSION_KEY, KEY_READ)
        .and_then(|key| key.get_value::<u32, _>("CurrentMajorVersionNumber"))
        .is_ok()
}

/// Push the compiled config into every WSL distribution by rewriting its
/// /etc/resolv.conf. Best effort.
fn configure_wsl_dns(cfg: &OsConfig) -> io::Result<()> {
    let out = Command::new("wsl.exe").args(["-l", "-q"]).output()?;
    if !out.status.success() {
        return Ok(());
    }
    // wsl.exe emits UTF-16LE.
    let listing: String = String::from_utf16_lossy(
        &out.stdout
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect::<Vec<_>>(),
    );
    let mut resolv = String::from("# generated by trellisd\n");
    for ns in &cfg.nameservers {
        resolv.push_str(&format!("nameserver {ns}\n"));
    }
    for distro in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let status = Command::new("wsl.exe")
            .args(["-d", distro, "-u", "root", "--", "sh", "-c"])
            .arg(format!("printf %s '{resolv}' > /etc/resolv.conf"))
            .status()?;
        if status.success() {
            info!("configured WSL distro {distro}");
        } else {
            warn!("configuring WSL distro {distro} exited {status}");
        }
    }
    Ok(())
}
