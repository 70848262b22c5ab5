//! Fully qualified domain names

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DnsError, DnsResult};

/// A fully qualified domain name: lowercase, trailing dot always present.
///
/// The root is spelled `"."`. Lowercasing happens at parse time, so every
/// name that reaches the OS configurators is already normalized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fqdn(String);

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

impl Fqdn {
    /// The root name `"."`.
    pub fn root() -> Fqdn {
        Fqdn(".".to_string())
    }

    /// Parse and normalize a domain name.
    pub fn parse(s: &str) -> DnsResult<Fqdn> {
        if s == "." || s.is_empty() {
            return Ok(Fqdn::root());
        }
        let mut name = s.to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        if name.len() > MAX_NAME_LEN + 1 {
            return Err(DnsError::InvalidName(s.to_string()));
        }
        for label in name.trim_end_matches('.').split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(DnsError::InvalidName(s.to_string()));
            }
            if !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(DnsError::InvalidName(s.to_string()));
            }
        }
        Ok(Fqdn(name))
    }

    pub fn is_root(&self) -> bool {
        self.0 == "."
    }

    /// The name with the trailing dot, as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name without the trailing dot; empty for the root.
    pub fn without_trailing_dot(&self) -> &str {
        self.0.trim_end_matches('.')
    }

    /// Whether `name` is `self` or a subdomain of it.
    pub fn contains(&self, name: &Fqdn) -> bool {
        if self.is_root() {
            return true;
        }
        name.0 == self.0 || name.0.ends_with(&format!(".{}", self.0))
    }
}

impl std::fmt::Display for Fqdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Fqdn {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fqdn::parse(s)
    }
}

impl Serialize for Fqdn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Fqdn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fqdn::parse(&s).map_err(serde::de::Error::custom)
    }
}
