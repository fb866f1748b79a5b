use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ProxyId;
use crate::error::CoreError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }
}

impl FromStr for Protocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks4" => Ok(Protocol::Socks4),
            "socks5" => Ok(Protocol::Socks5),
            other => Err(CoreError::InvalidInput(format!(
                "unsupported proxy protocol '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proxy offered by a source, not yet in the pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCandidate {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "responseTime")]
    pub response_time_ms: Option<i64>,
}

impl ProxyCandidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Http,
            username: None,
            password: None,
            response_time_ms: None,
        }
    }

    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Trims fields and drops empty credentials. `None` if the candidate
    /// cannot be stored.
    pub fn normalized(mut self) -> Option<Self> {
        self.host = self.host.trim().to_string();
        if self.host.is_empty() || self.port == 0 {
            return None;
        }
        self.username = self
            .username
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        self.password = self.password.filter(|p| !p.is_empty());
        self.response_time_ms = self.response_time_ms.filter(|ms| *ms >= 0);
        Some(self)
    }
}

/// Parses one line of a plain-text proxy list. Accepted shapes are
/// `host:port`, `user:pass@host:port` and `host:port:user:pass`, optionally
/// prefixed by `scheme://`.
impl FromStr for ProxyCandidate {
    type Err = CoreError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let invalid =
            || CoreError::InvalidInput(format!("unparseable proxy line '{line}'"));
        let mut rest = line.trim();
        if rest.is_empty() {
            return Err(invalid());
        }

        let mut protocol = Protocol::Http;
        if let Some((scheme, tail)) = rest.split_once("://") {
            protocol = scheme.parse()?;
            rest = tail;
        }

        let (credentials, address) = match rest.rsplit_once('@') {
            Some((creds, addr)) => (Some(creds), addr),
            None => (None, rest),
        };

        let parts: Vec<&str> = address.split(':').collect();
        let (host, port, mut username, mut password) = match parts.as_slice() {
            [host, port] => (*host, *port, None, None),
            [host, port, user, pass] if credentials.is_none() => {
                (*host, *port, Some(*user), Some(*pass))
            }
            _ => return Err(invalid()),
        };
        if let Some(creds) = credentials {
            let (user, pass) = creds.split_once(':').ok_or_else(invalid)?;
            username = Some(user);
            password = Some(pass);
        }

        let port: u16 = port.trim().parse().map_err(|_| invalid())?;
        let candidate = ProxyCandidate {
            host: host.to_string(),
            port,
            protocol,
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            response_time_ms: None,
        };
        candidate.normalized().ok_or_else(invalid)
    }
}

/// A proxy handed to a worker. The backing row is gone by the time this
/// value exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyLease {
    pub id: ProxyId,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub username: Option<String>,
    pub password: Option<String>,
    pub response_time_ms: Option<i64>,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl ProxyLease {
    /// `protocol://[user:pass@]host:port`
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol, user, pass, self.host, self.port
            ),
            (Some(user), None) => {
                format!("{}://{}@{}:{}", self.protocol, user, self.host, self.port)
            }
            _ => format!("{}://{}:{}", self.protocol, self.host, self.port),
        }
    }
}

/// Usage feedback for a proxy a worker already consumed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatusReport {
    #[serde(default, alias = "proxyId")]
    pub proxy_id: Option<ProxyId>,
    #[serde(default)]
    pub success: bool,
    #[serde(default, alias = "responseTime")]
    pub response_time_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub available: u64,
    pub avg_response_time_ms: Option<f64>,
    pub reported_success: u64,
    pub reported_failure: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_host_port() {
        let c: ProxyCandidate = "10.0.0.1:8080".parse().unwrap();
        assert_eq!(c.host, "10.0.0.1");
        assert_eq!(c.port, 8080);
        assert_eq!(c.protocol, Protocol::Http);
        assert!(c.username.is_none());
    }

    #[test]
    fn parses_both_credential_layouts() {
        let at: ProxyCandidate = "user:pw@proxy.local:3128".parse().unwrap();
        let trailing: ProxyCandidate = "proxy.local:3128:user:pw".parse().unwrap();
        assert_eq!(at, trailing);
        assert_eq!(at.username.as_deref(), Some("user"));
        assert_eq!(at.password.as_deref(), Some("pw"));
    }

    #[test]
    fn parses_scheme_prefix() {
        let c: ProxyCandidate = "socks5://1.2.3.4:1080".parse().unwrap();
        assert_eq!(c.protocol, Protocol::Socks5);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ProxyCandidate>().is_err());
        assert!("host-only".parse::<ProxyCandidate>().is_err());
        assert!("host:notaport".parse::<ProxyCandidate>().is_err());
        assert!("host:0".parse::<ProxyCandidate>().is_err());
        assert!("ftp://host:21".parse::<ProxyCandidate>().is_err());
    }

    #[test]
    fn lease_url_includes_credentials_when_present() {
        let mut lease = ProxyLease {
            id: ProxyId(1),
            host: "h".into(),
            port: 80,
            protocol: Protocol::Https,
            username: None,
            password: None,
            response_time_ms: None,
            source: "api".into(),
            created_at: Utc::now(),
        };
        assert_eq!(lease.url(), "https://h:80");
        lease.username = Some("u".into());
        lease.password = Some("p".into());
        assert_eq!(lease.url(), "https://u:p@h:80");
    }
}
