//! Connection identity

use crate::BridgeError;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use storage::EntitySubscription;

/// Default plain MQTT port
pub const DEFAULT_PORT: u16 = 1883;
/// Default MQTT over TLS port
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Normalized broker address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerEndpoint {
    /// Lowercased host name or address
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Parse `mqtt://host:port`, `mqtts://host`, `host:port`, or `host`
    pub fn parse(url: &str) -> Result<Self, BridgeError> {
        let invalid = |reason: &str| BridgeError::InvalidEndpoint {
            endpoint: url.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = url.trim();
        let (tls, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "mqtt" | "tcp" => (false, rest),
                "mqtts" | "ssl" | "tls" => (true, rest),
                _ => return Err(invalid("unsupported scheme")),
            },
            None => (false, trimmed),
        };

        // Drop any path component
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.contains('@') {
            return Err(invalid("credentials belong in the username/password fields"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| invalid("unclosed IPv6 bracket"))?;
            (host, tail.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None if tls => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
            tls,
        })
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Broker credentials
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        // Empty strings mean "not set"
        Self {
            username: username.filter(|u| !u.is_empty()),
            password: password.filter(|p| !p.is_empty()),
        }
    }

    /// Stable in-process fingerprint of the password
    fn fingerprint(&self) -> Option<u64> {
        self.password.as_ref().map(|password| {
            let mut hasher = DefaultHasher::new();
            password.hash(&mut hasher);
            hasher.finish()
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Identity of one live broker connection: endpoint plus credential identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub endpoint: BrokerEndpoint,
    pub username: Option<String>,
    secret: Option<u64>,
}

impl ConnectionKey {
    pub fn new(endpoint: BrokerEndpoint, credentials: &Credentials) -> Self {
        Self {
            endpoint,
            username: credentials.username.clone(),
            secret: credentials.fingerprint(),
        }
    }

    /// Key and credentials an entity needs
    pub fn for_subscription(entity: &EntitySubscription) -> Result<(Self, Credentials), BridgeError> {
        let endpoint = BrokerEndpoint::parse(&entity.broker_url)?;
        let credentials = Credentials::new(entity.broker_username.clone(), entity.broker_password.clone());
        Ok((Self::new(endpoint, &credentials), credentials))
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}", user, self.endpoint),
            None => write!(f, "{}", self.endpoint),
        }
    }
}
