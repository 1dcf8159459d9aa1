//! Endpoint addressing.
//!
//! An [`Endpoint`] names the remote party of a connection. It is transmitted
//! as a provider-prefixed string:
//!
//! ```text
//! DIRECT_192.168.1.50:7770
//! STEAM_76561198000000000
//! EOS_0002a5b1c4d3
//! PIPE
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix for direct socket endpoints
const DIRECT_PREFIX: &str = "DIRECT_";

/// String form of the local pipe endpoint
const PIPE_STR: &str = "PIPE";

/// Platform that assigned a P2P identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum P2pProvider {
    Steam,
    Eos,
}

impl P2pProvider {
    /// Wire prefix without the trailing underscore
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Steam => "STEAM",
            Self::Eos => "EOS",
        }
    }

    /// Parse a wire prefix
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "STEAM" => Some(Self::Steam),
            "EOS" => Some(Self::Eos),
            _ => None,
        }
    }
}

/// Address of a remote party in a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// Direct network address
    Direct(SocketAddr),
    /// Platform-assigned peer-to-peer identity
    P2p { provider: P2pProvider, id: String },
    /// Local in-process or subprocess pipe
    Pipe,
}

/// Errors from parsing an endpoint string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
    #[error("endpoint string is empty")]
    Empty,

    #[error("unknown endpoint prefix in '{0}'")]
    UnknownPrefix(String),

    #[error("invalid socket address '{0}'")]
    InvalidAddress(String),

    #[error("invalid P2P id '{0}'")]
    InvalidId(String),
}

impl Endpoint {
    /// Create a P2P endpoint, validating the id
    pub fn p2p(provider: P2pProvider, id: impl Into<String>) -> Result<Self, EndpointParseError> {
        let id = id.into();
        if !is_valid_p2p_id(&id) {
            return Err(EndpointParseError::InvalidId(id));
        }
        Ok(Self::P2p { provider, id })
    }

    pub fn is_p2p(&self) -> bool {
        matches!(self, Self::P2p { .. })
    }

    /// Socket address for direct endpoints
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Direct(addr) => Some(*addr),
            _ => None,
        }
    }
}

fn is_valid_p2p_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(addr) => write!(f, "{}{}", DIRECT_PREFIX, addr),
            Self::P2p { provider, id } => write!(f, "{}_{}", provider.as_str(), id),
            Self::Pipe => f.write_str(PIPE_STR),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(EndpointParseError::Empty);
        }
        if s == PIPE_STR {
            return Ok(Self::Pipe);
        }
        if let Some(addr) = s.strip_prefix(DIRECT_PREFIX) {
            return addr
                .parse()
                .map(Self::Direct)
                .map_err(|_| EndpointParseError::InvalidAddress(addr.to_string()));
        }

        let (prefix, id) = s
            .split_once('_')
            .ok_or_else(|| EndpointParseError::UnknownPrefix(s.to_string()))?;
        let provider =
            P2pProvider::from_prefix(prefix).ok_or_else(|| EndpointParseError::UnknownPrefix(s.to_string()))?;
        Self::p2p(provider, id)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Direct(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_string_forms() {
        let direct = Endpoint::Direct("192.168.1.50:7770".parse().unwrap());
        assert_eq!(direct.to_string(), "DIRECT_192.168.1.50:7770");

        let steam = Endpoint::p2p(P2pProvider::Steam, "76561198000000000").unwrap();
        assert_eq!(steam.to_string(), "STEAM_76561198000000000");

        assert_eq!(Endpoint::Pipe.to_string(), "PIPE");
    }

    #[test]
    fn test_endpoint_parse() {
        let parsed: Endpoint = "EOS_0002a5b1c4d3".parse().unwrap();
        assert_eq!(
            parsed,
            Endpoint::P2p {
                provider: P2pProvider::Eos,
                id: "0002a5b1c4d3".to_string()
            }
        );

        let v6: Endpoint = "DIRECT_[::1]:9000".parse().unwrap();
        assert_eq!(v6.socket_addr().unwrap().port(), 9000);

        assert_eq!("PIPE".parse::<Endpoint>().unwrap(), Endpoint::Pipe);
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert_eq!("".parse::<Endpoint>(), Err(EndpointParseError::Empty));
        assert!(matches!(
            "XBOX_123".parse::<Endpoint>(),
            Err(EndpointParseError::UnknownPrefix(_))
        ));
        assert!(matches!(
            "DIRECT_not-an-addr".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidAddress(_))
        ));
        assert!(matches!(
            "STEAM_".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidId(_))
        ));
        assert!(matches!(
            "STEAM_12 34".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidId(_))
        ));
    }

    #[test]
    fn test_endpoint_equality_by_value() {
        let a: Endpoint = "STEAM_42".parse().unwrap();
        let b = Endpoint::p2p(P2pProvider::Steam, "42").unwrap();
        let c = Endpoint::p2p(P2pProvider::Eos, "42").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_endpoint_string_conversions() {
        let endpoint = Endpoint::try_from("STEAM_42".to_string()).unwrap();
        let back: String = endpoint.clone().into();
        assert_eq!(back, "STEAM_42");
        assert!(endpoint.is_p2p());
        assert!(endpoint.socket_addr().is_none());
    }
}
