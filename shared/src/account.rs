//! Account identity and authentication tickets.

use std::fmt;
use std::str::FromStr;

use bitcode::{Decode, Encode};

use crate::endpoint::{Endpoint, P2pProvider};

/// Identity provider that issued an account id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum AccountProvider {
    Steam,
    Eos,
    /// Accounts vouched for by a shared-key ticket on a local network
    Local,
}

impl AccountProvider {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Steam => "STEAM",
            Self::Eos => "EOS",
            Self::Local => "LOCAL",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "STEAM" => Some(Self::Steam),
            "EOS" => Some(Self::Eos),
            "LOCAL" => Some(Self::Local),
            _ => None,
        }
    }
}

impl From<P2pProvider> for AccountProvider {
    fn from(provider: P2pProvider) -> Self {
        match provider {
            P2pProvider::Steam => Self::Steam,
            P2pProvider::Eos => Self::Eos,
        }
    }
}

/// A verified account identifier, e.g. `STEAM_76561198000000000`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct AccountId {
    pub provider: AccountProvider,
    pub value: String,
}

impl AccountId {
    pub fn new(provider: AccountProvider, value: impl Into<String>) -> Self {
        Self {
            provider,
            value: value.into(),
        }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.provider.as_str(), self.value)
    }
}

/// Errors from parsing an account id string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountIdParseError {
    #[error("account id '{0}' has no provider prefix")]
    MissingPrefix(String),

    #[error("unknown account provider in '{0}'")]
    UnknownProvider(String),

    #[error("account id '{0}' has an empty value")]
    EmptyValue(String),
}

impl FromStr for AccountId {
    type Err = AccountIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, value) = s
            .split_once('_')
            .ok_or_else(|| AccountIdParseError::MissingPrefix(s.to_string()))?;
        let provider =
            AccountProvider::from_prefix(prefix).ok_or_else(|| AccountIdParseError::UnknownProvider(s.to_string()))?;
        if value.is_empty() {
            return Err(AccountIdParseError::EmptyValue(s.to_string()));
        }
        Ok(Self::new(provider, value))
    }
}

/// Result of a successful ticket verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    /// Primary account id
    pub id: AccountId,
    /// Linked ids on other providers
    pub other_ids: Vec<AccountId>,
}

impl AccountInfo {
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            other_ids: Vec::new(),
        }
    }

    /// All ids, primary first
    pub fn ids(&self) -> impl Iterator<Item = &AccountId> {
        std::iter::once(&self.id).chain(self.other_ids.iter())
    }

    /// Whether this account may use the given endpoint.
    ///
    /// P2P endpoints are bound to a platform identity, so one of the account's
    /// ids must be that identity. Other endpoints carry no identity.
    pub fn matches_endpoint(&self, endpoint: &Endpoint) -> bool {
        match endpoint {
            Endpoint::P2p { provider, id } => {
                let provider = AccountProvider::from(*provider);
                self.ids().any(|acc| acc.provider == provider && &acc.value == id)
            }
            Endpoint::Direct(_) | Endpoint::Pipe => true,
        }
    }
}

/// Kind of authentication ticket, selects the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum TicketKind {
    Steam,
    Eos,
    Hmac,
}

/// Opaque ticket produced by an identity provider
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AuthTicket {
    pub kind: TicketKind,
    pub data: Vec<u8>,
}

impl AuthTicket {
    pub fn new(kind: TicketKind, data: Vec<u8>) -> Self {
        Self { kind, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_display_and_parse() {
        let id = AccountId::new(AccountProvider::Steam, "76561198000000000");
        assert_eq!(id.to_string(), "STEAM_76561198000000000");
        assert_eq!("STEAM_76561198000000000".parse::<AccountId>().unwrap(), id);

        let local: AccountId = "LOCAL_alice".parse().unwrap();
        assert_eq!(local.provider, AccountProvider::Local);
        assert_eq!(local.value, "alice");
    }

    #[test]
    fn test_account_id_parse_errors() {
        assert!(matches!(
            "nounderscore".parse::<AccountId>(),
            Err(AccountIdParseError::MissingPrefix(_))
        ));
        assert!(matches!(
            "PSN_1".parse::<AccountId>(),
            Err(AccountIdParseError::UnknownProvider(_))
        ));
        assert!(matches!(
            "EOS_".parse::<AccountId>(),
            Err(AccountIdParseError::EmptyValue(_))
        ));
    }

    #[test]
    fn test_matches_p2p_endpoint() {
        let mut info = AccountInfo::new(AccountId::new(AccountProvider::Eos, "abc"));
        info.other_ids.push(AccountId::new(AccountProvider::Steam, "42"));

        let steam: Endpoint = "STEAM_42".parse().unwrap();
        let other: Endpoint = "STEAM_43".parse().unwrap();
        let eos: Endpoint = "EOS_abc".parse().unwrap();

        assert!(info.matches_endpoint(&steam));
        assert!(info.matches_endpoint(&eos));
        assert!(!info.matches_endpoint(&other));
    }

    #[test]
    fn test_direct_endpoint_always_matches() {
        let info = AccountInfo::new(AccountId::new(AccountProvider::Local, "bob"));
        let direct: Endpoint = "DIRECT_127.0.0.1:7770".parse().unwrap();
        assert!(info.matches_endpoint(&direct));
        assert!(info.matches_endpoint(&Endpoint::Pipe));
    }
}
