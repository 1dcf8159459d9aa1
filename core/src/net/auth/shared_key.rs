//! Shared-key tickets
//!
//! For LAN sessions without a platform identity provider. The host and its
//! trusted clients share a key; a ticket is an account id signed with
//! HMAC-SHA256:
//!
//! ```text
//! LOCAL_alice:4f1c...e2 (hex signature)
//! ```
//!
//! This proves the client was handed the key, nothing more.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tidewire_shared::{AccountId, AccountInfo, AuthTicket, TicketKind};

use super::{AuthError, TicketVerifier, VerifyFuture};

type HmacSha256 = Hmac<Sha256>;

fn mac_for(key: &[u8], account: &str) -> Result<HmacSha256, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|_| AuthError::ProviderUnavailable("invalid HMAC key".to_string()))?;
    mac.update(account.as_bytes());
    Ok(mac)
}

/// Issues shared-key tickets
#[derive(Clone)]
pub struct HmacTicketIssuer {
    key: Vec<u8>,
}

impl HmacTicketIssuer {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    pub fn issue(&self, account: &AccountId) -> Result<AuthTicket, AuthError> {
        let account = account.to_string();
        let signature = hex::encode(mac_for(&self.key, &account)?.finalize().into_bytes());
        Ok(AuthTicket::new(
            TicketKind::Hmac,
            format!("{}:{}", account, signature).into_bytes(),
        ))
    }
}

/// Verifies shared-key tickets
pub struct HmacTicketVerifier {
    key: Vec<u8>,
}

impl HmacTicketVerifier {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Synchronous verification; the check is pure computation
    pub fn verify_now(&self, ticket: &AuthTicket) -> Result<AccountInfo, AuthError> {
        if ticket.kind != TicketKind::Hmac {
            return Err(AuthError::InvalidTicket(format!("expected HMAC ticket, got {:?}", ticket.kind)));
        }

        let text =
            std::str::from_utf8(&ticket.data).map_err(|_| AuthError::InvalidTicket("ticket is not UTF-8".to_string()))?;
        let (account, signature) = text
            .rsplit_once(':')
            .ok_or_else(|| AuthError::InvalidTicket("missing signature".to_string()))?;

        let id: AccountId = account
            .parse()
            .map_err(|e| AuthError::InvalidTicket(format!("{}", e)))?;
        let expected =
            hex::decode(signature).map_err(|_| AuthError::InvalidTicket("invalid signature encoding".to_string()))?;

        mac_for(&self.key, account)?
            .verify_slice(&expected)
            .map_err(|_| AuthError::InvalidTicket("signature verification failed".to_string()))?;

        Ok(AccountInfo::new(id))
    }
}

impl TicketVerifier for HmacTicketVerifier {
    fn kind(&self) -> TicketKind {
        TicketKind::Hmac
    }

    fn verify(&self, ticket: &AuthTicket) -> VerifyFuture {
        Box::pin(std::future::ready(self.verify_now(ticket)))
    }
}
