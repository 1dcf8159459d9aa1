//! Scripted verifier for tests

use std::collections::HashMap;
use std::sync::Mutex;

use tidewire_shared::{AccountId, AccountInfo, AuthTicket, TicketKind};
use tokio::sync::oneshot;

use super::{AuthError, TicketVerifier, VerifyFuture};

type Outcome = Result<AccountInfo, AuthError>;

#[derive(Default)]
struct State {
    waiting: HashMap<Vec<u8>, oneshot::Sender<Outcome>>,
    ready: HashMap<Vec<u8>, Outcome>,
    ended: Vec<AccountId>,
}

/// Verifier whose results are decided by the test, per ticket payload
pub(crate) struct ManualVerifier {
    kind: TicketKind,
    state: Mutex<State>,
}

impl ManualVerifier {
    pub(crate) fn new(kind: TicketKind) -> Self {
        Self {
            kind,
            state: Mutex::new(State::default()),
        }
    }

    pub(crate) fn ticket(kind: TicketKind, name: &str) -> AuthTicket {
        AuthTicket::new(kind, name.as_bytes().to_vec())
    }

    pub(crate) fn succeed(&self, name: &str, account: AccountInfo) {
        self.resolve(name, Ok(account));
    }

    pub(crate) fn fail(&self, name: &str, error: AuthError) {
        self.resolve(name, Err(error));
    }

    pub(crate) fn ended_sessions(&self) -> Vec<AccountId> {
        self.state.lock().unwrap().ended.clone()
    }

    fn resolve(&self, name: &str, outcome: Outcome) {
        let mut state = self.state.lock().unwrap();
        let key = name.as_bytes().to_vec();
        match state.waiting.remove(&key) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                state.ready.insert(key, outcome);
            }
        }
    }
}

impl TicketVerifier for ManualVerifier {
    fn kind(&self) -> TicketKind {
        self.kind
    }

    fn verify(&self, ticket: &AuthTicket) -> VerifyFuture {
        let mut state = self.state.lock().unwrap();
        if let Some(outcome) = state.ready.remove(&ticket.data) {
            return Box::pin(std::future::ready(outcome));
        }
        let (tx, rx) = oneshot::channel();
        state.waiting.insert(ticket.data.clone(), tx);
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(AuthError::ProviderUnavailable("verifier dropped".to_string())))
        })
    }

    fn end_session(&self, account: &AccountId) {
        self.state.lock().unwrap().ended.push(account.clone());
    }
}
