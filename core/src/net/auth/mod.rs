//! Ticket authentication
//!
//! Verification is the only asynchronous part of the connection layer. The
//! [`Authenticator`] spawns each verification on a tokio runtime and delivers
//! results through a completion channel that the relay drains inside its own
//! tick, so no connection state is ever touched from a runtime thread.

mod shared_key;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tidewire_shared::{AccountId, AccountInfo, AuthTicket, Endpoint, TicketKind};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;

pub use shared_key::{HmacTicketIssuer, HmacTicketVerifier};

/// Default upper bound on one verification
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Future returned by a verifier
pub type VerifyFuture = Pin<Box<dyn Future<Output = Result<AccountInfo, AuthError>> + Send + 'static>>;

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no verifier registered for {0:?} tickets")]
    NoVerifier(TicketKind),

    #[error("invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("verification timed out")]
    Timeout,
}

/// Verifies one kind of ticket.
///
/// Implementations talk to an identity provider; `verify` must not block and
/// should do its I/O inside the returned future.
pub trait TicketVerifier: Send + Sync {
    fn kind(&self) -> TicketKind;

    fn verify(&self, ticket: &AuthTicket) -> VerifyFuture;

    /// Release provider-side session state for an account
    fn end_session(&self, _account: &AccountId) {}
}

/// Result of one verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCompletion {
    pub endpoint: Endpoint,
    /// Identifies which connection of `endpoint` started the verification
    pub generation: u64,
    pub kind: TicketKind,
    pub result: Result<AccountInfo, AuthError>,
}

enum RuntimeHandle {
    Owned(Runtime),
    Shared(Handle),
}

impl RuntimeHandle {
    fn handle(&self) -> &Handle {
        match self {
            Self::Owned(runtime) => runtime.handle(),
            Self::Shared(handle) => handle,
        }
    }
}

/// Dispatches ticket verifications and collects their results
pub struct Authenticator {
    runtime: RuntimeHandle,
    verifiers: HashMap<TicketKind, Arc<dyn TicketVerifier>>,
    completions_tx: mpsc::UnboundedSender<AuthCompletion>,
    completions_rx: mpsc::UnboundedReceiver<AuthCompletion>,
    /// Accounts with an open provider session, by the kind that verified them
    sessions: HashMap<AccountId, TicketKind>,
    in_flight: usize,
    timeout: Duration,
}

impl Authenticator {
    /// Use an existing runtime. It must have the time driver enabled.
    pub fn new(handle: Handle) -> Self {
        Self::from_runtime(RuntimeHandle::Shared(handle))
    }

    /// Create an authenticator with its own small runtime
    pub fn with_runtime() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tidewire-auth")
            .enable_time()
            .build()?;
        Ok(Self::from_runtime(RuntimeHandle::Owned(runtime)))
    }

    fn from_runtime(runtime: RuntimeHandle) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            verifiers: HashMap::new(),
            completions_tx,
            completions_rx,
            sessions: HashMap::new(),
            in_flight: 0,
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a verifier, replacing any previous one for the same kind
    pub fn register(&mut self, verifier: Arc<dyn TicketVerifier>) {
        let kind = verifier.kind();
        if self.verifiers.insert(kind, verifier).is_some() {
            tracing::debug!(?kind, "Replaced ticket verifier");
        }
    }

    pub fn has_verifier(&self, kind: TicketKind) -> bool {
        self.verifiers.contains_key(&kind)
    }

    /// Verifications started and not yet drained
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Start verifying a ticket. The result arrives via [`poll_completed`].
    ///
    /// [`poll_completed`]: Self::poll_completed
    pub fn begin(&mut self, endpoint: Endpoint, generation: u64, ticket: &AuthTicket) -> Result<(), AuthError> {
        let verifier = self
            .verifiers
            .get(&ticket.kind)
            .ok_or(AuthError::NoVerifier(ticket.kind))?;

        let future = verifier.verify(ticket);
        let tx = self.completions_tx.clone();
        let timeout = self.timeout;
        let kind = ticket.kind;

        tracing::debug!(endpoint = %endpoint, ?kind, "Starting ticket verification");
        self.runtime.handle().spawn(async move {
            let result = match tokio::time::timeout(timeout, future).await {
                Ok(result) => result,
                Err(_) => Err(AuthError::Timeout),
            };
            // The receiver only goes away with the authenticator
            let _ = tx.send(AuthCompletion {
                endpoint,
                generation,
                kind,
                result,
            });
        });
        self.in_flight += 1;
        Ok(())
    }

    /// Drain every verification that finished since the last call
    pub fn poll_completed(&mut self) -> Vec<AuthCompletion> {
        let mut completed = Vec::new();
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            if let Ok(account) = &completion.result {
                self.sessions.insert(account.id.clone(), completion.kind);
            }
            completed.push(completion);
        }
        completed
    }

    /// Release provider resources tied to an account
    pub fn end_session(&mut self, account: &AccountId) {
        let Some(kind) = self.sessions.remove(account) else {
            return;
        };
        if let Some(verifier) = self.verifiers.get(&kind) {
            tracing::debug!(account = %account, "Ending auth session");
            verifier.end_session(account);
        }
    }

    pub fn has_session(&self, account: &AccountId) -> bool {
        self.sessions.contains_key(account)
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("verifiers", &self.verifiers.keys().collect::<Vec<_>>())
            .field("in_flight", &self.in_flight)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
