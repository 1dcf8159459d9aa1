//! Host side of the connection-initialization handshake
//!
//! One [`HostHandshake`] runs per remote peer. Authentication itself is
//! asynchronous and owned by the relay: the machine stops in
//! `Authenticating` after a valid hello and resumes when the relay calls
//! [`HostHandshake::authenticated`].

use tidewire_shared::AuthTicket;

use crate::net::disconnect::{DisconnectPacket, DisconnectReason};
use crate::net::header::InitStep;

use super::messages::{
    ClientInit, ContentPackageOrder, HostInit, InitMessageError, PasswordPrompt, hash_password,
};
use super::validation::validate_hello;
use super::HostSettings;

/// Host handshake phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    /// Waiting for AuthInfoAndVersion
    AwaitingHello,
    /// Hello accepted, ticket verification in flight
    Authenticating,
    /// Password prompt sent
    Password,
    /// Content package order sent
    ContentPackageOrder,
    /// Success sent
    Success,
}

/// Something the relay must act on for this remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    /// Send this message to the remote
    Send(HostInit),
    /// Verify the remote's ticket, then call `authenticated`
    Authenticate { player_name: String, ticket: Option<AuthTicket> },
    /// Handshake reached Success
    Complete,
    /// Disconnect the remote
    Fail(DisconnectPacket),
}

/// Host handshake state machine for one remote
#[derive(Debug)]
pub struct HostHandshake {
    phase: HostPhase,
    salt: u32,
    retries_left: u8,
    rejected_hash: Option<[u8; 32]>,
    messages_seen: u32,
    max_messages: u32,
    player_name: Option<String>,
}

impl HostHandshake {
    pub fn new(password_retries: u8, max_messages: u32) -> Self {
        Self {
            phase: HostPhase::AwaitingHello,
            salt: rand::random(),
            retries_left: password_retries.max(1),
            rejected_hash: None,
            messages_seen: 0,
            max_messages,
            player_name: None,
        }
    }

    pub fn phase(&self) -> HostPhase {
        self.phase
    }

    /// The client's step as seen by the host
    pub fn init_step(&self) -> InitStep {
        match self.phase {
            HostPhase::AwaitingHello | HostPhase::Authenticating => InitStep::AuthInfoAndVersion,
            HostPhase::Password => InitStep::Password,
            HostPhase::ContentPackageOrder => InitStep::ContentPackageOrder,
            HostPhase::Success => InitStep::Success,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == HostPhase::Success
    }

    pub fn player_name(&self) -> Option<&str> {
        self.player_name.as_deref()
    }

    /// Handle a client message tagged `step`
    pub fn handle(
        &mut self,
        step: InitStep,
        body: &[u8],
        settings: &HostSettings,
    ) -> Result<Vec<HostAction>, InitMessageError> {
        self.messages_seen += 1;
        if self.messages_seen > self.max_messages {
            return Ok(vec![HostAction::Fail(DisconnectPacket::with_message(
                DisconnectReason::TimedOut,
                "Too many initialization messages",
            ))]);
        }

        let message = ClientInit::decode(step, body)?;

        let actions = match (self.phase, message) {
            (HostPhase::AwaitingHello, ClientInit::AuthInfoAndVersion(hello)) => {
                if let Some(reject) = validate_hello(&hello, settings) {
                    return Ok(vec![HostAction::Fail(reject)]);
                }
                self.phase = HostPhase::Authenticating;
                self.player_name = Some(hello.player_name.clone());
                vec![HostAction::Authenticate {
                    player_name: hello.player_name,
                    ticket: hello.ticket,
                }]
            }
            (HostPhase::Authenticating, ClientInit::AuthInfoAndVersion(_)) => Vec::new(),
            (HostPhase::Password, ClientInit::Password(response)) => {
                let expected = settings.password.as_deref().map(|pw| hash_password(self.salt, pw));
                if expected == Some(response.hash) {
                    tracing::debug!("Password accepted");
                    self.enter_content_order(settings)
                } else if self.rejected_hash == Some(response.hash) {
                    // Retransmission of an answer already rejected
                    vec![HostAction::Send(self.password_prompt())]
                } else {
                    self.retries_left = self.retries_left.saturating_sub(1);
                    if self.retries_left == 0 {
                        vec![HostAction::Fail(DisconnectPacket::new(DisconnectReason::WrongPassword))]
                    } else {
                        // Fresh salt so a retyped wrong password still counts
                        self.rejected_hash = Some(response.hash);
                        self.salt = rand::random();
                        vec![HostAction::Send(self.password_prompt())]
                    }
                }
            }
            (HostPhase::ContentPackageOrder, ClientInit::ContentPackageOrder(ack)) => {
                let expected: Vec<u64> = settings.content_packages.iter().map(|p| p.hash).collect();
                if ack.hashes != expected {
                    return Ok(vec![HostAction::Fail(DisconnectPacket::with_message(
                        DisconnectReason::MissingContentPackage,
                        "Content package order was not adopted",
                    ))]);
                }
                self.phase = HostPhase::Success;
                vec![HostAction::Send(HostInit::Success), HostAction::Complete]
            }
            // A step behind or a repeat: the client missed our last prompt
            (phase, message) if message.step() < self.init_step() || phase == HostPhase::Success => {
                self.current_prompt(settings).map(HostAction::Send).into_iter().collect()
            }
            (phase, message) => {
                tracing::debug!(?phase, received = ?message.step(), "Ignoring init message for another step");
                Vec::new()
            }
        };
        Ok(actions)
    }

    /// Ticket verification succeeded; move past authentication
    pub fn authenticated(&mut self, settings: &HostSettings) -> Vec<HostAction> {
        if self.phase != HostPhase::Authenticating {
            return Vec::new();
        }
        if settings.password.is_some() {
            self.phase = HostPhase::Password;
            vec![HostAction::Send(self.password_prompt())]
        } else {
            self.enter_content_order(settings)
        }
    }

    fn enter_content_order(&mut self, settings: &HostSettings) -> Vec<HostAction> {
        self.phase = HostPhase::ContentPackageOrder;
        vec![HostAction::Send(content_order(settings))]
    }

    fn password_prompt(&self) -> HostInit {
        HostInit::Password(PasswordPrompt {
            salt: self.salt,
            retries_left: self.retries_left,
        })
    }

    /// The message the client should currently be answering
    fn current_prompt(&self, settings: &HostSettings) -> Option<HostInit> {
        match self.phase {
            HostPhase::AwaitingHello | HostPhase::Authenticating => None,
            HostPhase::Password => Some(self.password_prompt()),
            HostPhase::ContentPackageOrder => Some(content_order(settings)),
            HostPhase::Success => Some(HostInit::Success),
        }
    }
}

fn content_order(settings: &HostSettings) -> HostInit {
    HostInit::ContentPackageOrder(ContentPackageOrder {
        packages: settings.content_packages.clone(),
    })
}
