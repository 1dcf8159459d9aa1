//! Client side of the connection-initialization handshake

use std::time::Duration;

use tidewire_shared::{ContentPackageInfo, check_content_compatibility};

use crate::net::disconnect::{DisconnectPacket, DisconnectReason};
use crate::net::header::InitStep;

use super::messages::{
    AuthInfoAndVersion, ClientInit, ContentPackageAck, ContentPackageOrder, HostInit, InitMessageError,
    PasswordPrompt, PasswordResponse, hash_password,
};

/// Something the owner of a [`ClientHandshake`] must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Send this message to the host
    Send(ClientInit),
    /// Ask the user for the password
    PasswordRequested { salt: u32, retries_left: u8 },
    /// Handshake reached Success
    Complete,
    /// Give up and disconnect
    Fail(DisconnectPacket),
}

/// Client handshake state machine.
///
/// Host messages are tagged with the step the host wants the client in. A
/// tag is only acted on when it is a valid successor of the current step (or
/// a password re-prompt); anything else is ignored, which makes the machine
/// tolerant of duplicated and reordered packets.
#[derive(Debug)]
pub struct ClientHandshake {
    step: InitStep,
    hello: AuthInfoAndVersion,
    prompt: Option<PasswordPrompt>,
    password_response: Option<PasswordResponse>,
    ack: Option<ContentPackageAck>,
    negotiated: Vec<ContentPackageInfo>,
    resend_interval: Duration,
    resend_remaining: Duration,
}

impl ClientHandshake {
    pub fn new(hello: AuthInfoAndVersion, resend_interval: Duration) -> Self {
        Self {
            step: InitStep::AuthInfoAndVersion,
            hello,
            prompt: None,
            password_response: None,
            ack: None,
            negotiated: Vec::new(),
            resend_interval,
            resend_remaining: resend_interval,
        }
    }

    pub fn step(&self) -> InitStep {
        self.step
    }

    pub fn is_complete(&self) -> bool {
        self.step == InitStep::Success
    }

    pub fn is_awaiting_password(&self) -> bool {
        self.step == InitStep::Password && self.password_response.is_none()
    }

    /// Content packages in the host's order, once negotiated
    pub fn negotiated_content_packages(&self) -> &[ContentPackageInfo] {
        &self.negotiated
    }

    /// First message to send
    pub fn start(&mut self) -> ClientInit {
        self.resend_remaining = self.resend_interval;
        ClientInit::AuthInfoAndVersion(self.hello.clone())
    }

    /// Handle a host message tagged `step`
    pub fn handle(&mut self, step: InitStep, body: &[u8]) -> Result<Vec<ClientAction>, InitMessageError> {
        let accepted = matches!(
            (self.step, step),
            (InitStep::AuthInfoAndVersion, InitStep::Password)
                | (InitStep::AuthInfoAndVersion, InitStep::ContentPackageOrder)
                | (InitStep::Password, InitStep::Password)
                | (InitStep::Password, InitStep::ContentPackageOrder)
                | (InitStep::ContentPackageOrder, InitStep::Success)
        );
        if !accepted {
            tracing::debug!(current = ?self.step, received = ?step, "Ignoring init message for another step");
            return Ok(Vec::new());
        }

        match HostInit::decode(step, body)? {
            HostInit::Password(prompt) => {
                if self.prompt == Some(prompt) {
                    tracing::debug!("Ignoring repeated password prompt");
                    return Ok(Vec::new());
                }
                self.step = InitStep::Password;
                self.prompt = Some(prompt);
                self.password_response = None;
                self.resend_remaining = self.resend_interval;
                Ok(vec![ClientAction::PasswordRequested {
                    salt: prompt.salt,
                    retries_left: prompt.retries_left,
                }])
            }
            HostInit::ContentPackageOrder(order) => Ok(vec![self.adopt_order(order)]),
            HostInit::Success => {
                self.step = InitStep::Success;
                tracing::info!("Connection initialized");
                Ok(vec![ClientAction::Complete])
            }
        }
    }

    fn adopt_order(&mut self, order: ContentPackageOrder) -> ClientAction {
        if let Err(mismatch) = check_content_compatibility(&order.packages, &self.hello.content_packages) {
            return ClientAction::Fail(DisconnectPacket::with_message(
                DisconnectReason::MissingContentPackage,
                mismatch.to_string(),
            ));
        }

        let ack = ContentPackageAck {
            hashes: order.packages.iter().map(|p| p.hash).collect(),
        };
        self.negotiated = order.packages;
        self.step = InitStep::ContentPackageOrder;
        self.ack = Some(ack.clone());
        self.resend_remaining = self.resend_interval;
        ClientAction::Send(ClientInit::ContentPackageOrder(ack))
    }

    /// Answer a password prompt. Returns None unless a prompt is outstanding.
    pub fn submit_password(&mut self, password: &str) -> Option<ClientInit> {
        if self.step != InitStep::Password {
            return None;
        }
        let salt = self.prompt?.salt;
        let response = PasswordResponse {
            hash: hash_password(salt, password),
        };
        self.password_response = Some(response);
        self.resend_remaining = self.resend_interval;
        Some(ClientInit::Password(response))
    }

    /// Advance the resend timer, returning the current step's message when due
    pub fn update(&mut self, dt: Duration) -> Option<ClientInit> {
        if self.is_complete() {
            return None;
        }
        self.resend_remaining = self.resend_remaining.saturating_sub(dt);
        if !self.resend_remaining.is_zero() {
            return None;
        }
        self.resend_remaining = self.resend_interval;

        match self.step {
            InitStep::AuthInfoAndVersion => Some(ClientInit::AuthInfoAndVersion(self.hello.clone())),
            InitStep::Password => self.password_response.map(ClientInit::Password),
            InitStep::ContentPackageOrder => self.ack.clone().map(ClientInit::ContentPackageOrder),
            InitStep::Success => None,
        }
    }
}
