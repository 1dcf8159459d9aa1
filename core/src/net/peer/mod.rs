//! Client-side connection to a host
//!
//! A [`Peer`] owns one transport and one upstream session. It is driven by
//! [`Peer::update`], which drains the transport, advances the handshake, and
//! runs the heartbeat and timeout timers. Nothing happens between calls.
//!
//! ```text
//!  start() ──► AuthInfoAndVersion ──► [Password] ──► ContentPackageOrder ──► Success
//!                  │ resend every init_resend_interval until the host answers
//!                  └─ handshake_timeout without Success ──► TimedOut
//! ```


use std::time::Duration;

use tidewire_shared::{ContentPackageInfo, Endpoint};

use crate::config::NetConfig;

use super::codec::{OutgoingPacket, PacketCodec, PacketError};
use super::disconnect::{DisconnectPacket, DisconnectReason};
use super::header::{DeliveryMethod, Framing, InitStep};
use super::init::{ClientAction, ClientHandshake, ClientIdentity, ClientInit};
use super::transport::{Transport, TransportEvent, send_packet};
use super::types::{NetError, TrafficStats};

/// Events surfaced by [`Peer::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Game payload from the host. Payloads that arrive before Success are
    /// held and surfaced right after `InitializationComplete`.
    MessageReceived(Vec<u8>),
    /// The host wants the session password; answer with `send_password`
    PasswordRequested { salt: u32, retries_left: u8 },
    /// The handshake reached Success
    InitializationComplete,
    /// The session ended
    Disconnected(DisconnectPacket),
}

/// State of one started session, dropped on close
#[derive(Debug)]
struct Session {
    codec: PacketCodec,
    handshake: ClientHandshake,
    timeout_remaining: Duration,
    heartbeat_remaining: Duration,
    handshake_remaining: Duration,
    /// Game payloads that beat Success here
    early_messages: Vec<Vec<u8>>,
    stats: TrafficStats,
}

/// Client connection to a single host
pub struct Peer<T: Transport> {
    /// The host
    endpoint: Endpoint,
    transport: T,
    config: NetConfig,
    identity: ClientIdentity,
    round_active: bool,
    session: Option<Session>,
}

impl<T: Transport> Peer<T> {
    pub fn new(endpoint: Endpoint, transport: T, config: NetConfig, identity: ClientIdentity) -> Self {
        Self {
            endpoint,
            transport,
            config,
            identity,
            round_active: false,
            session: None,
        }
    }

    /// The host endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Current handshake step, `None` when inactive
    pub fn init_step(&self) -> Option<InitStep> {
        self.session.as_ref().map(|s| s.handshake.step())
    }

    pub fn is_initialized(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.handshake.is_complete())
    }

    /// Counters for the current session
    pub fn stats(&self) -> TrafficStats {
        self.session.as_ref().map(|s| s.stats).unwrap_or_default()
    }

    /// Host's package order, once negotiated
    pub fn negotiated_content_packages(&self) -> &[ContentPackageInfo] {
        self.session
            .as_ref()
            .map(|s| s.handshake.negotiated_content_packages())
            .unwrap_or(&[])
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Open the session and send the first handshake message
    pub fn start(&mut self) -> Result<(), NetError> {
        if self.session.is_some() {
            return Err(NetError::AlreadyActive);
        }
        self.transport.connect(&self.endpoint)?;

        let timing = &self.config.timing;
        let mut session = Session {
            codec: PacketCodec::new(&self.config, false),
            handshake: ClientHandshake::new(self.identity.hello(), timing.init_resend_interval()),
            timeout_remaining: timing.timeout(self.round_active),
            heartbeat_remaining: timing.heartbeat_interval(),
            handshake_remaining: timing.handshake_timeout(),
            early_messages: Vec::new(),
            stats: TrafficStats::default(),
        };
        let hello = session.handshake.start();
        self.session = Some(session);
        self.send_init(&hello)?;

        tracing::info!(host = %self.endpoint, player = %self.identity.player_name, "Peer started");
        Ok(())
    }

    /// Send a game payload to the host
    pub fn send(&mut self, payload: &[u8], delivery: DeliveryMethod, allow_compression: bool) -> Result<(), NetError> {
        let session = self.session.as_mut().ok_or(NetError::Inactive)?;
        if !session.handshake.is_complete() {
            return Err(NetError::NotInitialized);
        }
        let packets = session.codec.encode_data(payload, delivery, allow_compression)?;
        self.transmit(&packets);
        Ok(())
    }

    /// Answer an outstanding password prompt
    pub fn send_password(&mut self, password: &str) -> Result<(), NetError> {
        let session = self.session.as_mut().ok_or(NetError::Inactive)?;
        let response = session
            .handshake
            .submit_password(password)
            .ok_or(NetError::NotAwaitingPassword)?;
        self.send_init(&response)
    }

    /// Switch between the idle and in-round timeouts. Restarts the countdown.
    pub fn set_round_active(&mut self, active: bool) {
        self.round_active = active;
        let timeout = self.config.timing.timeout(active);
        if let Some(session) = self.session.as_mut() {
            session.timeout_remaining = timeout;
        }
    }

    /// Tell the host we are leaving and end the session
    pub fn close(&mut self, packet: DisconnectPacket) {
        if self.session.is_none() {
            return;
        }
        self.send_disconnect(&packet);
        self.end_session(&packet);
    }

    /// Advance the connection by `dt`
    pub fn update(&mut self, dt: Duration) -> Vec<PeerEvent> {
        let mut events = Vec::new();

        while self.session.is_some() {
            let Some(event) = self.transport.poll() else {
                break;
            };
            match event {
                TransportEvent::Data { from, data } if from == self.endpoint => {
                    self.handle_datagram(&data, &mut events);
                }
                TransportEvent::Data { from, .. } => {
                    tracing::debug!(from = %from, "Ignoring data from unknown endpoint");
                }
                TransportEvent::Closed(endpoint) if endpoint == self.endpoint => {
                    let packet = DisconnectPacket::new(DisconnectReason::Disconnected);
                    self.end_session(&packet);
                    events.push(PeerEvent::Disconnected(packet));
                }
                TransportEvent::Closed(_) => {}
                TransportEvent::ConnectionRequested(endpoint) => {
                    tracing::debug!(from = %endpoint, "Ignoring connection request");
                    self.transport.close(&endpoint);
                }
            }
        }

        if self.session.is_some() {
            self.run_timers(dt, &mut events);
        }
        events
    }

    fn handle_datagram(&mut self, data: &[u8], events: &mut Vec<PeerEvent>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stats.record_received(data.len());

        let packet = match session.codec.decode(data) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                // Partial fragment still counts as life from the host
                session.timeout_remaining = self.config.timing.timeout(self.round_active);
                return;
            }
            Err(e) => {
                self.fail(malformed(&e), events);
                return;
            }
        };

        if !packet.header.is_server_message() {
            self.fail(
                DisconnectPacket::with_message(DisconnectReason::MalformedData, "Packet is not from a server"),
                events,
            );
            return;
        }
        session.timeout_remaining = self.config.timing.timeout(self.round_active);
        tracing::trace!(framing = ?packet.framing(), len = packet.body.len(), "Packet from host");

        match packet.framing() {
            Framing::Heartbeat => {}
            Framing::Disconnect => {
                let packet = packet.disconnect_packet().unwrap_or_else(|e| malformed(&e));
                tracing::info!(host = %self.endpoint, reason = %packet.reason, "Disconnected by host");
                self.end_session(&packet);
                events.push(PeerEvent::Disconnected(packet));
            }
            Framing::InitStep(step) => match session.handshake.handle(step, &packet.body) {
                Ok(actions) => self.apply(actions, events),
                Err(e) => self.fail(
                    DisconnectPacket::with_message(DisconnectReason::MalformedData, e.to_string()),
                    events,
                ),
            },
            Framing::Data if session.handshake.is_complete() => {
                events.push(PeerEvent::MessageReceived(packet.body));
            }
            Framing::Data if session.early_messages.len() < self.config.handshake.max_init_messages as usize => {
                tracing::debug!("Holding game data received before initialization");
                session.early_messages.push(packet.body);
            }
            Framing::Data => {
                tracing::warn!("Too much game data before initialization, dropping");
            }
            Framing::Fragment => self.fail(malformed(&PacketError::NestedFragment), events),
        }
    }

    fn apply(&mut self, actions: Vec<ClientAction>, events: &mut Vec<PeerEvent>) {
        for action in actions {
            match action {
                ClientAction::Send(message) => self.resend_init(&message),
                ClientAction::PasswordRequested { salt, retries_left } => {
                    tracing::info!(retries_left, "Host requested a password");
                    events.push(PeerEvent::PasswordRequested { salt, retries_left });
                }
                ClientAction::Complete => {
                    events.push(PeerEvent::InitializationComplete);
                    if let Some(session) = self.session.as_mut() {
                        events.extend(session.early_messages.drain(..).map(PeerEvent::MessageReceived));
                    }
                }
                ClientAction::Fail(packet) => {
                    self.fail(packet, events);
                    return;
                }
            }
        }
    }

    fn run_timers(&mut self, dt: Duration, events: &mut Vec<PeerEvent>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.codec.update(dt);
        // Sends during this tick restart the heartbeat timer
        session.heartbeat_remaining = session.heartbeat_remaining.saturating_sub(dt);

        if !session.handshake.is_complete() {
            session.handshake_remaining = session.handshake_remaining.saturating_sub(dt);
            if session.handshake_remaining.is_zero() {
                self.fail(
                    DisconnectPacket::with_message(DisconnectReason::TimedOut, "Initialization timed out"),
                    events,
                );
                return;
            }
            if let Some(resend) = session.handshake.update(dt) {
                tracing::debug!(step = ?resend.step(), "Resending init message");
                self.resend_init(&resend);
            }
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.timeout_remaining = session.timeout_remaining.saturating_sub(dt);
        if session.timeout_remaining.is_zero() {
            self.fail(DisconnectPacket::new(DisconnectReason::TimedOut), events);
            return;
        }

        if session.heartbeat_remaining.is_zero() {
            match session.codec.encode_heartbeat() {
                Ok(packets) => self.transmit(&packets),
                Err(e) => tracing::warn!(error = %e, "Failed to encode heartbeat"),
            }
        }
    }

    /// Close with `packet`, telling the host, and surface the event
    fn fail(&mut self, packet: DisconnectPacket, events: &mut Vec<PeerEvent>) {
        tracing::warn!(host = %self.endpoint, reason = %packet.reason, "Closing connection");
        self.close(packet.clone());
        events.push(PeerEvent::Disconnected(packet));
    }

    fn send_init(&mut self, message: &ClientInit) -> Result<(), NetError> {
        let session = self.session.as_mut().ok_or(NetError::Inactive)?;
        let packets = session.codec.encode_init(message.step(), &message.encode())?;
        self.transmit(&packets);
        Ok(())
    }

    /// Send an init message from inside the tick, where errors are only logged
    fn resend_init(&mut self, message: &ClientInit) {
        if let Err(e) = self.send_init(message) {
            tracing::warn!(step = ?message.step(), error = %e, "Failed to send init message");
        }
    }

    fn send_disconnect(&mut self, packet: &DisconnectPacket) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.codec.encode_disconnect(packet) {
            Ok(packets) => self.transmit(&packets),
            Err(e) => tracing::warn!(error = %e, "Failed to encode disconnect packet"),
        }
    }

    /// Hand packets to the transport; any send restarts the heartbeat timer
    fn transmit(&mut self, packets: &[OutgoingPacket]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        for packet in packets {
            let sent = send_packet(&mut self.transport, &self.endpoint, packet);
            session.stats.record_sent(sent);
        }
        session.heartbeat_remaining = self.config.timing.heartbeat_interval();
    }

    fn end_session(&mut self, packet: &DisconnectPacket) {
        if let Some(session) = self.session.take() {
            tracing::info!(
                host = %self.endpoint,
                reason = %packet.reason,
                bytes_sent = session.stats.bytes_sent,
                bytes_received = session.stats.bytes_received,
                "Peer closed"
            );
            self.transport.close(&self.endpoint);
        }
    }
}

impl<T: Transport> Drop for Peer<T> {
    fn drop(&mut self) {
        self.close(DisconnectPacket::new(DisconnectReason::Disconnected));
        self.transport.shutdown();
    }
}

impl<T: Transport> std::fmt::Debug for Peer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("endpoint", &self.endpoint)
            .field("active", &self.is_active())
            .field("init_step", &self.init_step())
            .field("round_active", &self.round_active)
            .finish()
    }
}

fn malformed(error: &PacketError) -> DisconnectPacket {
    DisconnectPacket::with_message(DisconnectReason::MalformedData, error.to_string())
}
