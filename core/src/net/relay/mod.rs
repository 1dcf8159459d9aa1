//! Owner relay
//!
//! The hosting player's process runs the relay. It accepts remote peers on
//! one shared transport, runs a host handshake and ticket verification for
//! each, and forwards game traffic between initialized remotes and the
//! dedicated server subprocess.
//!
//! ```text
//!   remote A ─┐                        ┌──────────────┐
//!   remote B ─┼── Transport ── Relay ──┤  ServerPipe  ├── server subprocess
//!   remote C ─┘        │               └──────────────┘
//!                 DosGuard, Authenticator
//! ```
//!
//! Each remote is independent: a malformed packet, a slow verification or a
//! timeout affects only that remote's entry. Disconnects are two-phase. The
//! remote is told first; the server hears about it after
//! `disconnect_grace_ms`, or at once if the remote is already gone.

mod remote;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tidewire_shared::{AccountId, AuthTicket, Endpoint};

use crate::config::NetConfig;

use super::auth::{AuthCompletion, Authenticator};
use super::codec::{PacketCodec, PacketError};
use super::disconnect::{DisconnectPacket, DisconnectReason};
use super::guard::DosGuard;
use super::header::{DeliveryMethod, Framing, PacketHeader};
use super::init::{HostAction, HostInit, HostSettings};
use super::pipe::{PipeError, PipeMessage, ServerPipe};
use super::transport::{Transport, TransportEvent, send_packet};
use super::types::{NetError, TrafficStats};

use remote::{PendingDisconnect, RemotePeer};
pub use remote::{AuthStatus, RemotePeerState};

/// Events surfaced by [`OwnerRelay::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A remote finished initialization and was announced to the server
    RemoteConnected { endpoint: Endpoint, account: Option<AccountId> },
    /// A remote entry was removed
    RemoteDisconnected { endpoint: Endpoint, packet: DisconnectPacket },
    /// Game payload from the server for the owning player
    OwnerMessage { delivery: DeliveryMethod, payload: Vec<u8> },
    /// The rate guard caught a remote
    RemoteFlagged { endpoint: Endpoint, banned: bool },
    /// The relay stopped
    Closed(DisconnectPacket),
}

/// Fan-in/fan-out hub between remote peers and the server subprocess
pub struct OwnerRelay<T: Transport, P: ServerPipe> {
    transport: T,
    pipe: P,
    authenticator: Authenticator,
    config: NetConfig,
    settings: HostSettings,
    guard: DosGuard,
    remotes: HashMap<Endpoint, RemotePeer>,
    banned: HashSet<Endpoint>,
    /// Refused endpoints and how long until they get another refusal
    refused: HashMap<Endpoint, Duration>,
    next_generation: u64,
    round_active: bool,
    active: bool,
    stats: TrafficStats,
    events: Vec<RelayEvent>,
}

impl<T: Transport, P: ServerPipe> OwnerRelay<T, P> {
    pub fn new(transport: T, pipe: P, authenticator: Authenticator, config: NetConfig, settings: HostSettings) -> Self {
        let authenticator = authenticator.with_timeout(config.timing.auth_timeout());
        let guard = DosGuard::new(&config.dos);
        Self {
            transport,
            pipe,
            authenticator,
            config,
            settings,
            guard,
            remotes: HashMap::new(),
            banned: HashSet::new(),
            refused: HashMap::new(),
            next_generation: 0,
            round_active: false,
            active: false,
            stats: TrafficStats::default(),
            events: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub fn remote_state(&self, endpoint: &Endpoint) -> Option<RemotePeerState> {
        self.remotes.get(endpoint).map(RemotePeer::snapshot)
    }

    pub fn remote_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self.remotes.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    pub fn is_banned(&self, endpoint: &Endpoint) -> bool {
        self.banned.contains(endpoint)
    }

    /// Packet rate offenses currently held against an endpoint
    pub fn strikes(&self, endpoint: &Endpoint) -> u32 {
        self.guard.strikes(endpoint)
    }

    /// Totals over every remote, including refused ones
    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn start(&mut self) -> Result<(), NetError> {
        if self.active {
            return Err(NetError::AlreadyActive);
        }
        if !self.pipe.is_alive() {
            return Err(PipeError::Closed.into());
        }
        self.active = true;
        tracing::info!(
            max_remote_peers = self.config.relay.max_remote_peers,
            password = self.settings.password.is_some(),
            "Owner relay started"
        );
        Ok(())
    }

    /// Forward a payload from the owning player to the server
    pub fn send(&mut self, payload: &[u8], delivery: DeliveryMethod) -> Result<(), NetError> {
        if !self.active {
            return Err(NetError::Inactive);
        }
        self.pipe.send(&PipeMessage::OwnerData {
            delivery,
            payload: payload.to_vec(),
        })?;
        Ok(())
    }

    /// Switch every remote between the idle and in-round timeouts
    pub fn set_round_active(&mut self, active: bool) {
        self.round_active = active;
        let timeout = self.config.timing.timeout(active);
        for remote in self.remotes.values_mut() {
            remote.timeout_remaining = timeout;
        }
    }

    /// Start a two-phase disconnect. Returns false for unknown endpoints.
    pub fn disconnect_remote(&mut self, endpoint: &Endpoint, packet: DisconnectPacket) -> bool {
        if !self.remotes.contains_key(endpoint) {
            return false;
        }
        self.begin_disconnect(endpoint, packet);
        true
    }

    /// Refuse an endpoint from now on and disconnect it if present
    pub fn ban(&mut self, endpoint: &Endpoint) {
        self.banned.insert(endpoint.clone());
        self.guard.forget(endpoint);
        self.disconnect_remote(endpoint, DisconnectPacket::new(DisconnectReason::Banned));
    }

    /// Stop the relay: every remote is told, then the server
    pub fn close(&mut self, packet: DisconnectPacket) {
        if !self.active {
            return;
        }
        self.shut_down(packet.clone(), true);
        self.events.push(RelayEvent::Closed(packet));
    }

    /// Advance the relay by `dt`
    pub fn update(&mut self, dt: Duration) -> Vec<RelayEvent> {
        if self.active {
            self.poll_auth();
            self.poll_transport();
            self.poll_pipe();
            self.check_server();
        }
        if self.active {
            self.run_timers(dt);
            self.expire_refusals(dt);
            self.run_guard(dt);
            self.finalize_disconnects();
        }
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn poll_auth(&mut self) {
        for completion in self.authenticator.poll_completed() {
            self.apply_auth(completion);
        }
    }

    fn apply_auth(&mut self, completion: AuthCompletion) {
        let AuthCompletion {
            endpoint,
            generation,
            result,
            ..
        } = completion;

        let current = self
            .remotes
            .get(&endpoint)
            .is_some_and(|r| r.generation == generation && r.auth_status == AuthStatus::Pending && !r.is_disconnecting());
        if !current {
            tracing::debug!(endpoint = %endpoint, "Discarding stale ticket verification");
            if let Ok(account) = result {
                self.authenticator.end_session(&account.id);
            }
            return;
        }
        let Some(remote) = self.remotes.get_mut(&endpoint) else {
            return;
        };

        match result {
            Ok(account) if !account.matches_endpoint(&endpoint) => {
                tracing::warn!(endpoint = %endpoint, account = %account.id, "Account does not own endpoint");
                remote.account = Some(account);
                remote.auth_status = AuthStatus::Failed;
                self.begin_disconnect(
                    &endpoint,
                    DisconnectPacket::with_message(DisconnectReason::AuthenticationFailed, "Account does not match endpoint"),
                );
            }
            Ok(account) => {
                tracing::info!(endpoint = %endpoint, account = %account.id, "Remote peer authenticated");
                remote.account = Some(account);
                remote.auth_status = AuthStatus::Authenticated;
                let actions = remote.handshake.authenticated(&self.settings);
                let buffered: Vec<Vec<u8>> = remote.buffered.drain(..).collect();

                self.apply_host_actions(&endpoint, actions);
                for datagram in buffered {
                    self.handle_remote_datagram(&endpoint, &datagram);
                }
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "Ticket verification failed");
                remote.auth_status = AuthStatus::Failed;
                self.begin_disconnect(
                    &endpoint,
                    DisconnectPacket::with_message(DisconnectReason::AuthenticationFailed, e.to_string()),
                );
            }
        }
    }

    fn poll_transport(&mut self) {
        while self.active {
            let Some(event) = self.transport.poll() else {
                break;
            };
            match event {
                TransportEvent::ConnectionRequested(endpoint) => {
                    self.handle_connection_request(&endpoint);
                }
                TransportEvent::Data { from, data } => {
                    self.stats.record_received(data.len());
                    if !self.remotes.contains_key(&from) {
                        if self.banned.contains(&from) {
                            tracing::trace!(from = %from, "Dropping packet from banned endpoint");
                            continue;
                        }
                        if !self.handle_connection_request(&from) {
                            continue;
                        }
                    }
                    if !self.banned.contains(&from) {
                        self.guard.on_packet(&from);
                    }
                    if let Some(remote) = self.remotes.get_mut(&from) {
                        remote.stats.record_received(data.len());
                    }
                    self.handle_remote_datagram(&from, &data);
                }
                TransportEvent::Closed(endpoint) => {
                    if let Some(remote) = self.remotes.get(&endpoint) {
                        let packet = match &remote.pending_disconnect {
                            Some(pending) => pending.packet.clone(),
                            None => DisconnectPacket::new(DisconnectReason::Disconnected),
                        };
                        self.finalize(&endpoint, packet);
                    }
                }
            }
        }
    }

    /// Accept or refuse a new endpoint. Returns whether it has an entry.
    fn handle_connection_request(&mut self, endpoint: &Endpoint) -> bool {
        if self.remotes.contains_key(endpoint) {
            return true;
        }
        if self.banned.contains(endpoint) {
            self.refuse(endpoint, DisconnectReason::Banned);
            return false;
        }
        if self.remotes.len() >= self.config.relay.max_remote_peers {
            self.refuse(endpoint, DisconnectReason::ServerFull);
            return false;
        }
        if let Err(e) = self.transport.accept(endpoint) {
            tracing::warn!(endpoint = %endpoint, error = %e, "Failed to accept connection");
            return false;
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.remotes.insert(
            endpoint.clone(),
            RemotePeer::new(endpoint.clone(), generation, &self.config, self.round_active),
        );
        tracing::info!(endpoint = %endpoint, remotes = self.remotes.len(), "Remote peer connected");
        true
    }

    /// Answer with `reason` at most once per resend interval, then close
    fn refuse(&mut self, endpoint: &Endpoint, reason: DisconnectReason) {
        if self.refused.contains_key(endpoint) {
            tracing::trace!(endpoint = %endpoint, %reason, "Dropping request from refused endpoint");
        } else {
            tracing::info!(endpoint = %endpoint, %reason, "Refusing connection");
            let mut codec = PacketCodec::new(&self.config, true);
            match codec.encode_disconnect(&DisconnectPacket::new(reason)) {
                Ok(packets) => {
                    for packet in &packets {
                        let sent = send_packet(&mut self.transport, endpoint, packet);
                        self.stats.record_sent(sent);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to encode disconnect packet"),
            }
            self.refused
                .insert(endpoint.clone(), self.config.timing.init_resend_interval());
        }
        self.transport.close(endpoint);
    }

    fn handle_remote_datagram(&mut self, endpoint: &Endpoint, data: &[u8]) {
        let Some(remote) = self.remotes.get_mut(endpoint) else {
            return;
        };

        if remote.is_disconnecting() {
            // Only the remote's own goodbye matters now
            if is_disconnect(data) {
                if let Some(pending) = &remote.pending_disconnect {
                    let packet = pending.packet.clone();
                    self.finalize(endpoint, packet);
                }
            }
            return;
        }

        if remote.auth_status == AuthStatus::Pending {
            if is_disconnect(data) {
                self.finalize(endpoint, DisconnectPacket::new(DisconnectReason::Disconnected));
                return;
            }
            remote.buffered.push_back(data.to_vec());
            if remote.buffered.len() > self.config.handshake.max_init_messages as usize {
                self.begin_disconnect(
                    endpoint,
                    DisconnectPacket::with_message(DisconnectReason::TimedOut, "Too many messages while authenticating"),
                );
            }
            return;
        }

        let packet = match remote.codec.decode(data) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                remote.timeout_remaining = self.config.timing.timeout(self.round_active);
                return;
            }
            Err(e) => {
                self.reject_malformed(endpoint, &e);
                return;
            }
        };

        if packet.header.is_server_message() {
            tracing::warn!(endpoint = %endpoint, "Remote sent a server-flagged packet");
            self.begin_disconnect(
                endpoint,
                DisconnectPacket::with_message(DisconnectReason::MalformedData, "Unexpected server message flag"),
            );
            return;
        }
        remote.timeout_remaining = self.config.timing.timeout(self.round_active);
        tracing::trace!(endpoint = %endpoint, framing = ?packet.framing(), len = packet.body.len(), "Packet from remote");

        match packet.framing() {
            Framing::Heartbeat => {}
            Framing::Disconnect => {
                let packet = packet
                    .disconnect_packet()
                    .unwrap_or_else(|_| DisconnectPacket::new(DisconnectReason::Disconnected));
                tracing::info!(endpoint = %endpoint, reason = %packet.reason, "Remote peer left");
                self.finalize(endpoint, packet);
            }
            Framing::InitStep(step) => match remote.handshake.handle(step, &packet.body, &self.settings) {
                Ok(actions) => self.apply_host_actions(endpoint, actions),
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Malformed init message");
                    self.begin_disconnect(
                        endpoint,
                        DisconnectPacket::with_message(DisconnectReason::MalformedData, e.to_string()),
                    );
                }
            },
            Framing::Data if remote.handshake.is_complete() => {
                let message = PipeMessage::PeerData {
                    endpoint: endpoint.clone(),
                    account: remote.account.as_ref().map(|a| a.id.clone()),
                    delivery: packet.header.delivery,
                    payload: packet.body,
                };
                if let Err(e) = self.pipe.send(&message) {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Failed to forward to server");
                }
            }
            Framing::Data => {
                tracing::debug!(endpoint = %endpoint, "Dropping game data from uninitialized remote");
            }
            Framing::Fragment => self.reject_malformed(endpoint, &PacketError::NestedFragment),
        }
    }

    fn reject_malformed(&mut self, endpoint: &Endpoint, error: &PacketError) {
        tracing::warn!(endpoint = %endpoint, error = %error, "Malformed packet from remote");
        self.begin_disconnect(
            endpoint,
            DisconnectPacket::with_message(DisconnectReason::MalformedData, error.to_string()),
        );
    }

    fn apply_host_actions(&mut self, endpoint: &Endpoint, actions: Vec<HostAction>) {
        for action in actions {
            match action {
                HostAction::Send(message) => self.send_init(endpoint, &message),
                HostAction::Authenticate { player_name, ticket } => {
                    tracing::debug!(endpoint = %endpoint, player = %player_name, "Hello accepted");
                    self.start_auth(endpoint, ticket);
                }
                HostAction::Complete => self.announce(endpoint),
                HostAction::Fail(packet) => {
                    tracing::info!(endpoint = %endpoint, reason = %packet.reason, "Handshake rejected remote");
                    self.begin_disconnect(endpoint, packet);
                    return;
                }
            }
        }
    }

    fn start_auth(&mut self, endpoint: &Endpoint, ticket: Option<AuthTicket>) {
        let Some(remote) = self.remotes.get_mut(endpoint) else {
            return;
        };

        let Some(ticket) = ticket else {
            if self.config.relay.require_authentication {
                self.begin_disconnect(endpoint, DisconnectPacket::new(DisconnectReason::AuthenticationRequired));
                return;
            }
            tracing::debug!(endpoint = %endpoint, "No ticket, continuing unauthenticated");
            let actions = remote.handshake.authenticated(&self.settings);
            self.apply_host_actions(endpoint, actions);
            return;
        };

        match self.authenticator.begin(endpoint.clone(), remote.generation, &ticket) {
            Ok(()) => remote.auth_status = AuthStatus::Pending,
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "Cannot verify ticket");
                remote.auth_status = AuthStatus::Failed;
                self.begin_disconnect(
                    endpoint,
                    DisconnectPacket::with_message(DisconnectReason::AuthenticationFailed, e.to_string()),
                );
            }
        }
    }

    /// Handshake reached Success: tell the server about this remote
    fn announce(&mut self, endpoint: &Endpoint) {
        let Some(remote) = self.remotes.get_mut(endpoint) else {
            return;
        };
        let account = remote.account.as_ref().map(|a| a.id.clone());
        remote.announced = true;

        let message = PipeMessage::PeerConnected {
            endpoint: endpoint.clone(),
            account: account.clone(),
        };
        if let Err(e) = self.pipe.send(&message) {
            tracing::warn!(endpoint = %endpoint, error = %e, "Failed to announce remote to server");
        }
        tracing::info!(endpoint = %endpoint, "Remote peer initialized");
        self.events.push(RelayEvent::RemoteConnected {
            endpoint: endpoint.clone(),
            account,
        });
    }

    fn poll_pipe(&mut self) {
        while self.active {
            let Some(message) = self.pipe.poll() else {
                break;
            };
            match message {
                PipeMessage::ToPeer {
                    endpoint,
                    delivery,
                    payload,
                } => self.relay_to_remote(&endpoint, &payload, delivery),
                PipeMessage::ToOwner { delivery, payload } => {
                    self.events.push(RelayEvent::OwnerMessage { delivery, payload });
                }
                PipeMessage::DisconnectPeer { endpoint, packet } => {
                    self.disconnect_remote(&endpoint, packet);
                }
                PipeMessage::Shutdown(packet) => {
                    tracing::info!(reason = %packet.reason, "Server requested shutdown");
                    self.close(packet);
                }
                other => {
                    tracing::warn!(kind = other.kind(), "Ignoring relay-bound message from server");
                }
            }
        }
    }

    fn relay_to_remote(&mut self, endpoint: &Endpoint, payload: &[u8], delivery: DeliveryMethod) {
        let Some(remote) = self.remotes.get_mut(endpoint).filter(|r| r.is_ready()) else {
            tracing::debug!(endpoint = %endpoint, "Dropping message for unavailable remote");
            return;
        };
        match remote.codec.encode_data(payload, delivery, true) {
            Ok(packets) => {
                let sent = remote.transmit(&mut self.transport, &packets);
                self.stats.record_sent(sent);
            }
            Err(e) => tracing::warn!(endpoint = %endpoint, error = %e, "Failed to encode message for remote"),
        }
    }

    fn check_server(&mut self) {
        if !self.active || self.pipe.is_alive() {
            return;
        }
        tracing::error!("Server subprocess lost");
        let packet = DisconnectPacket::new(DisconnectReason::ServerCrashed);
        self.shut_down(packet.clone(), false);
        self.events.push(RelayEvent::Closed(packet));
    }

    // ------------------------------------------------------------------------
    // Outbound helpers
    // ------------------------------------------------------------------------

    fn send_init(&mut self, endpoint: &Endpoint, message: &HostInit) {
        let Some(remote) = self.remotes.get_mut(endpoint) else {
            return;
        };
        match remote.codec.encode_init(message.step(), &message.encode()) {
            Ok(packets) => {
                let sent = remote.transmit(&mut self.transport, &packets);
                self.stats.record_sent(sent);
            }
            Err(e) => tracing::warn!(endpoint = %endpoint, error = %e, "Failed to encode init message"),
        }
    }

    /// Phase one: tell the remote and start the grace period
    fn begin_disconnect(&mut self, endpoint: &Endpoint, packet: DisconnectPacket) {
        let Some(remote) = self.remotes.get_mut(endpoint) else {
            return;
        };
        if remote.is_disconnecting() {
            return;
        }
        tracing::info!(endpoint = %endpoint, reason = %packet.reason, "Disconnecting remote peer");

        match remote.codec.encode_disconnect(&packet) {
            Ok(packets) => {
                let sent = remote.transmit(&mut self.transport, &packets);
                self.stats.record_sent(sent);
            }
            Err(e) => tracing::warn!(endpoint = %endpoint, error = %e, "Failed to encode disconnect packet"),
        }
        remote.buffered.clear();
        remote.pending_disconnect = Some(PendingDisconnect {
            remaining: self.config.timing.disconnect_grace(),
            packet,
        });
    }

    /// Phase two: tell the server, release auth, drop the entry
    fn finalize(&mut self, endpoint: &Endpoint, packet: DisconnectPacket) {
        let Some(remote) = self.remotes.remove(endpoint) else {
            return;
        };
        if remote.announced {
            let message = PipeMessage::PeerDisconnected {
                endpoint: endpoint.clone(),
                account: remote.account.as_ref().map(|a| a.id.clone()),
                packet: packet.clone(),
            };
            if let Err(e) = self.pipe.send(&message) {
                tracing::warn!(endpoint = %endpoint, error = %e, "Failed to tell server about disconnect");
            }
        }
        if let Some(account) = &remote.account {
            self.authenticator.end_session(&account.id);
        }
        self.transport.close(endpoint);

        tracing::info!(
            endpoint = %endpoint,
            reason = %packet.reason,
            bytes_sent = remote.stats.bytes_sent,
            bytes_received = remote.stats.bytes_received,
            "Remote peer removed"
        );
        self.events.push(RelayEvent::RemoteDisconnected {
            endpoint: endpoint.clone(),
            packet,
        });
    }

    fn finalize_disconnects(&mut self) {
        let due: Vec<(Endpoint, DisconnectPacket)> = self
            .remotes
            .values()
            .filter_map(|r| {
                r.pending_disconnect
                    .as_ref()
                    .filter(|p| p.remaining.is_zero())
                    .map(|p| (r.endpoint.clone(), p.packet.clone()))
            })
            .collect();
        for (endpoint, packet) in due {
            self.finalize(&endpoint, packet);
        }
    }

    /// Disconnect everything. `server_alive` selects whether the server is told.
    fn shut_down(&mut self, packet: DisconnectPacket, server_alive: bool) {
        tracing::info!(reason = %packet.reason, remotes = self.remotes.len(), "Owner relay closing");
        for endpoint in self.remote_endpoints() {
            self.begin_disconnect(&endpoint, packet.clone());
            if let Some(remote) = self.remotes.remove(&endpoint) {
                if let Some(account) = &remote.account {
                    self.authenticator.end_session(&account.id);
                }
                self.transport.close(&endpoint);
                self.events.push(RelayEvent::RemoteDisconnected {
                    endpoint,
                    packet: packet.clone(),
                });
            }
        }

        if server_alive {
            if let Err(e) = self.pipe.send(&PipeMessage::Shutdown(packet)) {
                tracing::warn!(error = %e, "Failed to tell server about shutdown");
            }
        }
        self.pipe.close();
        self.active = false;
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn run_timers(&mut self, dt: Duration) {
        let mut timed_out = Vec::new();
        let mut heartbeats = Vec::new();

        for remote in self.remotes.values_mut() {
            remote.codec.update(dt);
            if let Some(pending) = remote.pending_disconnect.as_mut() {
                pending.remaining = pending.remaining.saturating_sub(dt);
                continue;
            }

            remote.heartbeat_remaining = remote.heartbeat_remaining.saturating_sub(dt);
            remote.timeout_remaining = remote.timeout_remaining.saturating_sub(dt);
            if !remote.handshake.is_complete() {
                remote.handshake_remaining = remote.handshake_remaining.saturating_sub(dt);
            }

            if remote.timeout_remaining.is_zero() {
                timed_out.push((remote.endpoint.clone(), "Connection timed out"));
            } else if !remote.handshake.is_complete() && remote.handshake_remaining.is_zero() {
                timed_out.push((remote.endpoint.clone(), "Initialization timed out"));
            } else if remote.heartbeat_remaining.is_zero() {
                heartbeats.push(remote.endpoint.clone());
            }
        }

        timed_out.sort();
        heartbeats.sort();
        for endpoint in heartbeats {
            let Some(remote) = self.remotes.get_mut(&endpoint) else {
                continue;
            };
            match remote.codec.encode_heartbeat() {
                Ok(packets) => {
                    let sent = remote.transmit(&mut self.transport, &packets);
                    self.stats.record_sent(sent);
                }
                Err(e) => tracing::warn!(endpoint = %endpoint, error = %e, "Failed to encode heartbeat"),
            }
        }

        for (endpoint, message) in timed_out {
            self.begin_disconnect(&endpoint, DisconnectPacket::with_message(DisconnectReason::TimedOut, message));
        }
    }

    fn expire_refusals(&mut self, dt: Duration) {
        self.refused.retain(|_, quiet| {
            *quiet = quiet.saturating_sub(dt);
            !quiet.is_zero()
        });
    }

    fn run_guard(&mut self, dt: Duration) {
        let mut offenders = Vec::new();
        self.guard
            .update(dt, |endpoint, should_ban| offenders.push((endpoint.clone(), should_ban)));

        for (endpoint, should_ban) in offenders {
            if should_ban {
                self.banned.insert(endpoint.clone());
                self.guard.forget(&endpoint);
                self.disconnect_remote(&endpoint, DisconnectPacket::new(DisconnectReason::Banned));
            } else {
                self.disconnect_remote(&endpoint, DisconnectPacket::new(DisconnectReason::ExcessivePacketRate));
            }
            self.events.push(RelayEvent::RemoteFlagged {
                endpoint,
                banned: should_ban,
            });
        }
    }
}

impl<T: Transport, P: ServerPipe> Drop for OwnerRelay<T, P> {
    fn drop(&mut self) {
        self.close(DisconnectPacket::new(DisconnectReason::ServerShutdown));
        self.transport.shutdown();
    }
}

impl<T: Transport, P: ServerPipe> std::fmt::Debug for OwnerRelay<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerRelay")
            .field("active", &self.active)
            .field("remotes", &self.remotes.len())
            .field("banned", &self.banned.len())
            .field("authenticator", &self.authenticator)
            .finish()
    }
}

/// Whether a raw datagram carries a disconnect packet
fn is_disconnect(data: &[u8]) -> bool {
    PacketHeader::read(data).is_ok_and(|(header, _)| header.framing() == Framing::Disconnect)
}
