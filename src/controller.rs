//! Connection lifecycle of a single remote terminal session.
//!
//! [`SessionController`] is a synchronous state machine with no I/O of its
//! own. Each event (transport opened, frame received, transport closed, timer
//! fired, keystroke, resize, operator command) is a method call returning the
//! [`Effect`]s the caller must carry out, in order. The tokio driver in
//! [`crate::connection`] owns the real socket, surface and timers.
//!
//! Lifecycle:
//! - `open` dials the proxy; on transport open an `auth` frame is sent.
//! - `auth_success` followed by `connected` completes the handshake, resets
//!   the attempt counter and moves to `Connected`.
//! - A close before the handshake completed counts as a failed attempt.
//!   Below the cap a reconnect is scheduled after `attempts * base_delay`;
//!   at the cap the controller enters `Error` and stays there until `retry`.
//! - A close after the handshake completed, or a server `disconnected`
//!   frame, ends in `Disconnected` without retrying.
//! - `close` releases everything exactly once; later events are ignored.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::error::SessionError;
use crate::escalation::ESCALATION_THRESHOLD;
use crate::identity::{Credential, Geometry, SessionIdentity};
use crate::protocol::{self, ClientMessage, Inbound, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Handle for a timer requested through [`Effect::StartTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Reconnect,
    ResizeDebounce,
}

/// Side effect requested by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Dial a new transport to `url`.
    Connect { url: String },
    /// Send a text frame on the open transport.
    Send(String),
    /// Close (or abandon, if still dialing) the current transport.
    CloseTransport,
    StartTimer {
        id: TimerId,
        kind: TimerKind,
        after: Duration,
    },
    CancelTimer(TimerId),
    /// Write bytes to the terminal surface.
    Write(Bytes),
    /// Drop the surface keystroke/resize subscription.
    DisposeInput,
    /// Release the terminal surface.
    DisposeSurface,
    Status {
        state: ConnectionState,
        attempts: u32,
    },
    Error(SessionError),
}

/// Tunables for reconnection and resize coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub resize_debounce: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: ESCALATION_THRESHOLD,
            resize_debounce: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportPhase {
    Idle,
    Dialing,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Pending,
    Authenticated,
    Complete,
}

pub struct SessionController {
    identity: SessionIdentity,
    credential: Credential,
    settings: ControllerSettings,
    state: ConnectionState,
    attempts: u32,
    transport: TransportPhase,
    handshake: Handshake,
    /// Server sent `disconnected`; the following close must not retry.
    server_ended: bool,
    reconnect_timer: Option<TimerId>,
    resize_timer: Option<TimerId>,
    pending_geometry: Option<Geometry>,
    /// Trailing bytes of a UTF-8 sequence split across input chunks.
    input_carry: Vec<u8>,
    next_timer: u64,
    input_bound: bool,
    surface_bound: bool,
    closed: bool,
}

impl SessionController {
    pub fn new(
        identity: SessionIdentity,
        credential: Credential,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            identity,
            credential,
            settings,
            state: ConnectionState::Disconnected,
            attempts: 0,
            transport: TransportPhase::Idle,
            handshake: Handshake::Pending,
            server_ended: false,
            reconnect_timer: None,
            resize_timer: None,
            pending_geometry: None,
            input_carry: Vec::new(),
            next_timer: 1,
            input_bound: true,
            surface_bound: true,
            closed: false,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    /// Start connecting. Ignored while a transport is already live.
    pub fn open(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.closed {
            return fx;
        }
        if self.transport != TransportPhase::Idle {
            tracing::debug!(session = %self.identity.name, "open ignored, transport already live");
            return fx;
        }
        self.dial(&mut fx);
        fx
    }

    pub fn on_transport_open(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.closed || self.transport != TransportPhase::Dialing {
            return fx;
        }
        self.transport = TransportPhase::Open;
        tracing::debug!(session = %self.identity.name, "transport open, authenticating");
        self.send(
            ClientMessage::Auth {
                token: self.credential.token().to_string(),
            },
            &mut fx,
        );
        fx
    }

    /// Handle one inbound text frame.
    pub fn on_text(&mut self, text: &str) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.closed || self.transport != TransportPhase::Open {
            return fx;
        }
        match protocol::decode(text) {
            Inbound::Raw(raw) => fx.push(Effect::Write(Bytes::from(raw))),
            Inbound::Message(msg) => self.on_server_message(msg, &mut fx),
        }
        fx
    }

    /// Handle one inbound binary frame. Binary frames are not part of the
    /// protocol and are shown as-is.
    pub fn on_binary(&mut self, data: Bytes) -> Vec<Effect> {
        if self.closed || self.transport != TransportPhase::Open {
            return Vec::new();
        }
        vec![Effect::Write(data)]
    }

    fn on_server_message(&mut self, msg: ServerMessage, fx: &mut Vec<Effect>) {
        match msg {
            ServerMessage::AuthSuccess => {
                if self.handshake == Handshake::Pending {
                    self.handshake = Handshake::Authenticated;
                }
                tracing::debug!(session = %self.identity.name, "authenticated");
            }
            ServerMessage::Connected => {
                if self.handshake == Handshake::Pending {
                    tracing::debug!(session = %self.identity.name, "connected without auth_success");
                }
                self.handshake = Handshake::Complete;
                self.attempts = 0;
                tracing::info!(session = %self.identity.name, "terminal connected");
                self.set_state(ConnectionState::Connected, fx);
            }
            ServerMessage::Output { data } => {
                fx.push(Effect::Write(Bytes::from(data)));
            }
            ServerMessage::Error { message } => {
                let message = if message.is_empty() {
                    "unknown server error".to_string()
                } else {
                    message
                };
                tracing::warn!(session = %self.identity.name, %message, "server reported error");
                fx.push(Effect::Error(SessionError::Handshake(message)));
                self.set_state(ConnectionState::Error, fx);
            }
            ServerMessage::Disconnected => {
                tracing::info!(session = %self.identity.name, "server ended the session");
                self.server_ended = true;
                self.set_state(ConnectionState::Disconnected, fx);
            }
        }
    }

    /// The transport closed, or dialing failed.
    pub fn on_transport_closed(&mut self, reason: &str) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.closed || self.transport == TransportPhase::Idle {
            return fx;
        }
        self.transport = TransportPhase::Idle;

        if self.handshake == Handshake::Complete || self.server_ended {
            tracing::info!(session = %self.identity.name, %reason, "transport closed");
            if self.state != ConnectionState::Disconnected {
                self.set_state(ConnectionState::Disconnected, &mut fx);
            }
            return fx;
        }

        self.attempts += 1;
        fx.push(Effect::Error(SessionError::Transport(reason.to_string())));

        if self.attempts < self.settings.max_attempts {
            let delay = self.settings.base_delay * self.attempts;
            tracing::warn!(
                session = %self.identity.name,
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "connection failed, scheduling reconnect"
            );
            self.cancel_reconnect(&mut fx);
            let id = self.next_timer_id();
            self.reconnect_timer = Some(id);
            fx.push(Effect::StartTimer {
                id,
                kind: TimerKind::Reconnect,
                after: delay,
            });
            self.set_state(ConnectionState::Connecting, &mut fx);
        } else {
            tracing::warn!(
                session = %self.identity.name,
                attempt = self.attempts,
                %reason,
                "connection failed, giving up"
            );
            self.set_state(ConnectionState::Error, &mut fx);
        }
        fx
    }

    /// A timer started through [`Effect::StartTimer`] expired. Unknown or
    /// cancelled ids are ignored.
    pub fn on_timer(&mut self, id: TimerId) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.closed {
            return fx;
        }
        if self.reconnect_timer == Some(id) {
            self.reconnect_timer = None;
            if self.transport == TransportPhase::Idle {
                tracing::debug!(session = %self.identity.name, attempt = self.attempts, "reconnecting");
                self.dial(&mut fx);
            }
        } else if self.resize_timer == Some(id) {
            self.resize_timer = None;
            if let Some(geometry) = self.pending_geometry.take() {
                if self.is_streaming() {
                    self.send(
                        ClientMessage::Resize {
                            cols: geometry.cols,
                            rows: geometry.rows,
                        },
                        &mut fx,
                    );
                } else {
                    tracing::trace!(session = %self.identity.name, "dropping resize, not connected");
                }
            }
        }
        fx
    }

    /// Forward keystrokes. Dropped unless connected.
    pub fn send_input(&mut self, data: &[u8]) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.closed || data.is_empty() {
            return fx;
        }
        if !self.is_streaming() {
            tracing::trace!(session = %self.identity.name, len = data.len(), "dropping input, not connected");
            self.input_carry.clear();
            return fx;
        }
        let text = self.decode_input(data);
        if !text.is_empty() {
            self.send(ClientMessage::Input { data: text }, &mut fx);
        }
        fx
    }

    /// Decode keystrokes as UTF-8, holding back an incomplete trailing
    /// sequence until the next chunk completes it. Invalid bytes become
    /// U+FFFD.
    fn decode_input(&mut self, data: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.input_carry);
        buf.extend_from_slice(data);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.input_carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Request a geometry change. Requests are coalesced over the debounce
    /// window and only the last one is sent.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.closed {
            return fx;
        }
        self.pending_geometry = Some(Geometry { cols, rows });
        if let Some(old) = self.resize_timer.take() {
            fx.push(Effect::CancelTimer(old));
        }
        let id = self.next_timer_id();
        self.resize_timer = Some(id);
        fx.push(Effect::StartTimer {
            id,
            kind: TimerKind::ResizeDebounce,
            after: self.settings.resize_debounce,
        });
        fx
    }

    /// Manual reconnect: cancel any scheduled reconnect, reset the attempt
    /// counter and dial once.
    pub fn retry(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.closed {
            return fx;
        }
        tracing::info!(session = %self.identity.name, "manual retry");
        self.cancel_reconnect(&mut fx);
        self.attempts = 0;
        self.input_carry.clear();
        if self.transport != TransportPhase::Idle {
            fx.push(Effect::CloseTransport);
            self.transport = TransportPhase::Idle;
        }
        self.dial(&mut fx);
        fx
    }

    /// Tear everything down. Idempotent.
    pub fn close(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.closed {
            return fx;
        }
        self.closed = true;

        self.cancel_reconnect(&mut fx);
        if let Some(id) = self.resize_timer.take() {
            fx.push(Effect::CancelTimer(id));
        }
        self.pending_geometry = None;
        self.input_carry.clear();

        if self.input_bound {
            self.input_bound = false;
            fx.push(Effect::DisposeInput);
        }
        if self.transport != TransportPhase::Idle {
            self.transport = TransportPhase::Idle;
            fx.push(Effect::CloseTransport);
        }
        if self.surface_bound {
            self.surface_bound = false;
            fx.push(Effect::DisposeSurface);
        }

        self.state = ConnectionState::Disconnected;
        tracing::debug!(session = %self.identity.name, "controller closed");
        fx
    }

    fn dial(&mut self, fx: &mut Vec<Effect>) {
        if self.credential.is_empty() {
            self.fail_configuration(
                SessionError::Configuration("bearer token is not set".to_string()),
                fx,
            );
            return;
        }
        let url = match self.identity.endpoint_url() {
            Ok(url) => url,
            Err(e) => {
                self.fail_configuration(e, fx);
                return;
            }
        };

        self.handshake = Handshake::Pending;
        self.server_ended = false;
        self.transport = TransportPhase::Dialing;
        self.set_state(ConnectionState::Connecting, fx);
        fx.push(Effect::Connect { url });
    }

    fn fail_configuration(&mut self, err: SessionError, fx: &mut Vec<Effect>) {
        tracing::error!(session = %self.identity.name, error = %err, "cannot connect");
        fx.push(Effect::Error(err));
        self.set_state(ConnectionState::Error, fx);
    }

    fn is_streaming(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport == TransportPhase::Open
    }

    fn send(&self, msg: ClientMessage, fx: &mut Vec<Effect>) {
        match msg.encode() {
            Ok(text) => fx.push(Effect::Send(text)),
            Err(e) => tracing::error!(session = %self.identity.name, error = %e, "failed to encode frame"),
        }
    }

    fn cancel_reconnect(&mut self, fx: &mut Vec<Effect>) {
        if let Some(id) = self.reconnect_timer.take() {
            fx.push(Effect::CancelTimer(id));
        }
    }

    fn next_timer_id(&mut self) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        id
    }

    fn set_state(&mut self, state: ConnectionState, fx: &mut Vec<Effect>) {
        if self.state != state {
            tracing::debug!(session = %self.identity.name, from = ?self.state, to = ?state, "state change");
        }
        self.state = state;
        fx.push(Effect::Status {
            state,
            attempts: self.attempts,
        });
    }
}
