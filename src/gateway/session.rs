use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use super::events::{self, close_code, opcode, ConnectionProperties, GatewayPayload, HelloData};
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Identify,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHello,
    Authenticating(AuthMode),
    Ready,
    Reconnecting,
    Closed,
}

/// Why a connection is being torn down and replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    ServerRequested,
    InvalidSession,
    Zombied,
    TransportClosed,
    ConnectFailed,
    DecodeFailed,
    ProtocolErrors,
}

/// Instructions for the connection loop produced by [`GatewaySession::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Send(GatewayPayload),
    StartHeartbeat(Duration),
    HeartbeatNow,
    HeartbeatAck,
    Dispatch { name: String, data: Value },
    Reconnect { resume: bool, reason: ReconnectReason },
}

/// Observable snapshot of the session, published on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
    pub latency: Option<Duration>,
}

/// Gateway protocol state machine. Performs no I/O: frames go in, actions
/// come out, and the connection loop carries them out.
#[derive(Debug)]
pub struct GatewaySession {
    token: String,
    intents: u64,
    properties: ConnectionProperties,
    state: ConnectionState,
    session_id: Option<String>,
    sequence: Option<u64>,
    heartbeat_interval: Option<Duration>,
    latency: Option<Duration>,
    resume_gateway_url: Option<String>,
    protocol_errors: u32,
    protocol_error_threshold: u32,
    status: watch::Sender<SessionStatus>,
}

impl GatewaySession {
    pub fn new(token: impl Into<String>, intents: u64) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            token: token.into(),
            intents,
            properties: ConnectionProperties::default(),
            state: ConnectionState::Disconnected,
            session_id: None,
            sequence: None,
            heartbeat_interval: None,
            latency: None,
            resume_gateway_url: None,
            protocol_errors: 0,
            protocol_error_threshold: 5,
            status,
        }
    }

    pub fn with_properties(mut self, properties: ConnectionProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_protocol_error_threshold(mut self, threshold: u32) -> Self {
        self.protocol_error_threshold = threshold.max(1);
        self
    }

    /// Seed a previously issued session so the next handshake resumes it.
    pub fn restore(&mut self, session_id: impl Into<String>, sequence: Option<u64>) {
        self.session_id = Some(session_id.into());
        self.sequence = sequence;
        self.publish();
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn resume_gateway_url(&self) -> Option<&str> {
        self.resume_gateway_url.as_deref()
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Base URL for the next connection: the resume URL when resuming.
    pub fn connect_base<'a>(&'a self, default: &'a str) -> &'a str {
        match (&self.session_id, &self.resume_gateway_url) {
            (Some(_), Some(url)) => url,
            _ => default,
        }
    }

    pub fn begin_connect(&mut self) {
        self.heartbeat_interval = None;
        self.protocol_errors = 0;
        self.set_state(ConnectionState::Connecting);
    }

    pub fn connected(&mut self) {
        self.set_state(ConnectionState::AwaitingHello);
    }

    /// Feed one raw text frame. A frame whose envelope does not decode
    /// (unknown opcode width, malformed `s`, not JSON) is dropped and counts
    /// as a protocol error.
    pub fn handle_text(&mut self, text: &str) -> Vec<SessionAction> {
        match serde_json::from_str::<GatewayPayload>(text) {
            Ok(payload) => self.handle(payload),
            Err(e) => self.protocol_error(format!("undecodable frame: {e}")),
        }
    }

    /// Feed one decoded frame.
    pub fn handle(&mut self, payload: GatewayPayload) -> Vec<SessionAction> {
        if let Some(seq) = payload.s {
            self.observe_sequence(seq);
        }

        match payload.op {
            opcode::HELLO => self.on_hello(payload.d),
            opcode::DISPATCH => self.on_dispatch(payload.t, payload.d),
            opcode::HEARTBEAT_ACK => {
                self.protocol_errors = 0;
                vec![SessionAction::HeartbeatAck]
            }
            opcode::HEARTBEAT => {
                self.protocol_errors = 0;
                vec![SessionAction::HeartbeatNow]
            }
            opcode::RECONNECT => {
                tracing::info!("gateway requested a reconnect");
                let resume = self.can_resume();
                self.set_state(ConnectionState::Reconnecting);
                vec![SessionAction::Reconnect {
                    resume,
                    reason: ReconnectReason::ServerRequested,
                }]
            }
            opcode::INVALID_SESSION => {
                tracing::warn!(resumable = ?payload.d, "gateway invalidated the session");
                self.clear_session();
                self.set_state(ConnectionState::Reconnecting);
                vec![SessionAction::Reconnect {
                    resume: false,
                    reason: ReconnectReason::InvalidSession,
                }]
            }
            op => self.protocol_error(format!("unexpected opcode {op}")),
        }
    }

    pub fn record_latency(&mut self, latency: Option<Duration>) {
        if latency.is_some() {
            self.latency = latency;
            self.publish();
        }
    }

    /// The connection died underneath us. Returns whether to resume.
    pub fn connection_lost(&mut self, reason: ReconnectReason) -> bool {
        tracing::warn!(?reason, state = ?self.state, "gateway connection lost");
        self.set_state(ConnectionState::Reconnecting);
        self.can_resume()
    }

    /// The server closed the socket with `code`.
    pub fn closed_by_server(
        &mut self,
        code: Option<u16>,
        reason: &str,
    ) -> Result<SessionAction, GatewayError> {
        match code {
            Some(code) if close_code::is_fatal(code) => {
                tracing::error!(code, reason, "gateway closed the connection permanently");
                self.clear_session();
                self.set_state(ConnectionState::Closed);
                Err(GatewayError::FatalClose {
                    code,
                    reason: reason.to_string(),
                })
            }
            Some(code) if close_code::invalidates_session(code) => {
                tracing::warn!(code, reason, "gateway closed the connection, session expired");
                self.clear_session();
                self.set_state(ConnectionState::Reconnecting);
                Ok(SessionAction::Reconnect {
                    resume: false,
                    reason: ReconnectReason::TransportClosed,
                })
            }
            _ => {
                tracing::info!(?code, reason, "gateway closed the connection");
                let resume = self.connection_lost(ReconnectReason::TransportClosed);
                Ok(SessionAction::Reconnect {
                    resume,
                    reason: ReconnectReason::TransportClosed,
                })
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.heartbeat_interval = None;
        self.set_state(ConnectionState::Closed);
    }

    fn on_hello(&mut self, data: Option<Value>) -> Vec<SessionAction> {
        if self.heartbeat_interval.is_some() {
            return self.protocol_error("duplicate HELLO on one connection".to_string());
        }
        let hello: HelloData = match data.map(serde_json::from_value) {
            Some(Ok(hello)) => hello,
            Some(Err(e)) => return self.protocol_error(format!("malformed HELLO: {e}")),
            None => return self.protocol_error("HELLO without data".to_string()),
        };
        if hello.heartbeat_interval == 0 {
            return self.protocol_error("HELLO with zero heartbeat interval".to_string());
        }

        self.protocol_errors = 0;
        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.heartbeat_interval = Some(interval);
        tracing::debug!(interval_ms = hello.heartbeat_interval, "received HELLO");

        let handshake = match self.session_id.clone() {
            Some(session_id) => {
                tracing::info!(session_id = %session_id, sequence = ?self.sequence, "resuming session");
                self.set_state(ConnectionState::Authenticating(AuthMode::Resume));
                events::resume(&self.token, &session_id, self.sequence)
            }
            None => {
                // A fresh session numbers its events from scratch.
                self.sequence = None;
                self.set_state(ConnectionState::Authenticating(AuthMode::Identify));
                events::identify(&self.token, self.intents, &self.properties)
            }
        };

        vec![
            SessionAction::StartHeartbeat(interval),
            SessionAction::Send(handshake),
        ]
    }

    fn on_dispatch(&mut self, name: Option<String>, data: Option<Value>) -> Vec<SessionAction> {
        let Some(name) = name else {
            return self.protocol_error("DISPATCH without event name".to_string());
        };
        let data = data.unwrap_or(Value::Null);
        self.protocol_errors = 0;

        match name.as_str() {
            "READY" => {
                match data.get("session_id").and_then(Value::as_str) {
                    Some(session_id) => self.session_id = Some(session_id.to_string()),
                    None => tracing::warn!("READY without session_id, session will not resume"),
                }
                self.resume_gateway_url = data
                    .get("resume_gateway_url")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                tracing::info!(session_id = ?self.session_id, "gateway ready");
                self.set_state(ConnectionState::Ready);
            }
            "RESUMED" => {
                tracing::info!(sequence = ?self.sequence, "session resumed");
                self.set_state(ConnectionState::Ready);
            }
            _ => {}
        }

        vec![SessionAction::Dispatch { name, data }]
    }

    fn observe_sequence(&mut self, seq: u64) {
        match self.sequence {
            Some(current) if seq < current => {
                tracing::warn!(current, received = seq, "ignoring out of order sequence");
            }
            _ => {
                self.sequence = Some(seq);
                self.publish();
            }
        }
    }

    fn protocol_error(&mut self, message: String) -> Vec<SessionAction> {
        self.protocol_errors += 1;
        tracing::warn!(
            errors = self.protocol_errors,
            "dropping frame: {message}"
        );
        if self.protocol_errors < self.protocol_error_threshold {
            return Vec::new();
        }

        let resume = self.connection_lost(ReconnectReason::ProtocolErrors);
        vec![SessionAction::Reconnect {
            resume,
            reason: ReconnectReason::ProtocolErrors,
        }]
    }

    fn clear_session(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_gateway_url = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "gateway state change");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let status = SessionStatus {
            state: self.state,
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            latency: self.latency,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
