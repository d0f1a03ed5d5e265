pub mod dispatcher;
pub mod events;
pub mod heartbeat;
pub mod inflate;
pub mod intents;
pub mod session;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use dispatcher::Dispatcher;
use events::GatewayPayload;
use heartbeat::{HeartbeatFailure, HeartbeatMonitor};
use inflate::FrameDecompressor;
use session::{ConnectionState, GatewaySession, ReconnectReason, SessionAction};

type WsSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Slot holding the writer of the live connection, if any.
pub type WriterSlot = Arc<RwLock<Option<Arc<GatewayWriter>>>>;

/// Close code that tells the server we intend to resume.
const RESUME_CLOSE_CODE: u16 = 4000;

/// Serialized write half of a gateway socket.
pub struct GatewayWriter {
    sink: tokio::sync::Mutex<WsSink>,
}

impl GatewayWriter {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<Message, Error = tungstenite::Error> + Send + 'static,
    {
        Self {
            sink: tokio::sync::Mutex::new(Box::pin(sink)),
        }
    }

    pub async fn send(&self, payload: &GatewayPayload) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(Some(frame))).await?;
        sink.close().await?;
        Ok(())
    }
}

/// Everything the connection loop shares with the client handle.
pub struct GatewayContext {
    pub config: Config,
    pub dispatcher: Dispatcher,
    pub writer: WriterSlot,
    pub shutdown: watch::Receiver<bool>,
}

/// How one connection ended.
#[derive(Debug)]
enum ConnectionEnd {
    Shutdown,
    Reconnect {
        resume: bool,
        reason: ReconnectReason,
        reached_ready: bool,
    },
    Fatal(GatewayError),
}

struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.25);
        base.mul_f64(1.0 + jitter).min(self.max)
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn invalid_session_delay(max: Duration) -> Duration {
    let min = max / 5;
    if max <= min {
        return max;
    }
    rand::thread_rng().gen_range(min..=max)
}

/// Resolves once shutdown is requested or the handle is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn connect(url: &str, timeout: Duration) -> Result<WsStream> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(GatewayError::Timeout(timeout)),
    }
}

/// Drive the session until shutdown or a fatal close: connect, run the
/// connection, back off, reconnect.
pub async fn run(mut session: GatewaySession, mut ctx: GatewayContext) -> Result<()> {
    let mut backoff = Backoff::new(ctx.config.reconnect_delay, ctx.config.reconnect_max_delay);
    let mut attempts: u32 = 0;

    let result = loop {
        if *ctx.shutdown.borrow() {
            break Ok(());
        }

        session.begin_connect();
        let url = ctx
            .config
            .endpoint(session.connect_base(&ctx.config.gateway_url));
        tracing::info!(url = %url, resume = session.can_resume(), "connecting to gateway");

        let connecting = connect(&url, ctx.config.connect_timeout);
        let end = tokio::select! {
            _ = wait_for_shutdown(&mut ctx.shutdown) => ConnectionEnd::Shutdown,
            connected = connecting => match connected {
                Ok(ws) => {
                    session.connected();
                    run_connection(&mut session, &mut ctx, ws).await
                }
                Err(e) => {
                    tracing::warn!("gateway connection failed: {e}");
                    let resume = session.connection_lost(ReconnectReason::ConnectFailed);
                    ConnectionEnd::Reconnect {
                        resume,
                        reason: ReconnectReason::ConnectFailed,
                        reached_ready: false,
                    }
                }
            },
        };

        let (resume, reason) = match end {
            ConnectionEnd::Shutdown => break Ok(()),
            ConnectionEnd::Fatal(e) => break Err(e),
            ConnectionEnd::Reconnect {
                resume,
                reason,
                reached_ready,
            } => {
                if reached_ready {
                    backoff.reset();
                    attempts = 0;
                }
                (resume, reason)
            }
        };

        attempts += 1;
        if let Some(max) = ctx.config.max_reconnects {
            if attempts > max {
                tracing::error!(attempts = max, "giving up on the gateway");
                break Err(GatewayError::ReconnectLimit(max));
            }
        }

        let delay = match reason {
            ReconnectReason::InvalidSession => {
                invalid_session_delay(ctx.config.invalid_session_delay)
            }
            ReconnectReason::ServerRequested if attempts == 1 => Duration::ZERO,
            _ => backoff.next_delay(),
        };
        tracing::info!(
            ?reason,
            resume,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnecting to gateway"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(&mut ctx.shutdown) => break Ok(()),
        }
    };

    session.shutdown();
    ctx.dispatcher.cancel_waiters();
    match &result {
        Ok(()) => tracing::info!("gateway client stopped"),
        Err(e) => tracing::error!("gateway client stopped: {e}"),
    }
    result
}

async fn run_connection(
    session: &mut GatewaySession,
    ctx: &mut GatewayContext,
    ws: WsStream,
) -> ConnectionEnd {
    let (sink, mut stream) = ws.split();
    let writer = Arc::new(GatewayWriter::new(sink));
    *ctx.writer.write().await = Some(writer.clone());

    let mut inflater = ctx.config.compress.then(FrameDecompressor::new);
    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
    let mut heartbeat: Option<HeartbeatMonitor> = None;
    let mut reached_ready = false;

    let end = loop {
        let frame = tokio::select! {
            _ = wait_for_shutdown(&mut ctx.shutdown) => break ConnectionEnd::Shutdown,
            Some(failure) = failure_rx.recv() => {
                let reason = match failure {
                    HeartbeatFailure::Zombied => ReconnectReason::Zombied,
                    HeartbeatFailure::WriteFailed => ReconnectReason::TransportClosed,
                };
                break lost(session, reason, reached_ready);
            }
            frame = stream.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => {
                let Some(inflater) = inflater.as_mut() else {
                    tracing::warn!("binary frame on an uncompressed connection");
                    break lost(session, ReconnectReason::DecodeFailed, reached_ready);
                };
                match inflater.push(&bytes) {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!("failed to inflate gateway frame: {e}");
                        break lost(session, ReconnectReason::DecodeFailed, reached_ready);
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match &frame {
                    Some(f) => (Some(u16::from(f.code)), f.reason.as_str()),
                    None => (None, ""),
                };
                break match session.closed_by_server(code, reason) {
                    Ok(SessionAction::Reconnect { resume, reason }) => ConnectionEnd::Reconnect {
                        resume,
                        reason,
                        reached_ready,
                    },
                    Ok(_) => lost(session, ReconnectReason::TransportClosed, reached_ready),
                    Err(e) => ConnectionEnd::Fatal(e),
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!("gateway read failed: {e}");
                break lost(session, ReconnectReason::TransportClosed, reached_ready);
            }
            None => break lost(session, ReconnectReason::TransportClosed, reached_ready),
        };

        let mut outcome = None;
        for action in session.handle_text(&text) {
            match action {
                SessionAction::Send(payload) => {
                    if let Err(e) = writer.send(&payload).await {
                        tracing::warn!(op = payload.op, "gateway write failed: {e}");
                        outcome = Some(lost(session, ReconnectReason::TransportClosed, reached_ready));
                        break;
                    }
                }
                SessionAction::StartHeartbeat(interval) => {
                    heartbeat = Some(HeartbeatMonitor::spawn(
                        interval,
                        writer.clone(),
                        session.subscribe(),
                        failure_tx.clone(),
                    ));
                }
                SessionAction::HeartbeatNow => {
                    let sent = match &heartbeat {
                        Some(monitor) => monitor.beat_now().await,
                        None => writer.send(&events::heartbeat(session.sequence())).await,
                    };
                    if let Err(e) = sent {
                        tracing::warn!("requested heartbeat failed: {e}");
                        outcome = Some(lost(session, ReconnectReason::TransportClosed, reached_ready));
                        break;
                    }
                }
                SessionAction::HeartbeatAck => {
                    if let Some(monitor) = &heartbeat {
                        session.record_latency(monitor.acknowledge());
                    }
                }
                SessionAction::Dispatch { name, data } => {
                    if session.state() == ConnectionState::Ready {
                        reached_ready = true;
                    }
                    ctx.dispatcher.dispatch(&name, data);
                }
                SessionAction::Reconnect { resume, reason } => {
                    outcome = Some(ConnectionEnd::Reconnect {
                        resume,
                        reason,
                        reached_ready,
                    });
                    break;
                }
            }
        }
        if let Some(end) = outcome {
            break end;
        }
    };

    if let Some(monitor) = heartbeat.take() {
        monitor.stop();
    }
    *ctx.writer.write().await = None;

    let close = match &end {
        ConnectionEnd::Shutdown => Some((1000, "shutting down")),
        ConnectionEnd::Reconnect { resume: true, .. } => Some((RESUME_CLOSE_CODE, "reconnecting")),
        ConnectionEnd::Reconnect { resume: false, .. } => Some((1000, "reconnecting")),
        ConnectionEnd::Fatal(_) => None,
    };
    if let Some((code, reason)) = close {
        if let Err(e) = writer.close(code, reason).await {
            tracing::debug!("closing gateway socket: {e}");
        }
    }
    end
}

fn lost(session: &mut GatewaySession, reason: ReconnectReason, reached_ready: bool) -> ConnectionEnd {
    let resume = session.connection_lost(reason);
    ConnectionEnd::Reconnect {
        resume,
        reason,
        reached_ready,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Writer whose frames land in a channel instead of a socket.
    pub(crate) fn capture_writer() -> (Arc<GatewayWriter>, mpsc::UnboundedReceiver<GatewayPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = futures_util::sink::unfold(tx, |tx, message: Message| async move {
            if let Message::Text(text) = message {
                let payload: GatewayPayload = serde_json::from_str(text.as_str())
                    .map_err(|_| tungstenite::Error::ConnectionClosed)?;
                tx.send(payload)
                    .map_err(|_| tungstenite::Error::ConnectionClosed)?;
            }
            Ok::<_, tungstenite::Error>(tx)
        });
        (Arc::new(GatewayWriter::new(sink)), rx)
    }

    #[tokio::test]
    async fn test_writer_serializes_payloads() {
        let (writer, mut rx) = capture_writer();
        writer.send(&events::heartbeat(Some(9))).await.unwrap();
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.op, events::opcode::HEARTBEAT);
        assert_eq!(payload.d, Some(serde_json::json!(9)));
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<Duration> = (0..7).map(|_| backoff.next_delay()).collect();
        for (delay, base) in delays.iter().zip([1u64, 2, 4, 8, 16, 30, 30]) {
            let base = Duration::from_secs(base);
            assert!(*delay >= base && *delay <= base.mul_f64(1.25).min(Duration::from_secs(30)));
        }
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_session_delay_range() {
        for _ in 0..50 {
            let delay = invalid_session_delay(Duration::from_secs(5));
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(5));
        }
        assert_eq!(invalid_session_delay(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_shutdown_wait_resolves_on_signal_and_drop() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_for_shutdown(&mut rx).await;
    }
}
