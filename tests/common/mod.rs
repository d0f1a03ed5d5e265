#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bhaicord::config::Config;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};

/// How the mock gateway behaves on every connection.
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub heartbeat_interval: u64,
    pub ack_heartbeats: bool,
    pub compress: bool,
    pub send_ready: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: 45_000,
            ack_heartbeats: true,
            compress: false,
            send_ready: true,
        }
    }
}

/// Something the test wants pushed down the live connection.
#[derive(Debug, Clone)]
pub enum Control {
    Frame(Value),
    Close(u16),
}

/// A frame the client sent, tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: usize,
    pub frame: Value,
}

struct MockState {
    options: MockOptions,
    url: String,
    connections: AtomicUsize,
    queries: Mutex<Vec<Option<String>>>,
    frames: mpsc::UnboundedSender<Received>,
    control: broadcast::Sender<Control>,
}

/// In-process gateway speaking just enough of the protocol to drive a client.
pub struct MockGateway {
    pub url: String,
    state: Arc<MockState>,
    frames: Mutex<mpsc::UnboundedReceiver<Received>>,
}

impl MockGateway {
    pub async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (control, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            options,
            url: url.clone(),
            connections: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
            frames: frames_tx,
            control,
        });

        let app = Router::new()
            .route("/", get(ws_upgrade))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url,
            state,
            frames: Mutex::new(frames_rx),
        }
    }

    /// Client config pointed at this gateway with fast retry timings.
    pub fn config(&self) -> Config {
        Config::new("test-token")
            .with_gateway_url(self.url.clone())
            .with_compress(self.state.options.compress)
            .with_connect_timeout(Duration::from_secs(5))
            .with_reconnect_delay(Duration::from_millis(20), Duration::from_millis(100))
            .with_invalid_session_delay(Duration::from_millis(50))
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub async fn queries(&self) -> Vec<Option<String>> {
        self.state.queries.lock().await.clone()
    }

    /// Next frame the client sent, failing the test after five seconds.
    pub async fn next_frame(&self) -> Received {
        let mut frames = self.frames.lock().await;
        tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("mock gateway stopped")
    }

    /// Skip frames until one with opcode `op` arrives.
    pub async fn next_op(&self, op: u64) -> Received {
        loop {
            let received = self.next_frame().await;
            if received.frame["op"] == op {
                return received;
            }
        }
    }

    pub fn send(&self, control: Control) {
        self.state
            .control
            .send(control)
            .expect("no live connection to send to");
    }

    pub fn dispatch(&self, name: &str, seq: u64, data: Value) {
        self.send(Control::Frame(json!({ "op": 0, "s": seq, "t": name, "d": data })));
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(state): State<Arc<MockState>>,
) -> Response {
    state.queries.lock().await.push(query);
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

struct Outgoing {
    encoder: Option<ZlibEncoder<Vec<u8>>>,
    taken: usize,
}

impl Outgoing {
    fn encode(&mut self, value: &Value) -> Message {
        let text = value.to_string();
        match self.encoder.as_mut() {
            Some(encoder) => {
                encoder.write_all(text.as_bytes()).unwrap();
                encoder.flush().unwrap();
                let bytes = encoder.get_ref()[self.taken..].to_vec();
                self.taken = encoder.get_ref().len();
                Message::Binary(bytes.into())
            }
            None => Message::Text(text.into()),
        }
    }
}

async fn serve_connection(socket: WebSocket, state: Arc<MockState>) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut sink, mut stream) = socket.split();
    let mut control = state.control.subscribe();
    let mut out = Outgoing {
        encoder: state
            .options
            .compress
            .then(|| ZlibEncoder::new(Vec::new(), Compression::default())),
        taken: 0,
    };
    let mut seq = 0u64;

    let hello = json!({ "op": 10, "d": { "heartbeat_interval": state.options.heartbeat_interval } });
    if sink.send(out.encode(&hello)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                    _ => break,
                };
                let frame: Value = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                let _ = state.frames.send(Received { connection, frame: frame.clone() });

                let reply = match frame["op"].as_u64() {
                    Some(1) if state.options.ack_heartbeats => Some(json!({ "op": 11 })),
                    Some(2) if state.options.send_ready => {
                        seq = 1;
                        Some(json!({
                            "op": 0, "s": seq, "t": "READY",
                            "d": {
                                "v": 9,
                                "user": { "id": "80351110224678912", "username": "bhai", "bot": true },
                                "guilds": [],
                                "session_id": "abc",
                                "resume_gateway_url": state.url,
                            }
                        }))
                    }
                    Some(6) => {
                        seq = frame["d"]["seq"].as_u64().unwrap_or(0) + 1;
                        Some(json!({ "op": 0, "s": seq, "t": "RESUMED", "d": null }))
                    }
                    _ => None,
                };
                if let Some(reply) = reply {
                    if sink.send(out.encode(&reply)).await.is_err() {
                        break;
                    }
                }
            }
            ctl = control.recv() => match ctl {
                Ok(Control::Frame(frame)) => {
                    if sink.send(out.encode(&frame)).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Close(code)) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "closed by test".into(),
                        })))
                        .await;
                    break;
                }
                Err(_) => {}
            },
        }
    }
}
