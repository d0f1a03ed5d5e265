use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::cache::EntityCache;
use crate::config::Config;
use crate::error::{DispatcherError, GatewayError, Result, WaitError};
use crate::gateway::dispatcher::{event_key, Dispatcher, HandlerFailure};
use crate::gateway::events::{opcode, Event, GatewayPayload};
use crate::gateway::intents;
use crate::gateway::session::{ConnectionState, GatewaySession, SessionStatus};
use crate::gateway::{self, GatewayContext, WriterSlot};
use crate::snowflake::Snowflake;

/// Handle to one gateway connection and everything hanging off it.
pub struct Client {
    config: Config,
    dispatcher: Dispatcher,
    users: Arc<EntityCache<Snowflake, Value>>,
    messages: Arc<EntityCache<Snowflake, Value>>,
    status: watch::Receiver<SessionStatus>,
    writer: WriterSlot,
    shutdown: watch::Sender<bool>,
    session: Mutex<Option<GatewaySession>>,
    runner: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Client {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let session = GatewaySession::new(config.token.clone(), config.intents)
            .with_properties(config.properties.clone())
            .with_protocol_error_threshold(config.protocol_error_threshold);
        let status = session.subscribe();
        let (shutdown, _) = watch::channel(false);

        let dispatcher = Dispatcher::new();
        let users = Arc::new(EntityCache::new(config.cache_size));
        let messages = Arc::new(EntityCache::new(config.cache_size));
        track_entities(&dispatcher, &users, &messages);

        Ok(Self {
            users,
            messages,
            dispatcher,
            status,
            writer: Arc::new(RwLock::new(None)),
            shutdown,
            session: Mutex::new(Some(session)),
            runner: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn users(&self) -> &Arc<EntityCache<Snowflake, Value>> {
        &self.users
    }

    pub fn messages(&self) -> &Arc<EntityCache<Snowflake, Value>> {
        &self.messages
    }

    /// Seed a known session before [`Client::start`] so the first handshake
    /// resumes instead of identifying.
    pub async fn restore_session(&self, session_id: &str, sequence: Option<u64>) -> Result<()> {
        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or(GatewayError::Closed)?;
        session.restore(session_id, sequence);
        Ok(())
    }

    /// Set the primary handler for an event.
    pub fn on<F, Fut>(&self, name: &str, handler: F) -> std::result::Result<(), DispatcherError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.warn_if_filtered(name);
        self.dispatcher.register(name, handler)
    }

    pub fn listen<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.warn_if_filtered(name);
        self.dispatcher.listen(name, handler);
    }

    pub fn wait_for<P>(
        &self,
        name: &str,
        predicate: P,
        timeout: Duration,
    ) -> impl Future<Output = std::result::Result<Event, WaitError>> + Send + 'static
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.warn_if_filtered(name);
        self.dispatcher.register_once(name, predicate, timeout)
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<HandlerFailure> {
        self.dispatcher.subscribe_failures()
    }

    /// Spawn the connection loop. Fails if the client was already started.
    pub async fn start(&self) -> Result<()> {
        let session = self.session.lock().await.take().ok_or(GatewayError::Closed)?;
        let ctx = GatewayContext {
            config: self.config.clone(),
            dispatcher: self.dispatcher.clone(),
            writer: self.writer.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        *self.runner.lock().await = Some(tokio::spawn(gateway::run(session, ctx)));
        Ok(())
    }

    /// Start and wait for the connection loop to finish.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.join().await
    }

    /// Wait for a started connection loop to finish.
    pub async fn join(&self) -> Result<()> {
        let runner = self.runner.lock().await.take();
        match runner {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }

    /// Stop the connection loop, close the socket and fail pending waits.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down gateway client");
        self.shutdown.send_replace(true);
        self.dispatcher.cancel_waiters();

        if let Some(mut session) = self.session.lock().await.take() {
            // Never started.
            session.shutdown();
            return Ok(());
        }

        let mut status = self.status.clone();
        let closed = status.wait_for(|s| s.state == ConnectionState::Closed).await.is_ok();
        if !closed {
            // The connection loop is gone, which is just as closed.
            tracing::debug!("gateway status channel dropped before close");
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.status.borrow().latency
    }

    pub fn session_id(&self) -> Option<String> {
        self.status.borrow().session_id.clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.status.borrow().sequence
    }

    /// Wait until the session reaches `Ready`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut status = self.status.clone();
        let ready = status.wait_for(|s| {
            matches!(s.state, ConnectionState::Ready | ConnectionState::Closed)
        });
        let state = match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(status)) => status.state,
            Ok(Err(_)) => return Err(GatewayError::Closed),
            Err(_) => return Err(GatewayError::Timeout(timeout)),
        };
        match state {
            ConnectionState::Ready => Ok(()),
            _ => Err(GatewayError::Closed),
        }
    }

    /// Send a raw frame on the live connection.
    pub async fn send(&self, op: u8, data: Value) -> Result<()> {
        let writer = self.writer.read().await.clone();
        match writer {
            Some(writer) => writer.send(&GatewayPayload::new(op, data)).await,
            None => Err(GatewayError::NotConnected),
        }
    }

    /// Update the client's presence: `status` is one of online, idle, dnd or
    /// invisible.
    pub async fn update_presence(&self, status: &str, activities: Vec<Value>, afk: bool) -> Result<()> {
        let since = afk.then(|| chrono::Utc::now().timestamp_millis());
        self.send(
            opcode::PRESENCE_UPDATE,
            serde_json::json!({
                "since": since,
                "activities": activities,
                "status": status,
                "afk": afk,
            }),
        )
        .await
    }

    fn warn_if_filtered(&self, name: &str) {
        let key = event_key(name);
        if !intents::has_intent(self.config.intents, &key) {
            tracing::warn!(
                event = %key,
                intents = self.config.intents,
                "declared intents will never deliver this event"
            );
        }
    }
}

fn id_of(value: &Value) -> Option<Snowflake> {
    serde_json::from_value(value.get("id")?.clone()).ok()
}

/// Keep the user and message caches fed from the event stream.
fn track_entities(
    dispatcher: &Dispatcher,
    users: &Arc<EntityCache<Snowflake, Value>>,
    messages: &Arc<EntityCache<Snowflake, Value>>,
) {
    for name in ["MESSAGE_CREATE", "MESSAGE_UPDATE"] {
        let users = users.clone();
        let messages = messages.clone();
        dispatcher.listen(name, move |event| {
            let users = users.clone();
            let messages = messages.clone();
            async move {
                let Some(message) = event.data() else {
                    return Ok(());
                };
                if let Some(author) = message.get("author") {
                    if let Some(id) = id_of(author) {
                        users.insert(id, author.clone()).await;
                    }
                }
                if let Some(id) = id_of(message) {
                    messages.insert(id, message.clone()).await;
                }
                Ok(())
            }
        });
    }

    let users = users.clone();
    dispatcher.listen("READY", move |event| {
        let users = users.clone();
        async move {
            if let Event::Ready(ready) = event {
                let user = serde_json::json!({
                    "id": ready.user.id,
                    "username": ready.user.username,
                    "bot": ready.user.bot,
                });
                users.insert(ready.user.id, user).await;
            }
            Ok(())
        }
    });
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = Client::new(Config::default()).err().unwrap();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = Client::new(Config::new("token")).unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.latency(), None);
        assert_eq!(client.session_id(), None);
        assert_eq!(client.users().capacity(), 1500);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = Client::new(Config::new("token")).unwrap();
        let err = client.send(opcode::HEARTBEAT, Value::Null).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
    }

    #[tokio::test]
    async fn test_restore_seeds_session() {
        let client = Client::new(Config::new("token")).unwrap();
        client.restore_session("abc", Some(12)).await.unwrap();
        assert_eq!(client.session_id().as_deref(), Some("abc"));
        assert_eq!(client.sequence(), Some(12));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_fails_waiters() {
        let client = Client::new(Config::new("token")).unwrap();
        let wait = client.wait_for("READY", |_| true, Duration::from_secs(60));
        client.shutdown().await.unwrap();
        assert_eq!(wait.await.unwrap_err(), WaitError::Cancelled);
        assert!(matches!(client.start().await, Err(GatewayError::Closed)));

        let late = client.wait_for("READY", |_| true, Duration::from_secs(60));
        let outcome = tokio::time::timeout(Duration::from_millis(500), late).await;
        assert_eq!(outcome.unwrap().unwrap_err(), WaitError::Cancelled);
    }

    #[tokio::test]
    async fn test_messages_feed_caches() {
        let client = Client::new(Config::new("token")).unwrap();
        client.dispatcher().dispatch(
            "MESSAGE_CREATE",
            serde_json::json!({
                "id": "1001",
                "content": "hi",
                "author": { "id": "42", "username": "bhai" }
            }),
        );

        tokio::time::timeout(Duration::from_secs(1), async {
            while !client.messages().contains(&Snowflake(1001)).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let author = client.users().get(&Snowflake(42)).await.unwrap();
        assert_eq!(author["username"], "bhai");
    }

    #[tokio::test]
    async fn test_duplicate_on_is_rejected() {
        let client = Client::new(Config::new("token")).unwrap();
        client.on("on_ready", |_| async { Ok(()) }).unwrap();
        assert!(client.on("READY", |_| async { Ok(()) }).is_err());
    }
}
