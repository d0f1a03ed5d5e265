use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;

use super::events::Event;
use crate::error::{DispatcherError, WaitError};

pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type Predicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;
type HandlerOutcome = (HandlerKind, std::thread::Result<anyhow::Result<()>>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Primary,
    Listener(usize),
}

/// A handler that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub event: String,
    pub handler: HandlerKind,
    pub error: String,
}

#[derive(Default)]
struct Registration {
    primary: Option<Handler>,
    listeners: Vec<Handler>,
}

struct Waiter {
    id: u64,
    predicate: Predicate,
    tx: oneshot::Sender<Event>,
}

/// Routes dispatch events to handlers and one-shot waiters.
///
/// Handlers run on their own tasks; the caller of [`Dispatcher::dispatch`]
/// never waits for them and never sees their failures. Failures are logged
/// and published on [`Dispatcher::subscribe_failures`].
#[derive(Clone)]
pub struct Dispatcher {
    registrations: Arc<DashMap<String, Registration>>,
    waiters: Arc<DashMap<String, Vec<Waiter>>>,
    next_waiter: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    failures: broadcast::Sender<HandlerFailure>,
}

/// Canonical key for an event name: `on_message_create` and
/// `MESSAGE_CREATE` address the same event.
pub fn event_key(name: &str) -> String {
    let name = name.trim();
    let bare = match name.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("on_") => &name[3..],
        _ => name,
    };
    bare.to_ascii_uppercase()
}

fn boxed<F, Fut>(handler: F) -> Handler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| handler(event).boxed())
}

impl Dispatcher {
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(1024);
        Self {
            registrations: Arc::new(DashMap::new()),
            waiters: Arc::new(DashMap::new()),
            next_waiter: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
            failures,
        }
    }

    /// Set the primary handler for an event. At most one per event.
    pub fn register<F, Fut>(&self, name: &str, handler: F) -> Result<(), DispatcherError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = event_key(name);
        let mut registration = self.registrations.entry(key.clone()).or_default();
        if registration.primary.is_some() {
            return Err(DispatcherError::DuplicateHandler(key));
        }
        registration.primary = Some(boxed(handler));
        Ok(())
    }

    /// Add a listener. Listeners run alongside the primary handler.
    pub fn listen<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registrations
            .entry(event_key(name))
            .or_default()
            .listeners
            .push(boxed(handler));
    }

    /// Drop the primary handler and all listeners for an event.
    pub fn unregister(&self, name: &str) -> bool {
        self.registrations.remove(&event_key(name)).is_some()
    }

    pub fn has_handlers(&self, name: &str) -> bool {
        self.registrations
            .get(&event_key(name))
            .is_some_and(|r| r.primary.is_some() || !r.listeners.is_empty())
    }

    /// Wait for the next event named `name` accepted by `predicate`.
    ///
    /// The waiter is registered before this returns, so an event dispatched
    /// between the call and the first poll is not missed. Dropping the
    /// future withdraws the waiter. Once waiters have been cancelled, new
    /// waits fail immediately with [`WaitError::Cancelled`].
    pub fn register_once<P>(
        &self,
        name: &str,
        predicate: P,
        timeout: Duration,
    ) -> impl Future<Output = Result<Event, WaitError>> + Send + 'static
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut guard = None;
        if !self.is_closed() {
            let key = event_key(name);
            let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            self.waiters.entry(key.clone()).or_default().push(Waiter {
                id,
                predicate: Box::new(predicate),
                tx,
            });
            guard = Some(WaiterGuard {
                waiters: self.waiters.clone(),
                key,
                id,
            });
            // Lost the race with cancel_waiters.
            if self.is_closed() {
                guard = None;
            }
        }

        async move {
            let Some(_guard) = guard else {
                return Err(WaitError::Cancelled);
            };
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(_)) => Err(WaitError::Cancelled),
                Err(_) => Err(WaitError::Timeout(timeout)),
            }
        }
    }

    pub fn wait_for(
        &self,
        name: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Event, WaitError>> + Send + 'static {
        self.register_once(name, |_| true, timeout)
    }

    pub fn pending_waiters(&self) -> usize {
        self.waiters.iter().map(|w| w.len()).sum()
    }

    /// Fail every outstanding waiter, and every later one, with
    /// [`WaitError::Cancelled`].
    pub fn cancel_waiters(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let cancelled = self.pending_waiters();
        self.waiters.clear();
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled pending event waiters");
        }
        cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<HandlerFailure> {
        self.failures.subscribe()
    }

    /// Decode a raw dispatch and route it. Returns the number of handlers
    /// started. Undecodable payloads are logged and dropped.
    pub fn dispatch(&self, name: &str, data: Value) -> usize {
        match Event::from_dispatch(name, data) {
            Ok(event) => self.dispatch_event(event),
            Err(e) => {
                tracing::warn!(event = name, "dropping undecodable event: {e}");
                0
            }
        }
    }

    pub fn dispatch_event(&self, event: Event) -> usize {
        let key = event_key(event.name());
        self.resolve_waiters(&key, &event);

        let handlers: Vec<(HandlerKind, Handler)> = match self.registrations.get(&key) {
            Some(registration) => registration
                .primary
                .iter()
                .map(|h| (HandlerKind::Primary, h.clone()))
                .chain(
                    registration
                        .listeners
                        .iter()
                        .enumerate()
                        .map(|(i, h)| (HandlerKind::Listener(i), h.clone())),
                )
                .collect(),
            None => return 0,
        };
        if handlers.is_empty() {
            return 0;
        }

        let started = handlers.len();
        let mut group = JoinSet::new();
        for (kind, handler) in handlers {
            let event = event.clone();
            group.spawn(async move {
                let outcome = AssertUnwindSafe(async move { handler(event).await })
                    .catch_unwind()
                    .await;
                (kind, outcome)
            });
        }
        tokio::spawn(supervise(key, group, self.failures.clone()));
        started
    }

    fn resolve_waiters(&self, key: &str, event: &Event) {
        // Predicates are user code and may call back into the dispatcher, so
        // none of them runs while a shard lock is held.
        let Some((_, pending)) = self.waiters.remove(key) else {
            return;
        };

        let mut remaining = Vec::with_capacity(pending.len());
        for waiter in pending {
            if waiter.tx.is_closed() {
                continue;
            }
            match std::panic::catch_unwind(AssertUnwindSafe(|| (waiter.predicate)(event))) {
                Ok(true) => {
                    let _ = waiter.tx.send(event.clone());
                }
                Ok(false) => remaining.push(waiter),
                Err(panic) => {
                    tracing::error!(
                        event = key,
                        "wait predicate panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        // Waits dropped while their predicate was running.
        remaining.retain(|w| !w.tx.is_closed());
        if remaining.is_empty() {
            return;
        }
        {
            let mut waiters = self.waiters.entry(key.to_string()).or_default();
            let added = std::mem::replace(&mut *waiters, remaining);
            waiters.extend(added);
        }
        if self.is_closed() {
            self.waiters.remove(key);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

struct WaiterGuard {
    waiters: Arc<DashMap<String, Vec<Waiter>>>,
    key: String,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if let Some(mut waiters) = self.waiters.get_mut(&self.key) {
            waiters.retain(|w| w.id != self.id);
        }
        self.waiters.remove_if(&self.key, |_, w| w.is_empty());
    }
}

async fn supervise(
    event: String,
    mut group: JoinSet<HandlerOutcome>,
    failures: broadcast::Sender<HandlerFailure>,
) {
    while let Some(joined) = group.join_next().await {
        let (handler, error) = match joined {
            Ok((_, Ok(Ok(())))) => continue,
            Ok((kind, Ok(Err(e)))) => (kind, format!("{e:#}")),
            Ok((kind, Err(panic))) => (
                kind,
                format!("handler panicked: {}", panic_message(panic.as_ref())),
            ),
            Err(e) => {
                tracing::error!(event = %event, "handler task failed: {e}");
                continue;
            }
        };
        tracing::error!(event = %event, ?handler, "event handler failed: {error}");
        let _ = failures.send(HandlerFailure {
            event: event.clone(),
            handler,
            error,
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
