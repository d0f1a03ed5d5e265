use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::events;
use super::session::SessionStatus;
use super::GatewayWriter;
use crate::error::Result;

const NEVER: u64 = u64::MAX;

/// Why the monitor gave up on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatFailure {
    /// A beat went out while the previous one was still unacknowledged.
    Zombied,
    WriteFailed,
}

/// Send/ack bookkeeping shared between the monitor task and the read loop.
#[derive(Debug)]
struct Pulse {
    origin: Instant,
    ack_pending: AtomicBool,
    last_sent: AtomicU64,
    rescheduled: Notify,
}

impl Pulse {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            ack_pending: AtomicBool::new(false),
            last_sent: AtomicU64::new(NEVER),
            rescheduled: Notify::new(),
        }
    }

    fn mark_sent(&self) {
        let nanos = self.origin.elapsed().as_nanos().min(u128::from(NEVER - 1)) as u64;
        self.last_sent.store(nanos, Ordering::SeqCst);
        self.ack_pending.store(true, Ordering::SeqCst);
    }

    fn last_sent(&self) -> Option<Instant> {
        match self.last_sent.load(Ordering::SeqCst) {
            NEVER => None,
            nanos => Some(self.origin + Duration::from_nanos(nanos)),
        }
    }
}

/// Keeps one connection alive: beats every `interval`, tracks acks and
/// reports a zombied connection. Lives and dies with its socket.
pub struct HeartbeatMonitor {
    interval: Duration,
    pulse: Arc<Pulse>,
    writer: Arc<GatewayWriter>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Start beating. The first beat is delayed by a random fraction of the
    /// interval so reconnecting clients do not beat in lockstep.
    pub fn spawn(
        interval: Duration,
        writer: Arc<GatewayWriter>,
        status: watch::Receiver<SessionStatus>,
        failures: mpsc::UnboundedSender<HeartbeatFailure>,
    ) -> Self {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Self::spawn_with_delay(interval, interval.mul_f64(jitter), writer, status, failures)
    }

    pub fn spawn_with_delay(
        interval: Duration,
        first_beat: Duration,
        writer: Arc<GatewayWriter>,
        status: watch::Receiver<SessionStatus>,
        failures: mpsc::UnboundedSender<HeartbeatFailure>,
    ) -> Self {
        let pulse = Arc::new(Pulse::new());
        let task = tokio::spawn(beat_loop(
            interval,
            first_beat,
            pulse.clone(),
            writer.clone(),
            status.clone(),
            failures,
        ));
        tracing::debug!(
            interval_ms = interval.as_millis() as u64,
            first_beat_ms = first_beat.as_millis() as u64,
            "heartbeat started"
        );
        Self {
            interval,
            pulse,
            writer,
            status,
            task,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_ack_pending(&self) -> bool {
        self.pulse.ack_pending.load(Ordering::SeqCst)
    }

    /// Record a HEARTBEAT_ACK. Returns the round trip of the beat it answers,
    /// or `None` for an ack nobody asked for.
    pub fn acknowledge(&self) -> Option<Duration> {
        if !self.pulse.ack_pending.swap(false, Ordering::SeqCst) {
            tracing::debug!("unsolicited heartbeat ack");
            return None;
        }
        self.pulse.last_sent().map(|sent| sent.elapsed())
    }

    /// Beat immediately, outside the schedule. Used when the server asks.
    /// The next scheduled beat moves to a full interval after this one.
    pub async fn beat_now(&self) -> Result<()> {
        let sequence = self.status.borrow().sequence;
        send_beat(&self.pulse, &self.writer, sequence).await?;
        self.pulse.rescheduled.notify_one();
        Ok(())
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn beat_loop(
    interval: Duration,
    first_beat: Duration,
    pulse: Arc<Pulse>,
    writer: Arc<GatewayWriter>,
    status: watch::Receiver<SessionStatus>,
    failures: mpsc::UnboundedSender<HeartbeatFailure>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + first_beat, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = pulse.rescheduled.notified() => {
                ticker.reset();
                continue;
            }
        }

        if pulse.ack_pending.load(Ordering::SeqCst) {
            tracing::warn!("heartbeat not acknowledged in time, connection is zombied");
            let _ = failures.send(HeartbeatFailure::Zombied);
            return;
        }

        let sequence = status.borrow().sequence;
        if let Err(e) = send_beat(&pulse, &writer, sequence).await {
            tracing::warn!("failed to send heartbeat: {e}");
            let _ = failures.send(HeartbeatFailure::WriteFailed);
            return;
        }
    }
}

async fn send_beat(pulse: &Pulse, writer: &GatewayWriter, sequence: Option<u64>) -> Result<()> {
    // Mark before writing so a fast ack is never mistaken for unsolicited.
    pulse.mark_sent();
    writer.send(&events::heartbeat(sequence)).await?;
    tracing::trace!(?sequence, "heartbeat sent");
    Ok(())
}
