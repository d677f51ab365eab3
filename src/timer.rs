use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Opaque handle for a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What a timer is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Upper bound on waiting for the service to end a stopped turn
    StopGrace,
    /// Backoff before the next reconnection attempt
    Reconnect,
    /// Upper bound on waiting for the service to end a reset turn
    TurnReset,
}

/// Delivered on the session queue when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub id: TimerId,
    pub kind: TimerKind,
}

/// Single timer abstraction used by the session task.
///
/// Firings are delivered as [`TimerFired`] messages so they are serialized
/// with every other input of the session.
pub trait Scheduler: Send {
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId;

    /// Cancelling an unknown or already fired timer is a no-op
    fn cancel(&mut self, id: TimerId);
}

pub struct TokioScheduler {
    next_id: u64,
    tx: mpsc::UnboundedSender<TimerFired>,
    pending: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                next_id: 0,
                tx,
                pending: HashMap::new(),
            },
            rx,
        )
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let tx = self.tx.clone();

        self.pending.retain(|_, handle| !handle.is_finished());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { id, kind });
        });
        self.pending.insert(id, handle);

        log::trace!("⏱️ Scheduled {:?} in {:?} as {:?}", kind, delay, id);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.pending.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}
