use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::CoreError;
use crate::job::{JobId, JobStatus};

/// Default bounded queue length per subscriber.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

/// Maximum number of concurrent live viewers per session.
pub const MAX_SUBSCRIBERS: usize = 64;

/// What a live viewer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Output from the session's terminal. `job` and `seq` are set when the
    /// bytes were appended to a job's output buffer.
    Output {
        job: Option<JobId>,
        seq: Option<u64>,
        data: Bytes,
    },
    JobFinished {
        job: JobId,
        status: JobStatus,
        exit_code: Option<i32>,
    },
}

struct BrokerInner {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<StreamEvent>>>,
    next_id: AtomicU64,
    queue: usize,
}

/// Fans session output out to live viewers.
///
/// Each subscriber has its own bounded queue. Publishing never waits: a
/// subscriber whose queue is full is disconnected instead of slowing the
/// writer down.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE)
    }
}

impl Broker {
    pub fn new(queue: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                queue: queue.max(1),
            }),
        }
    }

    pub fn publish(&self, event: StreamEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "stream subscriber fell behind, disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Attach a new viewer. It sees events published from now on only.
    pub fn subscribe(&self) -> Result<Subscription, CoreError> {
        let mut subscribers = self.inner.subscribers.lock();
        if subscribers.len() >= MAX_SUBSCRIBERS {
            return Err(CoreError::ResourceExhausted(format!(
                "maximum of {MAX_SUBSCRIBERS} stream subscribers reached"
            )));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue);
        subscribers.insert(id, tx);
        Ok(Subscription {
            id,
            rx,
            broker: Arc::downgrade(&self.inner),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Disconnect every subscriber. Their `recv` returns `None` once drained.
    pub fn close(&self) {
        self.inner.subscribers.lock().clear();
    }
}

/// A live viewer's end of the broker. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<StreamEvent>,
    broker: Weak<BrokerInner>,
}

impl Subscription {
    /// Wait for the next event. `None` means the subscription was closed,
    /// either because the session ended or because this viewer fell behind.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.subscribers.lock().remove(&self.id);
        }
    }
}
