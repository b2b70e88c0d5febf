//! Job lifecycle event bus.
//!
//! Broadcasts job transitions to read-side consumers. Delivery is synchronous
//! to the subscribers registered at publish time; there is no replay, so
//! consumers re-derive state from the store when notified.

use super::models::{Job, JobError};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Capacity of the broadcast channel handed out by `subscribe_channel`.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Added {
        job: Job,
    },
    Processing {
        job_id: String,
        attempt: u32,
    },
    Synced {
        job_id: String,
        remote_id: String,
    },
    Failed {
        job_id: String,
        error: JobError,
        terminal: bool,
        next_retry_at: Option<i64>,
    },
    Removed {
        job_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Added,
    Processing,
    Synced,
    Failed,
    Removed,
}

impl JobEvent {
    pub fn kind(&self) -> JobEventKind {
        match self {
            JobEvent::Added { .. } => JobEventKind::Added,
            JobEvent::Processing { .. } => JobEventKind::Processing,
            JobEvent::Synced { .. } => JobEventKind::Synced,
            JobEvent::Failed { .. } => JobEventKind::Failed,
            JobEvent::Removed { .. } => JobEventKind::Removed,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Added { job } => &job.id,
            JobEvent::Processing { job_id, .. }
            | JobEvent::Synced { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Removed { job_id } => job_id,
        }
    }
}

type Callback = Arc<dyn Fn(&JobEvent) + Send + Sync>;

struct Subscriber {
    filter: Option<JobEventKind>,
    callback: Callback,
}

/// Typed publish/subscribe channel for job events.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            channel,
        })
    }

    /// Register a callback for every event.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    /// Register a callback for one kind of event.
    pub fn subscribe_kind<F>(self: &Arc<Self>, kind: JobEventKind, callback: F) -> Subscription
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(callback))
    }

    /// Receive events on a tokio broadcast channel. Slow receivers may
    /// observe `RecvError::Lagged`.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<JobEvent> {
        self.channel.subscribe()
    }

    fn register(self: &Arc<Self>, filter: Option<JobEventKind>, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, Subscriber { filter, callback });
        Subscription {
            id,
            bus: Arc::downgrade(self),
            active: true,
        }
    }

    fn remove(&self, id: u64) -> bool {
        self.subscribers.lock().unwrap().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Deliver an event to every current subscriber.
    ///
    /// The subscriber table is only locked while taking a snapshot, so
    /// callbacks may subscribe or unsubscribe freely. A panicking callback is
    /// logged and does not affect the others.
    pub fn publish(&self, event: JobEvent) {
        let kind = event.kind();
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.filter.map_or(true, |f| f == kind))
            .map(|s| s.callback.clone())
            .collect();

        debug!(
            "Publishing {:?} for job {} to {} subscribers",
            kind,
            event.job_id(),
            callbacks.len()
        );

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(
                    "Event subscriber panicked while handling {:?} for job {}",
                    kind,
                    event.job_id()
                );
            }
        }

        // No receivers is fine
        let _ = self.channel.send(event);
    }
}

/// Handle to a registered callback. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    bus: Weak<EventBus>,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the callback registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
