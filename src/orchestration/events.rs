//! In-process publish/subscribe for orchestrator events.
//!
//! Three kinds of subscriber:
//! - synchronous callbacks, run inline on the emitting thread;
//! - deferred callbacks, queued to a dedicated dispatcher thread;
//! - bounded channels, which drop events rather than block when full.
//!
//! Emission never waits on a deferred or channel subscriber.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use crate::core::plan::{PhaseStatus, PlanStatus};
use crate::core::task::{TaskId, TaskStatus};
use crate::state::StatusCounts;
use crate::{blog_debug, blog_error, blog_trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StatusUpdated,
    TaskChanged,
    PhaseChanged,
    ToolStarted,
    ToolCompleted,
    OrchestratorState,
}

/// Orchestrator-level conditions carried by `orchestrator_state` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Started,
    Paused,
    Resumed,
    /// A worker passed the stuck threshold and needs an operator decision.
    Stuck,
    /// State was restored from a backup at startup.
    Recovered,
    CommitFailed,
    /// A status write failed; the result is kept and written on a later tick.
    StoreUnavailable,
    Blocked,
    ShuttingDown,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    StatusUpdated {
        plan_status: PlanStatus,
        counts: StatusCounts,
    },
    TaskChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    PhaseChanged {
        phase_id: String,
        status: PhaseStatus,
    },
    ToolStarted {
        task_id: TaskId,
        pid: Option<u32>,
    },
    ToolCompleted {
        task_id: TaskId,
        success: bool,
        exit_code: Option<i32>,
        elapsed_ms: u64,
    },
    OrchestratorState {
        state: RunState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::StatusUpdated { .. } => EventType::StatusUpdated,
            EventPayload::TaskChanged { .. } => EventType::TaskChanged,
            EventPayload::PhaseChanged { .. } => EventType::PhaseChanged,
            EventPayload::ToolStarted { .. } => EventType::ToolStarted,
            EventPayload::ToolCompleted { .. } => EventType::ToolCompleted,
            EventPayload::OrchestratorState { .. } => EventType::OrchestratorState,
        }
    }

    pub fn state(state: RunState) -> Self {
        EventPayload::OrchestratorState {
            state,
            task_id: None,
            detail: None,
        }
    }
}

/// An emitted event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

/// Which events a subscriber receives. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub instance_id: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of(event_type: EventType) -> Self {
        Self {
            event_type: Some(event_type),
            instance_id: None,
        }
    }

    pub fn for_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.event_type.map_or(true, |t| t == event.event_type())
            && self
                .instance_id
                .as_deref()
                .map_or(true, |id| id == event.instance_id)
    }
}

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Clone)]
enum Sink {
    Sync(Callback),
    Deferred(Callback),
    Channel(Sender<Event>),
}

struct Subscription {
    id: u64,
    filter: EventFilter,
    sink: Sink,
}

enum Job {
    Deliver(Callback, Event),
    Barrier(Sender<()>),
}

struct Inner {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    deferred_tx: Sender<Job>,
}

/// Cloneable handle to one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus and start its dispatcher thread. The thread exits when
    /// the last clone of the bus is dropped.
    pub fn new() -> Self {
        let (deferred_tx, deferred_rx) = crossbeam_channel::unbounded::<Job>();
        let spawned = thread::Builder::new()
            .name("baton-events".to_string())
            .spawn(move || dispatch_loop(deferred_rx));
        if let Err(e) = spawned {
            blog_error!("Failed to start event dispatcher: {}", e);
        }
        Self {
            inner: Arc::new(Inner {
                subscriptions: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                deferred_tx,
            }),
        }
    }

    fn add(&self, filter: EventFilter, sink: Sink) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push(Subscription { id, filter, sink });
        SubscriptionHandle(id)
    }

    /// Run `callback` inline for every matching event.
    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(filter, Sink::Sync(Arc::new(callback)))
    }

    /// Run `callback` on the dispatcher thread for every matching event.
    pub fn subscribe_deferred<F>(&self, filter: EventFilter, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(filter, Sink::Deferred(Arc::new(callback)))
    }

    /// Receive matching events on a bounded channel. Events that find the
    /// channel full are dropped.
    pub fn subscribe_channel(
        &self,
        filter: EventFilter,
        capacity: usize,
    ) -> (SubscriptionHandle, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (self.add(filter, Sink::Channel(tx)), rx)
    }

    /// Returns `false` if the handle was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subs = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != handle.0);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Publish an event for `instance_id`.
    pub fn emit(&self, instance_id: &str, payload: EventPayload) -> Event {
        let event = Event {
            timestamp: Utc::now(),
            instance_id: instance_id.to_string(),
            payload,
        };

        // Collect sinks first so callbacks may subscribe or unsubscribe.
        let targets: Vec<(u64, Sink)> = {
            let subs = self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subs.iter()
                .filter(|s| s.filter.matches(&event))
                .map(|s| (s.id, s.sink.clone()))
                .collect()
        };

        let mut disconnected = Vec::new();
        for (id, sink) in targets {
            match sink {
                Sink::Sync(callback) => {
                    if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                        blog_error!("Event subscriber {} panicked", id);
                    }
                }
                Sink::Deferred(callback) => {
                    if self
                        .inner
                        .deferred_tx
                        .send(Job::Deliver(callback, event.clone()))
                        .is_err()
                    {
                        blog_error!("Event dispatcher is gone; dropping deferred event");
                    }
                }
                Sink::Channel(tx) => match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        blog_trace!("Event channel {} full, dropping {:?}", id, event.event_type());
                    }
                    Err(TrySendError::Disconnected(_)) => disconnected.push(SubscriptionHandle(id)),
                },
            }
        }
        for handle in disconnected {
            blog_debug!("Removing disconnected event channel {}", handle.0);
            self.unsubscribe(handle);
        }
        event
    }

    /// Wait until every deferred callback queued so far has run.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.inner.deferred_tx.send(Job::Barrier(tx)).is_err() {
            return false;
        }
        rx.recv_timeout(timeout).is_ok()
    }
}

fn dispatch_loop(rx: Receiver<Job>) {
    for job in rx {
        match job {
            Job::Deliver(callback, event) => {
                if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    blog_error!("Deferred event subscriber panicked on {:?}", event.event_type());
                }
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    blog_debug!("Event dispatcher stopped");
}

/// A bus bound to one orchestrator instance.
#[derive(Clone)]
pub struct Emitter {
    bus: EventBus,
    instance_id: String,
}

impl Emitter {
    pub fn new(bus: EventBus, instance_id: impl Into<String>) -> Self {
        Self {
            bus,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn emit(&self, payload: EventPayload) -> Event {
        self.bus.emit(&self.instance_id, payload)
    }
}
