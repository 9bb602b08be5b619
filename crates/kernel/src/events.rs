//! In-process publish/subscribe for state notifications.
//!
//! Delivery is synchronous and in registration order. A handler that returns
//! an error or panics is logged and skipped; it never aborts delivery to the
//! remaining handlers or the operation that raised the event.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};
use worldstate_common::{ActiveEffect, RegionId, SnapshotId, StateValue, WorldStateChange};

/// Kinds of events a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChanged,
    SnapshotCreated,
    StateRolledBack,
    EffectExpired,
    TickProcessed,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        Self::StateChanged,
        Self::SnapshotCreated,
        Self::StateRolledBack,
        Self::EffectExpired,
        Self::TickProcessed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateChanged => "state_changed",
            Self::SnapshotCreated => "snapshot_created",
            Self::StateRolledBack => "state_rolled_back",
            Self::EffectExpired => "effect_expired",
            Self::TickProcessed => "tick_processed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification raised after a committed state operation.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    StateChanged {
        key: String,
        old_value: StateValue,
        new_value: StateValue,
        region: RegionId,
        change: WorldStateChange,
    },
    SnapshotCreated {
        snapshot_id: SnapshotId,
        region: RegionId,
        timestamp: DateTime<Utc>,
        kind: Option<String>,
    },
    StateRolledBack {
        region: RegionId,
        snapshot_id: SnapshotId,
        timestamp: DateTime<Utc>,
    },
    EffectExpired {
        effect: ActiveEffect,
    },
    TickProcessed {
        timestamp: DateTime<Utc>,
        expired_effects: usize,
    },
}

impl WorldEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::SnapshotCreated { .. } => EventKind::SnapshotCreated,
            Self::StateRolledBack { .. } => EventKind::StateRolledBack,
            Self::EffectExpired { .. } => EventKind::EffectExpired,
            Self::TickProcessed { .. } => EventKind::TickProcessed,
        }
    }

    pub(crate) fn state_changed(change: &WorldStateChange) -> Self {
        Self::StateChanged {
            key: change.state_key.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            region: change.region.clone(),
            change: change.clone(),
        }
    }
}

/// Error a handler may return to report a failed delivery.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&WorldEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous event dispatcher keyed by [`EventKind`].
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers: usize = self.handlers.read().values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("subscribers", &subscribers)
            .field("delivered", &self.delivered.load(Ordering::Relaxed))
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. The same function may be registered
    /// more than once; it is then invoked once per registration.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&WorldEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler registered for its kind and return
    /// how many completed successfully.
    ///
    /// The registry lock is released before any handler runs, so handlers may
    /// subscribe or unsubscribe without deadlocking.
    pub fn trigger(&self, event: &WorldEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler> = match self.handlers.read().get(&kind) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };

        let mut ok = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(err)) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(event = %kind, error = %err, "event handler failed");
                }
                Err(payload) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event = %kind,
                        panic = panic_message(&*payload),
                        "event handler panicked"
                    );
                }
            }
        }
        self.delivered.fetch_add(ok as u64, Ordering::Relaxed);
        trace!(event = %kind, delivered = ok, "event dispatched");
        ok
    }

    /// Total successful deliveries since creation.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Total failed or panicked deliveries since creation.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
