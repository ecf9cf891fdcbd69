// src/events.rs - Real-time event stream for the dashboard layer
use crate::config::{BoxId, SiteId};
use crate::model::{Alarm, BoxStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// One state change, published after the matching store write succeeded.
///
/// Delivery is at-least-once: a subscriber that lags or reconnects should
/// re-read current state from the engine and treat repeats idempotently.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    AlarmCreated { alarm: Alarm },
    AlarmAcknowledged { alarm: Alarm },
    AlarmResolved { alarm: Alarm },
    BoxStatusChanged {
        box_id: BoxId,
        site_id: Option<SiteId>,
        status: BoxStatus,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn box_id(&self) -> &str {
        match self {
            EngineEvent::AlarmCreated { alarm }
            | EngineEvent::AlarmAcknowledged { alarm }
            | EngineEvent::AlarmResolved { alarm } => &alarm.box_id,
            EngineEvent::BoxStatusChanged { box_id, .. } => box_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::AlarmCreated { .. } => "alarm_created",
            EngineEvent::AlarmAcknowledged { .. } => "alarm_acknowledged",
            EngineEvent::AlarmResolved { .. } => "alarm_resolved",
            EngineEvent::BoxStatusChanged { .. } => "box_status_changed",
        }
    }
}

/// Fan-out of [`EngineEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish(&self, event: EngineEvent) {
        trace!(
            event = event.name(),
            box_id = event.box_id(),
            subscribers = self.subscriber_count(),
            "publishing"
        );
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            debug!(
                event = event.name(),
                box_id = event.box_id(),
                "No event subscribers"
            );
        }
    }
}
