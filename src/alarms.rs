// File: src/alarms.rs
// Alarm lifecycle for one box
//
// Turns pin edges into created / acknowledged / resolved alarm records. Each
// box owns one `AlarmLifecycle`; it is only ever driven from behind that box's
// runtime lock, so no two transitions for the same (box, pin) interleave.

use crate::config::{BoxId, PinConfig, RetryPolicy, SiteId};
use crate::error::{MonitorError, Result};
use crate::events::{EngineEvent, EventPublisher};
use crate::model::{Alarm, AlarmId};
use crate::storage::AlarmStore;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ==========================================
// SECTION 1: ALARM DERIVATION
// ==========================================

/// True when `level` is the abnormal level of a pin wired `normally_open`.
pub fn is_alarm(level: bool, normally_open: bool) -> bool {
    level == normally_open
}

/// What an edge did to the alarm records
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeEffect {
    Created(Alarm),
    Resolved(Alarm),
    /// Alarm-level edge with an alarm already open, or idle edge with none open
    Unchanged,
}

/// Result of an acknowledgment request
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Acknowledged(Alarm),
    /// The alarm was acknowledged earlier; nothing was written
    AlreadyAcknowledged(Alarm),
}

impl AckOutcome {
    pub fn alarm(&self) -> &Alarm {
        match self {
            AckOutcome::Acknowledged(alarm) | AckOutcome::AlreadyAcknowledged(alarm) => alarm,
        }
    }

    pub fn was_already_acknowledged(&self) -> bool {
        matches!(self, AckOutcome::AlreadyAcknowledged(_))
    }
}

// ==========================================
// SECTION 2: LIFECYCLE MANAGER
// ==========================================

/// Open-alarm bookkeeping and transitions for the pins of one box
pub struct AlarmLifecycle {
    site_id: SiteId,
    box_id: BoxId,
    /// The single open alarm per pin, if any
    open: HashMap<u8, Alarm>,
    store: Arc<dyn AlarmStore>,
    events: EventPublisher,
    retry: RetryPolicy,
}

impl AlarmLifecycle {
    pub fn new(
        site_id: impl Into<SiteId>,
        box_id: impl Into<BoxId>,
        store: Arc<dyn AlarmStore>,
        events: EventPublisher,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            box_id: box_id.into(),
            open: HashMap::new(),
            store,
            events,
            retry,
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn set_site_id(&mut self, site_id: impl Into<SiteId>) {
        self.site_id = site_id.into();
    }

    pub fn set_retry(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn open_alarm(&self, pin: u8) -> Option<&Alarm> {
        self.open.get(&pin)
    }

    /// Reload this box's open alarms from the store.
    ///
    /// Called whenever the box (re)starts, so that replayed edges after a
    /// restart neither duplicate nor lose alarms.
    pub async fn recover(&mut self) -> Result<usize> {
        let mut stored: Vec<Alarm> = self
            .store
            .open_alarms()
            .await?
            .into_iter()
            .filter(|a| a.box_id == self.box_id)
            .collect();
        stored.sort_by_key(|a| a.created_at);

        self.open.clear();
        for alarm in stored {
            if let Some(older) = self.open.insert(alarm.pin, alarm) {
                warn!(
                    box_id = %self.box_id,
                    pin = older.pin,
                    alarm_id = %older.id,
                    "Found more than one open alarm for a pin, keeping the newest"
                );
            }
        }
        if !self.open.is_empty() {
            info!(box_id = %self.box_id, open = self.open.len(), "Recovered open alarms");
        }
        Ok(self.open.len())
    }

    /// Apply one edge of a configured pin.
    ///
    /// On error nothing changed in memory, the caller must not commit the
    /// level and the edge will be seen again on the next reading.
    pub async fn on_edge(
        &mut self,
        pin: &PinConfig,
        level: bool,
        now: DateTime<Utc>,
    ) -> Result<EdgeEffect> {
        if is_alarm(level, pin.normally_open) {
            if let Some(existing) = self.open.get(&pin.pin) {
                debug!(
                    box_id = %self.box_id,
                    pin = pin.pin,
                    alarm_id = %existing.id,
                    "Alarm already open"
                );
                return Ok(EdgeEffect::Unchanged);
            }

            let alarm = Alarm::raise(&self.site_id, &self.box_id, pin, now);
            persist_with_retry(self.store.as_ref(), &alarm, &self.retry).await?;
            info!(
                box_id = %self.box_id,
                pin = pin.pin,
                alarm_id = %alarm.id,
                severity = ?alarm.severity,
                "Alarm raised: {}",
                alarm.equipment
            );
            #[cfg(feature = "metrics")]
            metrics::counter!("boxwatch_alarms_created_total").increment(1);

            self.open.insert(pin.pin, alarm.clone());
            self.events.publish(EngineEvent::AlarmCreated { alarm: alarm.clone() });
            Ok(EdgeEffect::Created(alarm))
        } else {
            let Some(existing) = self.open.get(&pin.pin) else {
                return Ok(EdgeEffect::Unchanged);
            };

            let resolved = existing.resolved(now);
            persist_with_retry(self.store.as_ref(), &resolved, &self.retry).await?;
            info!(
                box_id = %self.box_id,
                pin = pin.pin,
                alarm_id = %resolved.id,
                "Alarm resolved: {}",
                resolved.equipment
            );
            #[cfg(feature = "metrics")]
            metrics::counter!("boxwatch_alarms_resolved_total").increment(1);

            self.open.remove(&pin.pin);
            self.events.publish(EngineEvent::AlarmResolved { alarm: resolved.clone() });
            Ok(EdgeEffect::Resolved(resolved))
        }
    }

    /// Acknowledge an alarm of this box by id.
    pub async fn acknowledge(
        &mut self,
        alarm_id: AlarmId,
        by: &str,
        now: DateTime<Utc>,
    ) -> Result<AckOutcome> {
        let current = match self.open.values().find(|a| a.id == alarm_id) {
            Some(alarm) => alarm.clone(),
            None => self
                .store
                .get(alarm_id)
                .await?
                .ok_or(MonitorError::AlarmNotFound(alarm_id))?,
        };

        let outcome = acknowledge_record(
            self.store.as_ref(),
            &self.events,
            &self.retry,
            &current,
            by,
            now,
        )
        .await?;

        if let Some(open) = self.open.get_mut(&current.pin) {
            if open.id == alarm_id {
                *open = outcome.alarm().clone();
            }
        }
        Ok(outcome)
    }
}

/// Acknowledge `alarm` directly against the store.
///
/// Used by [`AlarmLifecycle::acknowledge`] and for alarms of boxes that are
/// no longer configured.
pub async fn acknowledge_record(
    store: &dyn AlarmStore,
    events: &EventPublisher,
    retry: &RetryPolicy,
    alarm: &Alarm,
    by: &str,
    now: DateTime<Utc>,
) -> Result<AckOutcome> {
    if !alarm.is_open() {
        return Err(MonitorError::AlarmClosed(alarm.id));
    }
    if alarm.is_acknowledged() {
        return Ok(AckOutcome::AlreadyAcknowledged(alarm.clone()));
    }

    let acked = alarm.acknowledged(by, now);
    persist_with_retry(store, &acked, retry).await?;
    info!(
        box_id = %acked.box_id,
        pin = acked.pin,
        alarm_id = %acked.id,
        "Alarm acknowledged by {}",
        by
    );
    #[cfg(feature = "metrics")]
    metrics::counter!("boxwatch_alarms_acknowledged_total").increment(1);

    events.publish(EngineEvent::AlarmAcknowledged { alarm: acked.clone() });
    Ok(AckOutcome::Acknowledged(acked))
}

// ==========================================
// SECTION 3: PERSISTENCE RETRY
// ==========================================

/// Save `alarm`, retrying with jittered exponential backoff.
pub async fn persist_with_retry(
    store: &dyn AlarmStore,
    alarm: &Alarm,
    policy: &RetryPolicy,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        match store.save(alarm).await {
            Ok(()) => return Ok(()),
            Err(e @ MonitorError::AlarmClosed(_)) => {
                warn!(alarm_id = %alarm.id, "Alarm already resolved in the store, write dropped");
                return Err(e);
            }
            Err(e) if attempt >= policy.max_attempts => {
                error!(
                    alarm_id = %alarm.id,
                    box_id = %alarm.box_id,
                    attempts = attempt,
                    "Giving up on alarm write: {}",
                    e
                );
                return Err(MonitorError::Persistence(format!(
                    "alarm {} not stored after {} attempts: {}",
                    alarm.id, attempt, e
                )));
            }
            Err(e) => {
                let delay = with_jitter(policy.backoff(attempt));
                warn!(
                    alarm_id = %alarm.id,
                    attempt,
                    "Alarm write failed, retrying in {:?}: {}",
                    delay,
                    e
                );
                #[cfg(feature = "metrics")]
                metrics::counter!("boxwatch_persistence_retries_total").increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Up to +50% random spread so boxes failing together do not retry in lockstep
fn with_jitter(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    if millis < 2 {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0..=millis / 2);
    Duration::from_millis(millis + extra)
}

// ==========================================
// SECTION 4: TESTS
// ==========================================
