// src/poller.rs - Per-box poll task and the state it commits into
//!
//! Every box gets one [`BoxRuntime`] behind a `tokio::sync::Mutex` and one
//! spawned task running [`run_poller`]. A cycle has two phases:
//!
//! 1. the network exchange, which may be cancelled at any point and is
//!    bounded by the cycle timeout;
//! 2. the commit, which runs under the runtime lock and is never cancelled,
//!    so a stopped box never ends up with half-applied pin or alarm state.
//!
//! Cycles of one box are strictly sequential. Ticks missed while a slow
//! cycle was running are skipped rather than queued.

use crate::alarms::{AckOutcome, AlarmLifecycle};
use crate::client::BoxClient;
use crate::config::{BoxConfig, BoxId, EngineSettings, SiteId};
use crate::error::{MonitorError, Result};
use crate::events::{EngineEvent, EventPublisher};
use crate::model::{AlarmId, BoxSnapshot, BoxStatus};
use crate::pins::PinStateTracker;
use crate::protocols::AutoReport;
use crate::storage::AlarmStore;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mutable state of one box, shared between its poll task and the engine API
pub struct BoxRuntime {
    site_id: SiteId,
    config: Arc<BoxConfig>,
    endpoint: Option<SocketAddr>,
    disabled_reason: Option<String>,
    tracker: PinStateTracker,
    lifecycle: AlarmLifecycle,
    events: EventPublisher,
    status: BoxStatus,
    failure_threshold: u32,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Open alarms have been loaded from the store
    recovered: bool,
}

impl BoxRuntime {
    pub fn new(
        site_id: SiteId,
        config: BoxConfig,
        settings: &EngineSettings,
        store: Arc<dyn AlarmStore>,
        events: EventPublisher,
    ) -> Self {
        let lifecycle = AlarmLifecycle::new(
            site_id.clone(),
            config.id.clone(),
            store,
            events.clone(),
            settings.persistence_retry,
        );
        let mut runtime = Self {
            site_id,
            config: Arc::new(config),
            endpoint: None,
            disabled_reason: None,
            tracker: PinStateTracker::new(),
            lifecycle,
            events,
            status: BoxStatus::Down,
            failure_threshold: settings.failure_threshold,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            recovered: false,
        };
        runtime.validate();
        runtime
    }

    fn validate(&mut self) {
        match self.config.validate().and_then(|_| self.config.endpoint()) {
            Ok(endpoint) => {
                self.endpoint = Some(endpoint);
                self.disabled_reason = None;
            }
            Err(e) => {
                error!(box_id = %self.config.id, "Box disabled: {}", e);
                self.endpoint = None;
                self.disabled_reason = Some(e.to_string());
            }
        }
    }

    pub fn box_id(&self) -> &str {
        &self.config.id
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn config(&self) -> &Arc<BoxConfig> {
        &self.config
    }

    /// Socket address to poll, `None` while the box is disabled
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub fn status(&self) -> BoxStatus {
        self.status
    }

    pub fn tracker(&self) -> &PinStateTracker {
        &self.tracker
    }

    pub fn lifecycle(&self) -> &AlarmLifecycle {
        &self.lifecycle
    }

    pub fn snapshot(&self) -> BoxSnapshot {
        BoxSnapshot {
            box_id: self.config.id.clone(),
            site_id: self.site_id.clone(),
            endpoint: self.endpoint,
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            last_success: self.last_success,
            last_error: self.last_error.clone(),
            disabled_reason: self.disabled_reason.clone(),
            pin_levels: self.tracker.levels().clone(),
        }
    }

    /// Swap in a new configuration while the poll task is stopped.
    ///
    /// Levels of pins whose binding changed are forgotten so the next reading
    /// re-evaluates them against the new binding. Open alarms stay as they are.
    pub fn reconfigure(&mut self, site_id: SiteId, config: BoxConfig, settings: &EngineSettings) {
        let changed = config.changed_pins(&self.config);
        for pin in &changed {
            self.tracker.forget(*pin);
        }
        let input_count = config.input_count;
        let stale: Vec<u8> = self
            .tracker
            .levels()
            .keys()
            .copied()
            .filter(|pin| *pin > input_count)
            .collect();
        for pin in stale {
            self.tracker.forget(pin);
        }
        if !changed.is_empty() {
            debug!(box_id = %config.id, ?changed, "Pin bindings changed");
        }

        self.lifecycle.set_site_id(site_id.clone());
        self.lifecycle.set_retry(settings.persistence_retry);
        self.site_id = site_id;
        self.failure_threshold = settings.failure_threshold;
        self.config = Arc::new(config);
        self.validate();
    }

    /// Commit the result of one network exchange.
    pub async fn complete_cycle(&mut self, outcome: Result<AutoReport>, now: DateTime<Utc>) {
        match outcome {
            Ok(report) => {
                self.record_success(now);
                if let Err(e) = self.apply_reading(&report, now).await {
                    warn!(box_id = %self.config.id, "Reading not fully applied: {}", e);
                }
            }
            Err(e) => self.record_failure(&e, now),
        }
    }

    /// Feed a decoded report through the tracker and alarm lifecycle.
    ///
    /// Levels are committed pin by pin, only after the alarm write for that
    /// pin succeeded. The first failure is returned once every pin was tried.
    pub async fn apply_reading(&mut self, report: &AutoReport, now: DateTime<Utc>) -> Result<()> {
        if !self.recovered {
            self.lifecycle.recover().await?;
            self.recovered = true;
        }

        let config = Arc::clone(&self.config);
        let edges = self.tracker.diff(report.input_levels(config.input_count));
        let mut first_error = None;

        for edge in edges {
            match config.pin(edge.pin) {
                Some(pin) => match self.lifecycle.on_edge(pin, edge.level, now).await {
                    Ok(_) => self.tracker.commit(&edge),
                    Err(e) => {
                        error!(
                            box_id = %config.id,
                            pin = edge.pin,
                            "Edge not committed: {}",
                            e
                        );
                        first_error.get_or_insert(e);
                    }
                },
                None => {
                    debug!(box_id = %config.id, pin = edge.pin, level = edge.level, "Raw level change");
                    self.tracker.commit(&edge);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        #[cfg(feature = "metrics")]
        metrics::counter!("boxwatch_polls_total", "outcome" => "success").increment(1);

        if self.consecutive_failures > 0 {
            debug!(
                box_id = %self.config.id,
                failures = self.consecutive_failures,
                "Poll succeeded after failures"
            );
        }
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.last_error = None;
        self.set_status(BoxStatus::Up, now);
    }

    /// Count a failed cycle. Pin and alarm state are left exactly as they were.
    pub fn record_failure(&mut self, err: &MonitorError, now: DateTime<Utc>) {
        #[cfg(feature = "metrics")]
        metrics::counter!("boxwatch_polls_total", "outcome" => err.kind()).increment(1);

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(err.to_string());
        if err.is_connectivity() {
            warn!(
                box_id = %self.config.id,
                failures = self.consecutive_failures,
                kind = err.kind(),
                "Poll failed: {}",
                err
            );
        } else {
            error!(
                box_id = %self.config.id,
                failures = self.consecutive_failures,
                kind = err.kind(),
                "Poll cycle failed outside the network exchange: {}",
                err
            );
        }
        if self.consecutive_failures >= self.failure_threshold {
            self.set_status(BoxStatus::Unreachable, now);
        }
    }

    /// Report the box as not polled (stopped, removed or disabled).
    pub fn mark_down(&mut self, now: DateTime<Utc>) {
        self.set_status(BoxStatus::Down, now);
    }

    fn set_status(&mut self, status: BoxStatus, now: DateTime<Utc>) {
        if self.status == status {
            return;
        }
        match (self.status, status) {
            (_, BoxStatus::Unreachable) => error!(
                box_id = %self.config.id,
                failures = self.consecutive_failures,
                "Box unreachable"
            ),
            (BoxStatus::Unreachable, BoxStatus::Up) => {
                info!(box_id = %self.config.id, "Box reachable again")
            }
            (previous, next) => {
                info!(box_id = %self.config.id, "Box status {} -> {}", previous, next)
            }
        }
        self.status = status;
        self.events.publish(EngineEvent::BoxStatusChanged {
            box_id: self.config.id.clone(),
            site_id: Some(self.site_id.clone()),
            status,
            at: now,
        });
    }

    pub async fn acknowledge(
        &mut self,
        alarm_id: AlarmId,
        by: &str,
        now: DateTime<Utc>,
    ) -> Result<AckOutcome> {
        self.lifecycle.acknowledge(alarm_id, by, now).await
    }
}

/// Timing of one poll task
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub interval: Duration,
    /// Hard bound on the network phase of a cycle
    pub cycle_timeout: Duration,
}

impl PollSchedule {
    pub fn for_box(config: &BoxConfig, settings: &EngineSettings) -> Self {
        Self {
            interval: config.poll_interval(settings),
            cycle_timeout: settings.cycle_timeout(),
        }
    }
}

pub fn spawn_poller(
    runtime: Arc<Mutex<BoxRuntime>>,
    client: Arc<dyn BoxClient>,
    box_id: BoxId,
    addr: SocketAddr,
    schedule: PollSchedule,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_poller(runtime, client, box_id, addr, schedule, cancel))
}

/// Poll loop of one box; returns once `cancel` fires.
pub async fn run_poller(
    runtime: Arc<Mutex<BoxRuntime>>,
    client: Arc<dyn BoxClient>,
    box_id: BoxId,
    addr: SocketAddr,
    schedule: PollSchedule,
    cancel: CancellationToken,
) {
    info!(%box_id, %addr, interval = ?schedule.interval, "Poller started");
    let mut ticker = tokio::time::interval(schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = timeout(schedule.cycle_timeout, client.poll(addr)) => {
                result.unwrap_or(Err(MonitorError::ReadTimeout { addr }))
            }
        };

        runtime.lock().await.complete_cycle(outcome, Utc::now()).await;
    }

    debug!(%box_id, "Poller stopped");
}
