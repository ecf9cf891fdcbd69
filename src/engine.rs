// src/engine.rs - Box registry, lifecycle and upstream API
//!
//! [`Engine`] owns one entry per configured box: its [`BoxRuntime`], the
//! cancellation token of its poll task and the task handle. Boxes never share
//! a lock with each other; the only engine-wide lock is the administrative
//! barrier that serializes topology writes (`upsert_*`, `remove_*`,
//! `apply_config`, `start`, `stop`).
//!
//! A topology change for one box stops that box's poller, waits for its
//! in-flight cycle to drain, swaps the configuration and respawns it. Other
//! boxes keep polling throughout.

use crate::alarms::{acknowledge_record, AckOutcome};
use crate::client::{BoxClient, TcpBoxClient};
use crate::config::{BoxConfig, BoxId, Config, EngineSettings, SiteConfig, SiteId};
use crate::error::{MonitorError, Result};
use crate::events::{EngineEvent, EventPublisher};
use crate::model::{Alarm, AlarmId, BoxSnapshot};
use crate::poller::{spawn_poller, BoxRuntime, PollSchedule};
use crate::storage::{AlarmQuery, AlarmStore};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use metrics::gauge;

/// Cheap to clone handle on the running engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    settings: EngineSettings,
    client: Arc<dyn BoxClient>,
    store: Arc<dyn AlarmStore>,
    events: EventPublisher,
    sites: RwLock<BTreeMap<SiteId, SiteConfig>>,
    boxes: DashMap<BoxId, BoxHandle>,
    /// Reconfiguration barrier
    admin: Mutex<()>,
    running: AtomicBool,
}

struct BoxHandle {
    site_id: SiteId,
    runtime: Arc<Mutex<BoxRuntime>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// What an `apply_config` call changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub boxes_added: Vec<BoxId>,
    pub boxes_updated: Vec<BoxId>,
    pub boxes_removed: Vec<BoxId>,
    pub sites_removed: Vec<SiteId>,
    pub unchanged: usize,
}

enum BoxChange {
    Added,
    Updated,
    Unchanged,
}

impl Engine {
    /// Engine talking TCP to the boxes, with timeouts from `config.engine`.
    pub fn new(config: Config, store: Arc<dyn AlarmStore>) -> Result<Self> {
        let client = Arc::new(TcpBoxClient::new(
            config.engine.connect_timeout(),
            config.engine.read_timeout(),
        ));
        Self::with_client(config, store, client)
    }

    /// Engine with a caller supplied transport.
    pub fn with_client(
        config: Config,
        store: Arc<dyn AlarmStore>,
        client: Arc<dyn BoxClient>,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventPublisher::new(config.engine.event_capacity);
        let engine = Self {
            inner: Arc::new(Inner {
                settings: config.engine.clone(),
                client,
                store,
                events,
                sites: RwLock::new(BTreeMap::new()),
                boxes: DashMap::new(),
                admin: Mutex::new(()),
                running: AtomicBool::new(false),
            }),
        };

        for site in config.sites {
            for bx in &site.boxes {
                engine.register_box(&site.id, bx.clone());
            }
            engine.inner.sites.write().insert(site.id.clone(), site);
        }
        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn AlarmStore> {
        &self.inner.store
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Spawn a poller for every enabled box.
    pub async fn start(&self) {
        let _barrier = self.inner.admin.lock().await;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Engine already running");
            return;
        }

        for box_id in self.box_ids() {
            self.spawn_box(&box_id).await;
        }
        info!(
            sites = self.inner.sites.read().len(),
            boxes = self.inner.boxes.len(),
            "Engine started"
        );
        self.update_gauges();
    }

    /// Cancel every poller and wait for in-flight cycles to drain.
    pub async fn stop(&self) {
        let _barrier = self.inner.admin.lock().await;
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Cancel everything first so boxes wind down in parallel
        let detached: Vec<_> = self
            .box_ids()
            .into_iter()
            .filter_map(|id| self.detach(&id).map(|(runtime, task)| (id, runtime, task)))
            .collect();

        for (box_id, runtime, task) in detached {
            join_poller(&box_id, task).await;
            runtime.lock().await.mark_down(Utc::now());
        }
        info!("Engine stopped");
    }

    // ========================================================================
    // READ API
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Current topology, boxes included
    pub fn sites(&self) -> Vec<SiteConfig> {
        self.inner.sites.read().values().cloned().collect()
    }

    pub fn site(&self, site_id: &str) -> Option<SiteConfig> {
        self.inner.sites.read().get(site_id).cloned()
    }

    /// Snapshot of every box, ordered by box id
    pub async fn boxes(&self) -> Vec<BoxSnapshot> {
        let mut runtimes: Vec<(BoxId, Arc<Mutex<BoxRuntime>>)> = self
            .inner
            .boxes
            .iter()
            .map(|entry| (entry.key().clone(), entry.runtime.clone()))
            .collect();
        runtimes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut snapshots = Vec::with_capacity(runtimes.len());
        for (_, runtime) in runtimes {
            snapshots.push(runtime.lock().await.snapshot());
        }
        snapshots
    }

    pub async fn box_snapshot(&self, box_id: &str) -> Result<BoxSnapshot> {
        let runtime = self.runtime(box_id)?;
        let snapshot = runtime.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Last committed level per pin, raw pins included
    pub async fn pin_levels(&self, box_id: &str) -> Result<BTreeMap<u8, bool>> {
        let runtime = self.runtime(box_id)?;
        let levels = runtime.lock().await.tracker().levels().clone();
        Ok(levels)
    }

    pub async fn alarm(&self, alarm_id: AlarmId) -> Result<Alarm> {
        self.inner
            .store
            .get(alarm_id)
            .await?
            .ok_or(MonitorError::AlarmNotFound(alarm_id))
    }

    pub async fn open_alarms(&self) -> Result<Vec<Alarm>> {
        self.alarms(&AlarmQuery {
            open_only: true,
            ..AlarmQuery::default()
        })
        .await
    }

    pub async fn alarms(&self, query: &AlarmQuery) -> Result<Vec<Alarm>> {
        self.inner.store.list(query).await
    }

    // ========================================================================
    // WRITE API
    // ========================================================================

    /// Acknowledge an open alarm on behalf of `by`.
    ///
    /// Goes through the owning box's runtime so it never interleaves with a
    /// resolution of the same alarm. An alarm whose box is not configured is
    /// acknowledged under the administrative barrier, so the box cannot come
    /// back and resolve it mid-write. A store failure after all retries is
    /// returned as [`MonitorError::Persistence`].
    pub async fn acknowledge(&self, alarm_id: AlarmId, by: &str) -> Result<AckOutcome> {
        if by.trim().is_empty() {
            return Err(MonitorError::Config("acknowledging identity is empty".into()));
        }

        let alarm = self.alarm(alarm_id).await?;
        if !alarm.is_open() {
            return Err(MonitorError::AlarmClosed(alarm_id));
        }

        match self.runtime(&alarm.box_id) {
            Ok(runtime) => runtime.lock().await.acknowledge(alarm_id, by, Utc::now()).await,
            Err(_) => self.acknowledge_detached(alarm_id, by).await,
        }
    }

    /// Create or replace a site and its boxes.
    ///
    /// Boxes missing from `site.boxes` are removed, changed ones restarted,
    /// identical ones left running.
    pub async fn upsert_site(&self, site: SiteConfig) -> Result<()> {
        validate_site(&site)?;
        let _barrier = self.inner.admin.lock().await;
        let mut report = ReloadReport::default();
        self.put_site(site, &mut report).await;
        self.update_gauges();
        Ok(())
    }

    /// Remove a site and stop all of its boxes
    pub async fn remove_site(&self, site_id: &str) -> Result<()> {
        let _barrier = self.inner.admin.lock().await;
        let box_ids: Vec<BoxId> = match self.inner.sites.read().get(site_id) {
            Some(site) => site.boxes.iter().map(|b| b.id.clone()).collect(),
            None => return Err(MonitorError::SiteNotFound(site_id.to_string())),
        };
        for box_id in box_ids {
            self.drop_box(&box_id).await;
        }
        self.inner.sites.write().remove(site_id);
        info!(site_id, "Site removed");
        self.update_gauges();
        Ok(())
    }

    /// Add a box to `site_id`, or update it in place.
    ///
    /// A box already registered under another site moves to `site_id`. An
    /// invalid box is registered but disabled; see
    /// [`BoxSnapshot::disabled_reason`].
    pub async fn upsert_box(&self, site_id: &str, config: BoxConfig) -> Result<BoxSnapshot> {
        if config.id.trim().is_empty() {
            return Err(MonitorError::Config("box with empty id".into()));
        }
        let _barrier = self.inner.admin.lock().await;
        if !self.inner.sites.read().contains_key(site_id) {
            return Err(MonitorError::SiteNotFound(site_id.to_string()));
        }
        let box_id = config.id.clone();
        self.put_box(site_id, config).await;
        self.update_gauges();
        self.box_snapshot(&box_id).await
    }

    pub async fn remove_box(&self, box_id: &str) -> Result<()> {
        let _barrier = self.inner.admin.lock().await;
        if !self.drop_box(box_id).await {
            return Err(MonitorError::BoxNotFound(box_id.to_string()));
        }
        self.update_gauges();
        Ok(())
    }

    /// Bring the topology in line with `config`, touching only what changed.
    ///
    /// Engine settings are fixed for the lifetime of the engine; a different
    /// `engine:` section is logged and otherwise ignored.
    pub async fn apply_config(&self, config: Config) -> Result<ReloadReport> {
        config.validate()?;
        let _barrier = self.inner.admin.lock().await;
        if config.engine != self.inner.settings {
            warn!("Engine settings changed; they take effect after a restart");
        }

        let mut report = ReloadReport::default();
        let wanted_boxes: HashSet<&str> = config.boxes().map(|(_, b)| b.id.as_str()).collect();
        let wanted_sites: HashSet<&str> = config.sites.iter().map(|s| s.id.as_str()).collect();

        for box_id in self.box_ids() {
            if !wanted_boxes.contains(box_id.as_str()) {
                self.drop_box(&box_id).await;
                report.boxes_removed.push(box_id);
            }
        }

        let stale_sites: Vec<SiteId> = self
            .inner
            .sites
            .read()
            .keys()
            .filter(|id| !wanted_sites.contains(id.as_str()))
            .cloned()
            .collect();
        for site_id in stale_sites {
            self.inner.sites.write().remove(&site_id);
            report.sites_removed.push(site_id);
        }

        for site in config.sites {
            self.put_site(site, &mut report).await;
        }

        info!(
            added = report.boxes_added.len(),
            updated = report.boxes_updated.len(),
            removed = report.boxes_removed.len(),
            unchanged = report.unchanged,
            "Configuration applied"
        );
        self.update_gauges();
        Ok(report)
    }

    // ========================================================================
    // INTERNALS (callers hold the barrier)
    // ========================================================================

    fn box_ids(&self) -> Vec<BoxId> {
        let mut ids: Vec<BoxId> = self.inner.boxes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn runtime(&self, box_id: &str) -> Result<Arc<Mutex<BoxRuntime>>> {
        self.inner
            .boxes
            .get(box_id)
            .map(|h| h.runtime.clone())
            .ok_or_else(|| MonitorError::BoxNotFound(box_id.to_string()))
    }

    async fn acknowledge_detached(&self, alarm_id: AlarmId, by: &str) -> Result<AckOutcome> {
        let _barrier = self.inner.admin.lock().await;
        // Re-read under the barrier: the box may have been re-added meanwhile
        let alarm = self.alarm(alarm_id).await?;
        if let Ok(runtime) = self.runtime(&alarm.box_id) {
            return runtime.lock().await.acknowledge(alarm_id, by, Utc::now()).await;
        }

        debug!(%alarm_id, box_id = %alarm.box_id, "Acknowledging alarm of unconfigured box");
        acknowledge_record(
            self.inner.store.as_ref(),
            &self.inner.events,
            &self.inner.settings.persistence_retry,
            &alarm,
            by,
            Utc::now(),
        )
        .await
    }

    fn register_box(&self, site_id: &str, config: BoxConfig) -> Arc<Mutex<BoxRuntime>> {
        let box_id = config.id.clone();
        let runtime = Arc::new(Mutex::new(BoxRuntime::new(
            site_id.to_string(),
            config,
            &self.inner.settings,
            self.inner.store.clone(),
            self.inner.events.clone(),
        )));
        self.inner.boxes.insert(
            box_id,
            BoxHandle {
                site_id: site_id.to_string(),
                runtime: runtime.clone(),
                cancel: CancellationToken::new(),
                task: None,
            },
        );
        runtime
    }

    async fn spawn_box(&self, box_id: &str) {
        if !self.is_running() {
            return;
        }
        let Some((runtime, cancel)) = self
            .inner
            .boxes
            .get(box_id)
            .map(|h| (h.runtime.clone(), h.cancel.clone()))
        else {
            return;
        };

        let (addr, schedule) = {
            let rt = runtime.lock().await;
            match rt.endpoint() {
                Some(addr) => (addr, PollSchedule::for_box(rt.config(), &self.inner.settings)),
                None => {
                    debug!(box_id, "Box disabled, not polling");
                    return;
                }
            }
        };

        let task = spawn_poller(
            runtime,
            self.inner.client.clone(),
            box_id.to_string(),
            addr,
            schedule,
            cancel,
        );
        match self.inner.boxes.get_mut(box_id) {
            Some(mut handle) => handle.task = Some(task),
            None => task.abort(),
        }
    }

    /// Cancel a box's poller and hand back its task without waiting.
    ///
    /// The handle gets a fresh token so the box can be respawned.
    fn detach(&self, box_id: &str) -> Option<(Arc<Mutex<BoxRuntime>>, Option<JoinHandle<()>>)> {
        let mut handle = self.inner.boxes.get_mut(box_id)?;
        let cancel = std::mem::replace(&mut handle.cancel, CancellationToken::new());
        cancel.cancel();
        Some((handle.runtime.clone(), handle.task.take()))
    }

    /// Cancel a box's poller and wait for its in-flight cycle.
    async fn halt_box(&self, box_id: &str) -> Option<Arc<Mutex<BoxRuntime>>> {
        let (runtime, task) = self.detach(box_id)?;
        join_poller(box_id, task).await;
        Some(runtime)
    }

    async fn put_site(&self, site: SiteConfig, report: &mut ReloadReport) {
        let keep: HashSet<&str> = site.boxes.iter().map(|b| b.id.as_str()).collect();
        let previous: Vec<BoxId> = self
            .inner
            .sites
            .read()
            .get(&site.id)
            .map(|s| s.boxes.iter().map(|b| b.id.clone()).collect())
            .unwrap_or_default();
        for box_id in previous {
            if !keep.contains(box_id.as_str()) && self.drop_box(&box_id).await {
                report.boxes_removed.push(box_id);
            }
        }

        {
            let mut sites = self.inner.sites.write();
            let entry = sites.entry(site.id.clone()).or_insert_with(|| SiteConfig {
                boxes: Vec::new(),
                ..site.clone()
            });
            entry.name = site.name.clone();
            entry.vlan = site.vlan;
            entry.ip_range = site.ip_range.clone();
            entry.location = site.location.clone();
        }

        for bx in site.boxes {
            let box_id = bx.id.clone();
            match self.put_box(&site.id, bx).await {
                BoxChange::Added => report.boxes_added.push(box_id),
                BoxChange::Updated => report.boxes_updated.push(box_id),
                BoxChange::Unchanged => report.unchanged += 1,
            }
        }
    }

    async fn put_box(&self, site_id: &str, config: BoxConfig) -> BoxChange {
        let box_id = config.id.clone();
        self.record_in_site(site_id, &config);

        let existing = self
            .inner
            .boxes
            .get(&box_id)
            .map(|h| (h.site_id.clone(), h.runtime.clone()));

        let change = match existing {
            None => {
                self.register_box(site_id, config);
                info!(%box_id, site_id, "Box added");
                BoxChange::Added
            }
            Some((old_site, runtime)) => {
                let same = old_site == site_id && **runtime.lock().await.config() == config;
                if same {
                    return BoxChange::Unchanged;
                }

                self.halt_box(&box_id).await;
                {
                    let mut rt = runtime.lock().await;
                    rt.reconfigure(site_id.to_string(), config, &self.inner.settings);
                    if rt.endpoint().is_none() {
                        rt.mark_down(Utc::now());
                    }
                }
                if let Some(mut handle) = self.inner.boxes.get_mut(&box_id) {
                    handle.site_id = site_id.to_string();
                }
                info!(%box_id, site_id, "Box reconfigured");
                BoxChange::Updated
            }
        };

        self.spawn_box(&box_id).await;
        change
    }

    /// Keep the topology view in step: the box belongs to `site_id` only.
    fn record_in_site(&self, site_id: &str, config: &BoxConfig) {
        let mut sites = self.inner.sites.write();
        for (id, site) in sites.iter_mut() {
            if id != site_id {
                site.boxes.retain(|b| b.id != config.id);
            }
        }
        if let Some(site) = sites.get_mut(site_id) {
            match site.boxes.iter_mut().find(|b| b.id == config.id) {
                Some(slot) => *slot = config.clone(),
                None => site.boxes.push(config.clone()),
            }
        }
    }

    async fn drop_box(&self, box_id: &str) -> bool {
        let Some(runtime) = self.halt_box(box_id).await else {
            return false;
        };
        runtime.lock().await.mark_down(Utc::now());
        self.inner.boxes.remove(box_id);
        for site in self.inner.sites.write().values_mut() {
            site.boxes.retain(|b| b.id != box_id);
        }
        info!(box_id, "Box removed");
        true
    }

    fn update_gauges(&self) {
        #[cfg(feature = "metrics")]
        {
            gauge!("boxwatch_boxes").set(self.inner.boxes.len() as f64);
            gauge!("boxwatch_sites").set(self.inner.sites.read().len() as f64);
        }
    }
}

async fn join_poller(box_id: &str, task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        if let Err(e) = task.await {
            error!(box_id, "Poller task ended abnormally: {}", e);
        }
    }
}

fn validate_site(site: &SiteConfig) -> Result<()> {
    if site.id.trim().is_empty() {
        return Err(MonitorError::Config("site with empty id".into()));
    }
    let mut seen = HashSet::new();
    for bx in &site.boxes {
        if bx.id.trim().is_empty() {
            return Err(MonitorError::Config(format!("box with empty id in site '{}'", site.id)));
        }
        if !seen.insert(bx.id.as_str()) {
            return Err(MonitorError::Config(format!("duplicate box id '{}'", bx.id)));
        }
    }
    Ok(())
}
