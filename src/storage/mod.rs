// src/storage/mod.rs
//! Persistence port for alarm records.
//!
//! The engine only talks to [`AlarmStore`]; concrete stores live in the
//! submodules. Every `save` must be atomic per record and idempotent by
//! alarm id so that a retried write never produces a second record.

use crate::config::{BoxId, SiteId, StorageConfig};
use crate::error::{MonitorError, Result};
use crate::model::{Alarm, AlarmId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlarmStore: Send + Sync {
    /// Insert or replace the record with `alarm.id`
    async fn save(&self, alarm: &Alarm) -> Result<()>;

    async fn get(&self, id: AlarmId) -> Result<Option<Alarm>>;

    /// Every alarm with `resolved_at == None`
    async fn open_alarms(&self) -> Result<Vec<Alarm>>;

    /// Filtered history, newest first
    async fn list(&self, query: &AlarmQuery) -> Result<Vec<Alarm>>;
}

/// Filter for alarm history reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmQuery {
    pub site_id: Option<SiteId>,
    pub box_id: Option<BoxId>,
    pub open_only: bool,
    /// Only alarms created at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AlarmQuery {
    pub fn for_box(box_id: impl Into<BoxId>) -> Self {
        Self {
            box_id: Some(box_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, alarm: &Alarm) -> bool {
        self.site_id.as_ref().map_or(true, |s| *s == alarm.site_id)
            && self.box_id.as_ref().map_or(true, |b| *b == alarm.box_id)
            && (!self.open_only || alarm.is_open())
            && self.since.map_or(true, |since| alarm.created_at >= since)
    }

    /// Filter, sort newest first and truncate
    pub fn apply<'a>(&self, alarms: impl Iterator<Item = &'a Alarm>) -> Vec<Alarm> {
        let mut out: Vec<Alarm> = alarms.filter(|a| self.matches(a)).cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Refuse any change to a record that is already resolved.
///
/// Rewriting the stored resolved record unchanged is allowed, so a retried
/// resolution stays idempotent.
pub(crate) fn check_not_closed(records: &HashMap<AlarmId, Alarm>, alarm: &Alarm) -> Result<()> {
    match records.get(&alarm.id) {
        Some(stored) if !stored.is_open() && stored != alarm => {
            Err(MonitorError::AlarmClosed(alarm.id))
        }
        _ => Ok(()),
    }
}

/// Refuse a write that would leave two open alarms on one (box, pin).
pub(crate) fn check_single_open(records: &HashMap<AlarmId, Alarm>, alarm: &Alarm) -> Result<()> {
    if !alarm.is_open() {
        return Ok(());
    }
    let conflict = records.values().find(|other| {
        other.id != alarm.id
            && other.is_open()
            && other.box_id == alarm.box_id
            && other.pin == alarm.pin
    });
    match conflict {
        Some(other) => Err(MonitorError::Persistence(format!(
            "box '{}' pin {} already has open alarm {}",
            alarm.box_id, alarm.pin, other.id
        ))),
        None => Ok(()),
    }
}

/// Build the store selected in the configuration
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn AlarmStore>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageConfig::File { path } => Ok(Arc::new(FileStore::open(path).await?)),
    }
}
