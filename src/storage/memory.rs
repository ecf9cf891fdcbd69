// src/storage/memory.rs - Process-local alarm store
use super::{check_not_closed, check_single_open, AlarmQuery, AlarmStore};
use crate::error::Result;
use crate::model::{Alarm, AlarmId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Keeps alarm records in memory. Records do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<AlarmId, Alarm>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl AlarmStore for MemoryStore {
    async fn save(&self, alarm: &Alarm) -> Result<()> {
        let mut records = self.records.write();
        check_not_closed(&records, alarm)?;
        check_single_open(&records, alarm)?;
        records.insert(alarm.id, alarm.clone());
        Ok(())
    }

    async fn get(&self, id: AlarmId) -> Result<Option<Alarm>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn open_alarms(&self) -> Result<Vec<Alarm>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|a| a.is_open())
            .cloned()
            .collect())
    }

    async fn list(&self, query: &AlarmQuery) -> Result<Vec<Alarm>> {
        Ok(query.apply(self.records.read().values()))
    }
}
