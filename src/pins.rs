// src/pins.rs - Edge-triggered pin level tracking
//!
//! [`PinStateTracker`] keeps the last committed level of every input pin of
//! one box. Detection and commit are separate steps: [`PinStateTracker::diff`]
//! reports edges against the committed levels without changing anything, and
//! the caller commits each edge with [`PinStateTracker::commit`] once its
//! downstream effect (alarm persistence) has succeeded. An edge whose effect
//! failed stays uncommitted and is reported again on the next reading.

use serde::Serialize;
use std::collections::BTreeMap;

/// A level change of one pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PinEdge {
    pub pin: u8,
    /// `None` for the first observation of the pin
    pub previous: Option<bool>,
    pub level: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PinStateTracker {
    levels: BTreeMap<u8, bool>,
}

impl PinStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edges of `reading` relative to the committed levels, in pin order.
    ///
    /// The first observation of a pin always counts as an edge.
    pub fn diff<I>(&self, reading: I) -> Vec<PinEdge>
    where
        I: IntoIterator<Item = (u8, bool)>,
    {
        let mut edges: Vec<PinEdge> = reading
            .into_iter()
            .filter_map(|(pin, level)| {
                let previous = self.levels.get(&pin).copied();
                (previous != Some(level)).then_some(PinEdge { pin, previous, level })
            })
            .collect();
        edges.sort_by_key(|e| e.pin);
        edges.dedup_by_key(|e| e.pin);
        edges
    }

    pub fn commit(&mut self, edge: &PinEdge) {
        self.levels.insert(edge.pin, edge.level);
    }

    /// Diff and commit in one step, for pins with no downstream effect.
    pub fn observe<I>(&mut self, reading: I) -> Vec<PinEdge>
    where
        I: IntoIterator<Item = (u8, bool)>,
    {
        let edges = self.diff(reading);
        for edge in &edges {
            self.commit(edge);
        }
        edges
    }

    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels.get(&pin).copied()
    }

    pub fn levels(&self) -> &BTreeMap<u8, bool> {
        &self.levels
    }

    /// Drop the committed level so the next reading re-reports the pin.
    pub fn forget(&mut self, pin: u8) {
        self.levels.remove(&pin);
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }
}
