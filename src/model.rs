// src/model.rs - Alarm records and box status
use crate::config::{BoxId, PinConfig, Severity, SiteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use uuid::Uuid;

/// Alarm identifier; a new excursion always gets a fresh one
pub type AlarmId = Uuid;

/// Status carried by an alarm record.
///
/// One of the severity classes while the alarm is open, `Ok` once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmStatus {
    Critical,
    Major,
    Warning,
    Ok,
}

impl From<Severity> for AlarmStatus {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical => AlarmStatus::Critical,
            Severity::Major => AlarmStatus::Major,
            Severity::Warning => AlarmStatus::Warning,
        }
    }
}

/// What caused a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmAction {
    Raised,
    Acknowledged,
    Resolved,
}

/// One append-only entry in an alarm's status history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: AlarmStatus,
    pub action: AlarmAction,
    pub at: DateTime<Utc>,
    /// Operator identity for acknowledgments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
}

/// A persisted record of one excursion of a pin into its alarm level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: AlarmId,
    pub site_id: SiteId,
    pub box_id: BoxId,
    pub pin: u8,
    pub equipment: String,
    pub description: String,
    pub status: AlarmStatus,
    /// Severity the alarm was raised with; kept after resolution
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub status_history: Vec<StatusChange>,
}

impl Alarm {
    /// Fresh open alarm for `pin` raised at `now`
    pub fn raise(site_id: &str, box_id: &str, pin: &PinConfig, now: DateTime<Utc>) -> Self {
        let status = AlarmStatus::from(pin.severity);
        Self {
            id: Uuid::new_v4(),
            site_id: site_id.to_string(),
            box_id: box_id.to_string(),
            pin: pin.pin,
            equipment: pin.equipment.clone(),
            description: pin.description.clone(),
            status,
            severity: pin.severity,
            created_at: now,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            status_history: vec![StatusChange {
                status,
                action: AlarmAction::Raised,
                at: now,
                by: None,
            }],
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    /// Copy with the acknowledgment applied; the caller persists it.
    pub fn acknowledged(&self, by: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.acknowledged_by = Some(by.to_string());
        next.acknowledged_at = Some(now);
        next.status_history.push(StatusChange {
            status: self.status,
            action: AlarmAction::Acknowledged,
            at: now,
            by: Some(by.to_string()),
        });
        next
    }

    /// Copy with the resolution applied; the caller persists it.
    pub fn resolved(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        // acknowledged_at <= resolved_at even if the wall clock stepped back
        let at = match self.acknowledged_at {
            Some(acked) if acked > now => acked,
            _ => now,
        };
        next.status = AlarmStatus::Ok;
        next.resolved_at = Some(at);
        next.status_history.push(StatusChange {
            status: AlarmStatus::Ok,
            action: AlarmAction::Resolved,
            at,
            by: None,
        });
        next
    }
}

/// Connectivity status of a box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoxStatus {
    /// Last poll succeeded
    Up,
    /// Failure threshold reached
    Unreachable,
    /// Not polled: not yet confirmed, disabled by configuration, or stopped
    Down,
}

impl std::fmt::Display for BoxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoxStatus::Up => write!(f, "UP"),
            BoxStatus::Unreachable => write!(f, "UNREACHABLE"),
            BoxStatus::Down => write!(f, "DOWN"),
        }
    }
}

/// Point-in-time view of one box for the upstream API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoxSnapshot {
    pub box_id: BoxId,
    pub site_id: SiteId,
    pub endpoint: Option<SocketAddr>,
    pub status: BoxStatus,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set when the box failed validation and is not polled
    pub disabled_reason: Option<String>,
    pub pin_levels: BTreeMap<u8, bool>,
}
