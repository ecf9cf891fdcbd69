// src/config.rs - Site / box / pin topology and engine settings

use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identifier of a site, as assigned by the administrative layer
pub type SiteId = String;

/// Identifier of a box, unique across all sites
pub type BoxId = String;

/// Highest pin count a single Auto Report can carry
pub const MAX_INPUTS: u8 = 32;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Main BOXWATCH configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineSettings,

    /// Alarm store selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Monitored sites and their boxes
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Whole-file checks. Per-box problems are reported by
    /// [`BoxConfig::validate`] and only disable the affected box.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        let mut site_ids = HashSet::new();
        let mut box_ids = HashSet::new();
        for site in &self.sites {
            if site.id.trim().is_empty() {
                return Err(MonitorError::Config("site with empty id".into()));
            }
            if !site_ids.insert(site.id.as_str()) {
                return Err(MonitorError::Config(format!("duplicate site id '{}'", site.id)));
            }
            for bx in &site.boxes {
                if bx.id.trim().is_empty() {
                    return Err(MonitorError::Config(format!(
                        "box with empty id in site '{}'",
                        site.id
                    )));
                }
                if !box_ids.insert(bx.id.as_str()) {
                    return Err(MonitorError::Config(format!("duplicate box id '{}'", bx.id)));
                }
            }
        }
        Ok(())
    }

    /// Every box paired with its owning site id
    pub fn boxes(&self) -> impl Iterator<Item = (&SiteId, &BoxConfig)> {
        self.sites
            .iter()
            .flat_map(|site| site.boxes.iter().map(move |bx| (&site.id, bx)))
    }
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

/// Engine runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    /// Default poll interval per box in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_ms: u64,

    /// Response read timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub read_timeout_ms: u64,

    /// Consecutive failed cycles before a box is reported UNREACHABLE
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Buffered events per subscriber before it starts lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Backoff policy for alarm store writes
    #[serde(default)]
    pub persistence_retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            connect_timeout_ms: default_timeout(),
            read_timeout_ms: default_timeout(),
            failure_threshold: default_failure_threshold(),
            event_capacity: default_event_capacity(),
            persistence_retry: RetryPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(MonitorError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(MonitorError::Config("timeouts must be > 0".into()));
        }
        if self.failure_threshold == 0 {
            return Err(MonitorError::Config("failure_threshold must be >= 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(MonitorError::Config("event_capacity must be >= 1".into()));
        }
        self.persistence_retry.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Upper bound for one whole exchange (connect + write + read)
    pub fn cycle_timeout(&self) -> Duration {
        self.connect_timeout() + self.read_timeout()
    }
}

/// Bounded exponential backoff for persistence writes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(MonitorError::Config(
                "persistence_retry.max_attempts must be >= 1".into(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(MonitorError::Config(
                "persistence_retry.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Where alarm records are kept
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process memory only; records are lost on restart
    #[default]
    Memory,
    /// One JSON document per alarm under `path`
    File { path: PathBuf },
}

// ============================================================================
// TOPOLOGY
// ============================================================================

/// A monitored site
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteConfig {
    pub id: SiteId,
    pub name: String,

    /// VLAN tag the site's boxes live on
    #[serde(default)]
    pub vlan: Option<u16>,

    /// Address range assigned to the site, informational
    #[serde(default)]
    pub ip_range: Option<String>,

    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub boxes: Vec<BoxConfig>,
}

/// One remote BF-2300 box
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoxConfig {
    pub id: BoxId,

    /// IPv4 or IPv6 address, validated at load time
    pub ip: String,

    pub port: u16,

    /// Overrides `engine.poll_interval_ms` for this box
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// Number of input pins read from each Auto Report
    #[serde(default = "default_input_count")]
    pub input_count: u8,

    /// Pins bound to equipment, ordered by pin number
    #[serde(default)]
    pub pins: Vec<PinConfig>,
}

impl BoxConfig {
    /// Validated socket address of the box
    pub fn endpoint(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.ip.trim().parse().map_err(|e| {
            MonitorError::Config(format!("box '{}': invalid IP '{}': {}", self.id, self.ip, e))
        })?;
        if self.port == 0 {
            return Err(MonitorError::Config(format!("box '{}': port must be > 0", self.id)));
        }
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Checks that only disable this box when they fail
    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;

        if self.input_count == 0 || self.input_count > MAX_INPUTS {
            return Err(MonitorError::Config(format!(
                "box '{}': input_count {} outside 1..={}",
                self.id, self.input_count, MAX_INPUTS
            )));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(MonitorError::Config(format!(
                "box '{}': poll_interval_ms must be > 0",
                self.id
            )));
        }
        if self.pins.is_empty() {
            return Err(MonitorError::Config(format!("box '{}': no pins configured", self.id)));
        }

        let mut seen = HashSet::new();
        for pin in &self.pins {
            if pin.pin == 0 || pin.pin > self.input_count {
                return Err(MonitorError::Config(format!(
                    "box '{}': pin {} outside 1..={}",
                    self.id, pin.pin, self.input_count
                )));
            }
            if !seen.insert(pin.pin) {
                return Err(MonitorError::Config(format!(
                    "box '{}': pin {} configured twice",
                    self.id, pin.pin
                )));
            }
        }
        Ok(())
    }

    pub fn pin(&self, pin: u8) -> Option<&PinConfig> {
        self.pins.iter().find(|p| p.pin == pin)
    }

    pub fn poll_interval(&self, engine: &EngineSettings) -> Duration {
        self.poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| engine.poll_interval())
    }

    /// Pins whose configuration differs between `self` and `other`,
    /// including pins present on only one side.
    pub fn changed_pins(&self, other: &BoxConfig) -> Vec<u8> {
        let mut changed: Vec<u8> = self
            .pins
            .iter()
            .filter(|p| other.pin(p.pin) != Some(*p))
            .map(|p| p.pin)
            .collect();
        changed.extend(
            other
                .pins
                .iter()
                .filter(|p| self.pin(p.pin).is_none())
                .map(|p| p.pin),
        );
        changed.sort_unstable();
        changed.dedup();
        changed
    }
}

/// Alarm severity class attached to a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "critical")]
    Critical,
    #[serde(alias = "major")]
    Major,
    #[serde(alias = "warning")]
    Warning,
}

/// Binding of one input pin to a piece of equipment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinConfig {
    /// Input pin number, 1-based
    pub pin: u8,

    /// Equipment label (e.g. "Rectifier A")
    pub equipment: String,

    #[serde(default)]
    pub description: String,

    pub severity: Severity,

    /// Which electrical level is abnormal: idle = !normally_open, alarm = normally_open
    #[serde(default)]
    pub normally_open: bool,
}

// ============================================================================
// DEFAULTS
// ============================================================================

fn default_poll_interval() -> u64 { 30_000 }
fn default_timeout() -> u64 { 3_000 }
fn default_failure_threshold() -> u32 { 3 }
fn default_event_capacity() -> usize { 1024 }
fn default_max_attempts() -> u32 { 5 }
fn default_initial_backoff() -> u64 { 100 }
fn default_max_backoff() -> u64 { 5_000 }
fn default_input_count() -> u8 { 12 }

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
engine:
  poll_interval_ms: 20000
  failure_threshold: 4
storage:
  kind: file
  path: /var/lib/boxwatch
sites:
  - id: "north"
    name: "North Exchange"
    vlan: 120
    ip_range: "10.20.0.0/24"
    location: "Building 3"
    boxes:
      - id: "north-1"
        ip: "10.20.0.11"
        port: 5000
        pins:
          - pin: 7
            equipment: "Rectifier A"
            description: "Mains failure"
            severity: CRITICAL
            normally_open: true
          - pin: 2
            equipment: "CRAC 1"
            severity: warning
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.engine.poll_interval_ms, 20_000);
        assert_eq!(config.engine.failure_threshold, 4);
        assert_eq!(config.engine.read_timeout_ms, 3_000);
        assert_eq!(
            config.storage,
            StorageConfig::File { path: PathBuf::from("/var/lib/boxwatch") }
        );

        let (site_id, bx) = config.boxes().next().unwrap();
        assert_eq!(site_id, "north");
        assert_eq!(bx.input_count, 12);
        assert_eq!(bx.endpoint().unwrap(), "10.20.0.11:5000".parse().unwrap());

        let pin7 = bx.pin(7).unwrap();
        assert_eq!(pin7.severity, Severity::Critical);
        assert!(pin7.normally_open);

        let pin2 = bx.pin(2).unwrap();
        assert_eq!(pin2.severity, Severity::Warning);
        assert!(!pin2.normally_open);
        bx.validate().unwrap();
    }

    #[test]
    fn test_duplicate_box_ids_rejected() {
        let yaml = r#"
sites:
  - id: a
    name: A
    boxes:
      - { id: "b1", ip: "10.0.0.1", port: 5000, pins: [{ pin: 1, equipment: x, severity: MAJOR }] }
  - id: b
    name: B
    boxes:
      - { id: "b1", ip: "10.0.0.2", port: 5000, pins: [{ pin: 1, equipment: y, severity: MAJOR }] }
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, MonitorError::Config(msg) if msg.contains("duplicate box id")));
    }

    fn box_with(ip: &str, port: u16, pins: Vec<PinConfig>) -> BoxConfig {
        BoxConfig {
            id: "bx".into(),
            ip: ip.into(),
            port,
            poll_interval_ms: None,
            input_count: 12,
            pins,
        }
    }

    fn pin(n: u8) -> PinConfig {
        PinConfig {
            pin: n,
            equipment: format!("eq{}", n),
            description: String::new(),
            severity: Severity::Major,
            normally_open: false,
        }
    }

    #[test]
    fn test_box_validation() {
        assert!(box_with("10.0.0.1", 5000, vec![pin(1)]).validate().is_ok());
        assert!(box_with("not-an-ip", 5000, vec![pin(1)]).validate().is_err());
        assert!(box_with("10.0.0.1", 0, vec![pin(1)]).validate().is_err());
        assert!(box_with("10.0.0.1", 5000, vec![]).validate().is_err());
        assert!(box_with("10.0.0.1", 5000, vec![pin(13)]).validate().is_err());
        assert!(box_with("10.0.0.1", 5000, vec![pin(0)]).validate().is_err());
        assert!(box_with("10.0.0.1", 5000, vec![pin(3), pin(3)]).validate().is_err());
    }

    #[test]
    fn test_changed_pins() {
        let old = box_with("10.0.0.1", 5000, vec![pin(1), pin(2), pin(3)]);
        let mut flipped = pin(2);
        flipped.normally_open = true;
        let new = box_with("10.0.0.1", 5000, vec![pin(1), flipped, pin(4)]);
        assert_eq!(new.changed_pins(&old), vec![2, 3, 4]);
        assert!(old.changed_pins(&old).is_empty());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_engine_settings_validation() {
        let mut settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        settings.failure_threshold = 0;
        assert!(settings.validate().is_err());
    }
}
