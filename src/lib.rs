//! BOXWATCH - Box Polling & Alarm Lifecycle Engine
//!
//! Polls BF-2300 remote I/O boxes over their fixed-frame TCP protocol,
//! derives equipment alarms from digital input pins and keeps alarm records
//! through their raise / acknowledge / resolve lifecycle.
//!
//! Each box runs in its own task with its own failure domain: a box that
//! times out or answers garbage only ever affects its own status.
//!
//! # Examples
//!
//! ```rust,no_run
//! use boxwatch::{storage::open_store, Config, Engine};
//!
//! # async fn run() -> boxwatch::Result<()> {
//! boxwatch::init_logging();
//!
//! let config = Config::from_file("boxwatch.yaml")?;
//! let store = open_store(&config.storage).await?;
//! let engine = Engine::new(config, store)?;
//! let mut events = engine.subscribe();
//!
//! engine.start().await;
//! while let Ok(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `metrics`: poll, alarm and persistence counters through the `metrics` facade

// ============================================================================
// CORE MODULES
// ============================================================================

pub mod error;
pub mod config;
pub mod model;

/// BF-2300 frame codec and stream framing
pub mod protocols;

/// Single-exchange TCP client for one box
pub mod client;

pub mod pins;
pub mod alarms;
pub mod events;
pub mod poller;

/// Alarm persistence port and the bundled stores
pub mod storage;

pub mod engine;

/// In-process BF-2300 box for tests and bench setups
pub mod simulator;

// ============================================================================
// PUBLIC API EXPORTS
// ============================================================================

pub use alarms::{is_alarm, AckOutcome, AlarmLifecycle, EdgeEffect};
pub use client::{BoxClient, TcpBoxClient};
pub use config::{BoxConfig, Config, EngineSettings, PinConfig, Severity, SiteConfig};
pub use engine::{Engine, ReloadReport};
pub use error::{FrameError, MonitorError, Result};
pub use events::{EngineEvent, EventPublisher};
pub use model::{Alarm, AlarmId, AlarmStatus, BoxSnapshot, BoxStatus};
pub use pins::{PinEdge, PinStateTracker};
pub use storage::{AlarmQuery, AlarmStore, FileStore, MemoryStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set, otherwise `boxwatch=info`. Calling this again
/// after a subscriber is installed does nothing.
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("boxwatch=info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    if subscriber.try_init().is_ok() {
        tracing::debug!("BOXWATCH {} logging initialized", VERSION);
    }
}
