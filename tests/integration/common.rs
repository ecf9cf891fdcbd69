#![allow(dead_code)]

use boxwatch::{BoxConfig, Config, EngineSettings, PinConfig, Severity, SiteConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

pub const SITE: &str = "site-a";

pub fn pin(n: u8, normally_open: bool, severity: Severity) -> PinConfig {
    PinConfig {
        pin: n,
        equipment: format!("Equipment {}", n),
        description: format!("Input {}", n),
        severity,
        normally_open,
    }
}

pub fn box_at(id: &str, addr: SocketAddr, pins: Vec<PinConfig>) -> BoxConfig {
    BoxConfig {
        id: id.to_string(),
        ip: addr.ip().to_string(),
        port: addr.port(),
        poll_interval_ms: None,
        input_count: 12,
        pins,
    }
}

/// Short timings for tests against the local simulator
pub fn fast_settings() -> EngineSettings {
    let mut settings = EngineSettings {
        poll_interval_ms: 100,
        connect_timeout_ms: 200,
        read_timeout_ms: 200,
        failure_threshold: 2,
        ..EngineSettings::default()
    };
    settings.persistence_retry.initial_backoff_ms = 5;
    settings.persistence_retry.max_backoff_ms = 20;
    settings
}

pub fn single_site(settings: EngineSettings, boxes: Vec<BoxConfig>) -> Config {
    Config {
        engine: settings,
        sites: vec![SiteConfig {
            id: SITE.to_string(),
            name: "Site A".to_string(),
            vlan: Some(100),
            ip_range: Some("127.0.0.0/8".to_string()),
            location: None,
            boxes,
        }],
        ..Config::default()
    }
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}
