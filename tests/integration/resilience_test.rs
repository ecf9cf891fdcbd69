use crate::common::*;
use async_trait::async_trait;
use boxwatch::protocols::{AutoReport, BLOCK_LEN};
use boxwatch::{BoxClient, BoxStatus, Engine, MemoryStore, MonitorError, Result, Severity};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Boxes on `stuck` never answer; every other box answers at once.
struct SplitClient {
    stuck: SocketAddr,
    completed: DashMap<SocketAddr, u32>,
}

#[async_trait]
impl BoxClient for SplitClient {
    async fn poll(&self, addr: SocketAddr) -> Result<AutoReport> {
        if addr == self.stuck {
            futures::future::pending::<()>().await;
        }
        *self.completed.entry(addr).or_insert(0) += 1;
        Ok(AutoReport {
            inputs: [false; BLOCK_LEN],
            outputs: [false; BLOCK_LEN],
        })
    }
}

/// Every box is refused.
struct RefusingClient;

#[async_trait]
impl BoxClient for RefusingClient {
    async fn poll(&self, addr: SocketAddr) -> Result<AutoReport> {
        Err(MonitorError::ConnectionRefused { addr })
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 1, 0, 1], port))
}

#[tokio::test(start_paused = true)]
async fn test_stuck_box_does_not_delay_healthy_boxes() {
    const HEALTHY: u16 = 20;
    let mut settings = fast_settings();
    settings.poll_interval_ms = 1_000;
    settings.connect_timeout_ms = 3_000;
    settings.read_timeout_ms = 3_000;
    settings.failure_threshold = 3;

    let mut boxes = vec![box_at("stuck", addr(4999), vec![pin(1, true, Severity::Major)])];
    for port in 5000..5000 + HEALTHY {
        boxes.push(box_at(
            &format!("healthy-{}", port),
            addr(port),
            vec![pin(1, true, Severity::Major)],
        ));
    }

    let client = Arc::new(SplitClient {
        stuck: addr(4999),
        completed: DashMap::new(),
    });
    let engine = Engine::with_client(
        single_site(settings, boxes),
        Arc::new(MemoryStore::new()),
        client.clone(),
    )
    .unwrap();
    engine.start().await;

    // Ticks at 0..=30 s
    tokio::time::sleep(Duration::from_millis(30_500)).await;

    for port in 5000..5000 + HEALTHY {
        let done = client.completed.get(&addr(port)).map(|c| *c).unwrap_or(0);
        assert_eq!(done, 31, "healthy box on port {} missed cycles", port);
    }
    assert!(client.completed.get(&addr(4999)).is_none());

    let stuck = engine.box_snapshot("stuck").await.unwrap();
    assert_eq!(stuck.status, BoxStatus::Unreachable);
    // 6 s cycle timeout against a 1 s interval: missed ticks are skipped, not queued
    assert!(stuck.consecutive_failures <= 6, "{} failures", stuck.consecutive_failures);
    assert!(stuck.consecutive_failures >= 4);

    let snapshots = engine.boxes().await;
    assert_eq!(
        snapshots.iter().filter(|b| b.status == BoxStatus::Up).count(),
        usize::from(HEALTHY)
    );

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_only_after_threshold() {
    let mut settings = fast_settings();
    settings.poll_interval_ms = 1_000;
    settings.failure_threshold = 3;
    let engine = Engine::with_client(
        single_site(settings, vec![box_at("b", addr(6000), vec![pin(2, false, Severity::Warning)])]),
        Arc::new(MemoryStore::new()),
        Arc::new(RefusingClient),
    )
    .unwrap();
    engine.start().await;

    // Failures at 0 s and 1 s
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let snapshot = engine.box_snapshot("b").await.unwrap();
    assert_eq!(snapshot.consecutive_failures, 2);
    assert_eq!(snapshot.status, BoxStatus::Down);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let snapshot = engine.box_snapshot("b").await.unwrap();
    assert_eq!(snapshot.status, BoxStatus::Unreachable);
    assert!(snapshot.last_error.unwrap().contains("refused"));
    // Connectivity gaps never produce alarms
    assert!(engine.alarms(&Default::default()).await.unwrap().is_empty());

    engine.stop().await;
}
