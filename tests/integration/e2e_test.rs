use crate::common::*;
use boxwatch::simulator::{BoxSimulator, SimMode};
use boxwatch::storage::FileStore;
use boxwatch::{AlarmQuery, AlarmStatus, BoxStatus, Engine, EngineEvent, MemoryStore, Severity};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn simulator() -> BoxSimulator {
    BoxSimulator::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
}

#[tokio::test]
async fn test_alarm_lifecycle_over_tcp() {
    let sim = simulator().await;
    let config = single_site(
        fast_settings(),
        vec![box_at("box-1", sim.local_addr(), vec![pin(7, true, Severity::Critical)])],
    );
    let engine = Engine::new(config, Arc::new(MemoryStore::new())).unwrap();
    let mut events = engine.subscribe();
    engine.start().await;

    eventually("box up", || {
        let engine = engine.clone();
        async move { engine.box_snapshot("box-1").await.unwrap().status == BoxStatus::Up }
    })
    .await;
    assert!(engine.open_alarms().await.unwrap().is_empty());

    sim.set_input(7, true).unwrap();
    eventually("alarm raised", || {
        let engine = engine.clone();
        async move { engine.open_alarms().await.unwrap().len() == 1 }
    })
    .await;
    let alarm = engine.open_alarms().await.unwrap().remove(0);
    assert_eq!(alarm.status, AlarmStatus::Critical);
    assert_eq!(alarm.site_id, SITE);

    let acked = engine.acknowledge(alarm.id, "night-shift").await.unwrap();
    assert_eq!(acked.alarm().acknowledged_by.as_deref(), Some("night-shift"));

    sim.set_input(7, false).unwrap();
    eventually("alarm resolved", || {
        let engine = engine.clone();
        async move { engine.open_alarms().await.unwrap().is_empty() }
    })
    .await;

    let history = engine.alarms(&AlarmQuery::for_box("box-1")).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, alarm.id);
    assert_eq!(history[0].status, AlarmStatus::Ok);
    assert!(history[0].acknowledged_at.unwrap() <= history[0].resolved_at.unwrap());

    engine.stop().await;
    sim.shutdown().await;

    let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| !matches!(e, EngineEvent::BoxStatusChanged { .. }))
        .map(|e| e.name())
        .collect();
    assert_eq!(names, vec!["alarm_created", "alarm_acknowledged", "alarm_resolved"]);
}

#[tokio::test]
async fn test_restart_does_not_duplicate_open_alarm() {
    let dir = TempDir::new().unwrap();
    let sim = simulator().await;
    sim.set_input(3, true).unwrap();
    let config = single_site(
        fast_settings(),
        vec![box_at("box-1", sim.local_addr(), vec![pin(3, true, Severity::Major)])],
    );

    {
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let engine = Engine::new(config.clone(), store).unwrap();
        engine.start().await;
        eventually("alarm raised", || {
            let engine = engine.clone();
            async move { engine.open_alarms().await.unwrap().len() == 1 }
        })
        .await;
        engine.stop().await;
    }

    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let engine = Engine::new(config, store).unwrap();
    engine.start().await;
    eventually("box up after restart", || {
        let engine = engine.clone();
        async move { engine.box_snapshot("box-1").await.unwrap().status == BoxStatus::Up }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.alarms(&AlarmQuery::default()).await.unwrap().len(), 1);

    // The recovered alarm is the one that resolves
    let recovered = engine.open_alarms().await.unwrap().remove(0);
    sim.set_input(3, false).unwrap();
    eventually("recovered alarm resolved", || {
        let engine = engine.clone();
        async move { engine.open_alarms().await.unwrap().is_empty() }
    })
    .await;
    assert!(engine.alarm(recovered.id).await.unwrap().resolved_at.is_some());

    engine.stop().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_leave_state_unchanged() {
    let sim = simulator().await;
    sim.set_mode(SimMode::CorruptChecksum);
    sim.set_input(5, false).unwrap();
    let config = single_site(
        fast_settings(),
        vec![box_at("box-1", sim.local_addr(), vec![pin(5, false, Severity::Warning)])],
    );
    let engine = Engine::new(config, Arc::new(MemoryStore::new())).unwrap();
    engine.start().await;

    eventually("box unreachable", || {
        let engine = engine.clone();
        async move { engine.box_snapshot("box-1").await.unwrap().status == BoxStatus::Unreachable }
    })
    .await;
    let snapshot = engine.box_snapshot("box-1").await.unwrap();
    assert!(snapshot.pin_levels.is_empty());
    assert!(snapshot.last_error.unwrap().contains("checksum"));
    assert!(engine.alarms(&AlarmQuery::default()).await.unwrap().is_empty());

    sim.set_mode(SimMode::Normal);
    eventually("alarm after recovery", || {
        let engine = engine.clone();
        async move { engine.open_alarms().await.unwrap().len() == 1 }
    })
    .await;
    assert_eq!(engine.box_snapshot("box-1").await.unwrap().status, BoxStatus::Up);

    engine.stop().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_unknown_command_is_skipped() {
    let sim = simulator().await;
    sim.set_mode(SimMode::UnknownCommandFirst);
    sim.set_input(1, true).unwrap();
    let config = single_site(
        fast_settings(),
        vec![box_at("box-1", sim.local_addr(), vec![pin(1, true, Severity::Major)])],
    );
    let engine = Engine::new(config, Arc::new(MemoryStore::new())).unwrap();
    engine.start().await;

    eventually("alarm raised", || {
        let engine = engine.clone();
        async move { engine.open_alarms().await.unwrap().len() == 1 }
    })
    .await;
    assert_eq!(engine.box_snapshot("box-1").await.unwrap().consecutive_failures, 0);

    engine.stop().await;
    sim.shutdown().await;
}
