use crate::common::*;
use boxwatch::simulator::BoxSimulator;
use boxwatch::{BoxStatus, Config, Engine, EngineEvent, MemoryStore, MonitorError, Severity};
use std::sync::Arc;

fn yaml(addr1: std::net::SocketAddr, addr2: std::net::SocketAddr, with_second: bool) -> String {
    let mut doc = format!(
        r#"
engine:
  poll_interval_ms: 100
  connect_timeout_ms: 200
  read_timeout_ms: 200
  failure_threshold: 2
sites:
  - id: "{site}"
    name: "Site A"
    boxes:
      - id: "box-1"
        ip: "{ip1}"
        port: {port1}
        pins:
          - pin: 2
            equipment: "CRAC 1"
            description: "Compressor fault"
            severity: MAJOR
            normally_open: true
"#,
        site = SITE,
        ip1 = addr1.ip(),
        port1 = addr1.port(),
    );
    if with_second {
        doc.push_str(&format!(
            r#"      - id: "box-2"
        ip: "{ip2}"
        port: {port2}
        pins:
          - pin: 4
            equipment: "Fire panel"
            severity: CRITICAL
"#,
            ip2 = addr2.ip(),
            port2 = addr2.port(),
        ));
    }
    doc
}

#[tokio::test]
async fn test_topology_changes_are_scoped_to_their_box() {
    let sim1 = BoxSimulator::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let sim2 = BoxSimulator::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    // box-2 pin 4 is wired normally closed: high is idle
    sim2.set_input(4, true).unwrap();

    let config = Config::from_yaml(&yaml(sim1.local_addr(), sim2.local_addr(), true)).unwrap();
    let engine = Engine::new(config.clone(), Arc::new(MemoryStore::new())).unwrap();
    engine.start().await;

    eventually("both boxes up", || {
        let engine = engine.clone();
        async move { engine.boxes().await.iter().all(|b| b.status == BoxStatus::Up) }
    })
    .await;
    assert!(engine.open_alarms().await.unwrap().is_empty());

    // Rewire pin 2 of box-1 as normally closed: the current low level now means alarm
    let mut box1 = config.sites[0].boxes[0].clone();
    box1.pins[0].normally_open = false;
    let snapshot = engine.upsert_box(SITE, box1).await.unwrap();
    assert_eq!(snapshot.box_id, "box-1");

    eventually("re-evaluated pin raises alarm", || {
        let engine = engine.clone();
        async move { engine.open_alarms().await.unwrap().len() == 1 }
    })
    .await;
    let alarm = engine.open_alarms().await.unwrap().remove(0);
    assert_eq!((alarm.box_id.as_str(), alarm.pin), ("box-1", 2));
    assert_eq!(engine.box_snapshot("box-2").await.unwrap().status, BoxStatus::Up);

    // Reload without box-2
    let mut events = engine.subscribe();
    let report = engine
        .apply_config(Config::from_yaml(&yaml(sim1.local_addr(), sim2.local_addr(), false)).unwrap())
        .await
        .unwrap();
    assert_eq!(report.boxes_removed, vec!["box-2".to_string()]);
    // The reload reverts box-1's rewiring
    assert_eq!(report.boxes_updated, vec!["box-1".to_string()]);

    assert!(matches!(
        engine.box_snapshot("box-2").await,
        Err(MonitorError::BoxNotFound(_))
    ));
    loop {
        let event = events.try_recv().expect("box-2 went down during the reload");
        if matches!(
            event,
            EngineEvent::BoxStatusChanged { ref box_id, status: BoxStatus::Down, .. } if box_id == "box-2"
        ) {
            break;
        }
    }
    let served = sim2.requests();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(sim2.requests(), served);

    // The alarm raised under the old wiring resolves under the restored one
    eventually("alarm resolved after revert", || {
        let engine = engine.clone();
        async move { engine.open_alarms().await.unwrap().is_empty() }
    })
    .await;

    engine.remove_site(SITE).await.unwrap();
    assert!(engine.sites().is_empty());
    assert!(engine.boxes().await.is_empty());
    assert!(matches!(
        engine.remove_site(SITE).await,
        Err(MonitorError::SiteNotFound(_))
    ));

    engine.stop().await;
    sim1.shutdown().await;
    sim2.shutdown().await;
}

#[tokio::test]
async fn test_invalid_box_does_not_block_valid_ones() {
    let sim = BoxSimulator::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mut broken = box_at("broken", sim.local_addr(), vec![pin(13, true, Severity::Major)]);
    broken.input_count = 12;
    let config = single_site(
        fast_settings(),
        vec![broken, box_at("fine", sim.local_addr(), vec![pin(1, true, Severity::Major)])],
    );
    let engine = Engine::new(config, Arc::new(MemoryStore::new())).unwrap();
    engine.start().await;

    eventually("valid box up", || {
        let engine = engine.clone();
        async move { engine.box_snapshot("fine").await.unwrap().status == BoxStatus::Up }
    })
    .await;
    let broken = engine.box_snapshot("broken").await.unwrap();
    assert_eq!(broken.status, BoxStatus::Down);
    assert!(broken.disabled_reason.unwrap().contains("pin 13"));

    engine.stop().await;
    sim.shutdown().await;
}
