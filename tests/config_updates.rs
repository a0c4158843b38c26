// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 运行期配置更新: 只在帧之间生效
mod common;

use std::time::Duration;

use common::*;
use sentinel_rs::analysis::{ActivityType, ThreatLevel};
use sentinel_rs::config::{ConfigError, ConfigUpdate, Thresholds};
use sentinel_rs::input::Step;
use sentinel_rs::pipeline::ManagerError;

fn paused_script() -> Vec<Step> {
    vec![
        Step::Frames(50),
        Step::Stall(Duration::from_millis(1500)),
        Step::Frames(50),
    ]
}

#[test]
fn zone_published_through_store_applies_from_next_frame() {
    let store = store(config(false));
    let mut manager = builder(store.clone(), source().script("gate-a", paused_script()), &person_script(1, 100))
        .build()
        .unwrap();
    let feed = manager.feed();
    manager.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        manager
            .status("gate-a")
            .is_some_and(|s| s.stats.frames_processed == 50)
    }));
    store
        .publish(ConfigUpdate::Zones {
            camera_id: "gate-a".into(),
            zones: vec![gate_zone()],
        })
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || manager.config_version() == 2));

    manager.wait();
    let got = drain(&feed);
    let intrusions = got.events_of(ActivityType::ZoneIntrusion);
    assert_eq!(intrusions.len(), 1);
    assert_eq!(intrusions[0].evidence.frame_seq, 51);
    assert!(got.events.iter().all(|e| e.evidence.frame_seq >= 51));
}

#[test]
fn invalid_update_never_reaches_pipeline() {
    let store = store(config(true));
    let manager = builder(store.clone(), source().script("gate-a", vec![Step::Frames(1)]), "")
        .build()
        .unwrap();

    let mut bad = gate_zone();
    bad.points.truncate(2);
    let err = store
        .publish(ConfigUpdate::Zones {
            camera_id: "gate-a".into(),
            zones: vec![bad.clone()],
        })
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidZone { .. }));

    let err = manager
        .apply_update(ConfigUpdate::Zones {
            camera_id: "gate-a".into(),
            zones: vec![bad],
        })
        .unwrap_err();
    assert!(matches!(err, ManagerError::Config(ConfigError::InvalidZone { .. })));

    let mut thresholds = Thresholds::default();
    thresholds.tracker.match_iou_threshold = -0.1;
    assert!(manager
        .apply_update(ConfigUpdate::Thresholds(Box::new(thresholds)))
        .is_err());
    assert_eq!(manager.config_version(), 1);
}

fn weapon_alerts(cooldown_secs: Option<u64>) -> (usize, usize) {
    let knife = |from: u64, to: u64| {
        format!(
            r#"{{"camera":"gate-a","from":{},"to":{},"detections":[{{"label":"knife","confidence":0.8,"bbox":{{"x1":100,"y1":100,"x2":140,"y2":130}}}}]}}"#,
            from, to
        )
    };
    // 同一位置先后出现两把刀 (第一条轨迹已被移除)
    let script = format!("{}\n{}", knife(1, 5), knife(60, 65));
    let mut manager = builder(store(config(false)), source().script("gate-a", vec![Step::Frames(70)]), &script)
        .build()
        .unwrap();
    if let Some(secs) = cooldown_secs {
        let mut thresholds = Thresholds::default();
        thresholds.alerts.default_cooldown_secs = secs;
        manager
            .apply_update(ConfigUpdate::Thresholds(Box::new(thresholds)))
            .unwrap();
    }

    let feed = manager.feed();
    manager.start().unwrap();
    manager.wait();
    let got = drain(&feed);
    assert!(got
        .alerts
        .iter()
        .all(|a| a.activity == ActivityType::WeaponDetected && a.threat == ThreatLevel::Critical));
    (
        got.events_of(ActivityType::WeaponDetected).len(),
        got.alerts.len(),
    )
}

#[test]
fn weapon_cooldown_is_camera_scoped_and_updatable() {
    // 默认60s冷却: 第二把刀只产生事件, 不再告警
    assert_eq!(weapon_alerts(None), (2, 1));
    // 冷却缩短为1s后两次都告警
    assert_eq!(weapon_alerts(Some(1)), (2, 2));
}
