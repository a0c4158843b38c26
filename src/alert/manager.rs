// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 告警管理 - 去重与冷却
//!
//! 每个摄像头独占一个 [`AlertManager`], 冷却状态不跨摄像头共享。
//! `process` 需要 `&mut self`, 同一去重键的 "检查冷却 → 更新时间戳"
//! 在一次调用内完成, 两个相邻事件不可能同时通过检查。
//! 时间戳先更新再投递, 投递失败不会让下一次事件被当作新告警补发;
//! 未能进入投递队列的告警由 [`DispatchHandle`] 直接写入审计存储。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dispatch::DispatchHandle;
use crate::analysis::activity::{ActivityType, Event, Evidence, ThreatLevel};
use crate::config::AlertConfig;
use crate::detection::types::{CameraId, TrackId};

/// 每处理多少个事件清理一次过期记录
const PURGE_EVERY: u64 = 64;

/// 去重键
///
/// 按轨迹的行为带轨迹ID; 聚集按区域区分; 武器在整个摄像头范围内去重。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DedupKey {
    pub camera_id: CameraId,
    pub activity: ActivityType,
    pub track_id: Option<TrackId>,
    pub zone: Option<String>,
}

impl DedupKey {
    pub fn for_event(event: &Event) -> Self {
        let track_id = if event.activity.track_scoped() {
            event.track_id
        } else {
            None
        };
        let zone = match event.activity {
            ActivityType::CrowdFormation => event.zone.clone(),
            _ => None,
        };
        Self {
            camera_id: event.camera_id.clone(),
            activity: event.activity,
            track_id,
            zone,
        }
    }
}

/// 去重记录 (冷却时长取当前配置, 配置更新立即生效)
#[derive(Clone, Debug)]
pub struct AlertRecord {
    pub key: DedupKey,
    /// 只增不减
    pub last_fired: DateTime<Utc>,
    pub fired: u64,
}

impl AlertRecord {
    fn cooling(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        now - self.last_fired < cooldown
    }
}

/// 告警
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// `{camera}-{activity}-{unix_ms}-{track|na}`
    pub id: String,
    pub camera_id: CameraId,
    pub activity: ActivityType,
    pub threat: ThreatLevel,
    pub timestamp: DateTime<Utc>,
    pub track_id: Option<TrackId>,
    pub zone: Option<String>,
    pub confidence: f32,
    pub description: String,
    pub evidence: Evidence,
}

impl Alert {
    fn from_event(event: &Event) -> Self {
        let track = event
            .track_id
            .map_or_else(|| "na".to_string(), |t| t.to_string());
        Self {
            id: format!(
                "{}-{}-{}-{}",
                event.camera_id,
                event.activity,
                event.timestamp.timestamp_millis(),
                track
            ),
            camera_id: event.camera_id.clone(),
            activity: event.activity,
            threat: event.threat,
            timestamp: event.timestamp,
            track_id: event.track_id,
            zone: event.zone.clone(),
            confidence: event.confidence,
            description: event.description.clone(),
            evidence: event.evidence.clone(),
        }
    }
}

/// 告警统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub emitted: u64,
    pub suppressed: u64,
    /// 未进入投递队列的告警 (已直接写入审计)
    pub dropped: u64,
    /// 未进入投递队列的事件审计记录
    pub events_dropped: u64,
}

/// 单摄像头告警管理器
pub struct AlertManager {
    camera_id: CameraId,
    config: AlertConfig,
    records: HashMap<DedupKey, AlertRecord>,
    dispatch: Option<DispatchHandle>,
    processed: u64,
    stats: AlertStats,
}

impl AlertManager {
    pub fn new(camera_id: impl Into<CameraId>, config: AlertConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            config,
            records: HashMap::new(),
            dispatch: None,
            processed: 0,
            stats: AlertStats::default(),
        }
    }

    /// 告警与事件交给投递线程 (不阻塞)
    pub fn with_dispatch(mut self, dispatch: DispatchHandle) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn set_config(&mut self, config: AlertConfig) {
        self.config = config;
    }

    pub fn stats(&self) -> AlertStats {
        self.stats
    }

    pub fn record(&self, key: &DedupKey) -> Option<&AlertRecord> {
        self.records.get(key)
    }

    /// 事件 → 告警; 冷却期内返回None
    pub fn process(&mut self, event: &Event) -> Option<Alert> {
        let now = event.timestamp;
        self.processed += 1;
        if self.processed % PURGE_EVERY == 0 {
            self.purge(now);
        }

        if let Some(dispatch) = &self.dispatch {
            if let Err(e) = dispatch.record_event(event) {
                self.stats.events_dropped += 1;
                tracing::debug!(camera = %self.camera_id, activity = %event.activity, error = %e, "event audit bypassed dispatch queue");
            }
        }

        let key = DedupKey::for_event(event);
        let cooldown = self.config.cooldown_for(event.activity);
        match self.records.get_mut(&key) {
            Some(record) if record.cooling(now, cooldown) => {
                self.stats.suppressed += 1;
                tracing::debug!(
                    camera = %self.camera_id,
                    activity = %event.activity,
                    track = ?key.track_id,
                    "🔕 alert suppressed by cooldown"
                );
                return None;
            }
            Some(record) => {
                record.last_fired = record.last_fired.max(now);
                record.fired += 1;
            }
            None => {
                self.records.insert(
                    key.clone(),
                    AlertRecord {
                        key,
                        last_fired: now,
                        fired: 1,
                    },
                );
            }
        }

        let alert = Alert::from_event(event);
        self.stats.emitted += 1;
        tracing::warn!(
            camera = %self.camera_id,
            alert = %alert.id,
            threat = %alert.threat,
            "🚨 {}",
            alert.description
        );

        if let Some(dispatch) = &self.dispatch {
            // 冷却照常推进, 告警本身已落审计
            if let Err(e) = dispatch.submit(&alert) {
                self.stats.dropped += 1;
                tracing::warn!(camera = %self.camera_id, alert = %alert.id, error = %e, "⚠️  alert not queued, recorded as delivery failure");
            }
        }
        Some(alert)
    }

    /// 删除冷却已过的记录 (删除与保留对去重结果等价)
    fn purge(&mut self, now: DateTime<Utc>) {
        let before = self.records.len();
        let config = &self.config;
        self.records
            .retain(|key, r| r.cooling(now, config.cooldown_for(key.activity)));
        let purged = before - self.records.len();
        if purged > 0 {
            tracing::debug!(camera = %self.camera_id, purged, "stale alert records purged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::dispatch::{AlertDispatcher, EventStore, LogNotifier, NotifyError, Record};
    use crate::detection::types::Point;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn event(activity: ActivityType, track: Option<TrackId>, at: DateTime<Utc>) -> Event {
        Event {
            activity,
            camera_id: "gate-a".into(),
            track_id: track,
            zone: Some("gate".into()),
            threat: ThreatLevel::High,
            timestamp: at,
            confidence: 0.9,
            description: "Unknown person entered restricted zone gate".into(),
            evidence: Evidence {
                frame_seq: 1,
                captured_at: at,
                location: Point::new(1.0, 2.0),
                bbox: None,
            },
        }
    }

    #[test]
    fn one_alert_per_cooldown_window() {
        let mut mgr = AlertManager::new("gate-a", AlertConfig::default());
        let mut emitted = Vec::new();
        for s in 0..=130 {
            if mgr.process(&event(ActivityType::Loitering, Some(7), t(s))).is_some() {
                emitted.push(s);
            }
        }
        assert_eq!(emitted, vec![0, 60, 120]);
        assert_eq!(mgr.stats().emitted, 3);
        assert_eq!(mgr.stats().suppressed, 128);
    }

    #[test]
    fn simultaneous_events_emit_once() {
        let mut mgr = AlertManager::new("gate-a", AlertConfig::default());
        let e = event(ActivityType::ZoneIntrusion, Some(1), t(0));
        assert!(mgr.process(&e).is_some());
        assert!(mgr.process(&e).is_none());
    }

    #[test]
    fn keys_separate_tracks_but_not_weapons() {
        let mut mgr = AlertManager::new("gate-a", AlertConfig::default());
        assert!(mgr.process(&event(ActivityType::ZoneIntrusion, Some(1), t(0))).is_some());
        assert!(mgr.process(&event(ActivityType::ZoneIntrusion, Some(2), t(0))).is_some());
        assert!(mgr.process(&event(ActivityType::Loitering, Some(1), t(0))).is_some());

        assert!(mgr.process(&event(ActivityType::WeaponDetected, Some(3), t(1))).is_some());
        assert!(mgr.process(&event(ActivityType::WeaponDetected, Some(4), t(2))).is_none());
    }

    #[test]
    fn per_type_cooldown_and_alert_id() {
        let mut config = AlertConfig::default();
        config.cooldowns.insert(ActivityType::WeaponDetected, 5);
        let mut mgr = AlertManager::new("gate-a", config);

        let first = mgr
            .process(&event(ActivityType::WeaponDetected, Some(9), t(0)))
            .unwrap();
        assert_eq!(
            first.id,
            format!("gate-a-weapon_detected-{}-9", t(0).timestamp_millis())
        );
        assert!(mgr.process(&event(ActivityType::WeaponDetected, None, t(4))).is_none());
        let again = mgr
            .process(&event(ActivityType::WeaponDetected, None, t(5)))
            .unwrap();
        assert!(again.id.ends_with("-na"));
    }

    #[test]
    fn last_fired_never_moves_backwards() {
        let mut mgr = AlertManager::new("gate-a", AlertConfig::default());
        mgr.process(&event(ActivityType::Running, Some(1), t(100)));
        // 时钟回拨的事件被冷却挡住, 记录不倒退
        assert!(mgr.process(&event(ActivityType::Running, Some(1), t(10))).is_none());
        let key = DedupKey::for_event(&event(ActivityType::Running, Some(1), t(0)));
        assert_eq!(mgr.record(&key).unwrap().last_fired, t(100));
    }

    #[test]
    fn shortened_cooldown_applies_to_existing_records() {
        let mut mgr = AlertManager::new("gate-a", AlertConfig::default());
        assert!(mgr.process(&event(ActivityType::ZoneIntrusion, Some(1), t(0))).is_some());
        assert!(mgr.process(&event(ActivityType::ZoneIntrusion, Some(1), t(15))).is_none());

        let mut config = AlertConfig::default();
        config.default_cooldown_secs = 10;
        mgr.set_config(config);
        assert!(mgr.process(&event(ActivityType::ZoneIntrusion, Some(1), t(16))).is_some());
    }

    #[test]
    fn crowds_in_different_zones_alert_separately() {
        let mut mgr = AlertManager::new("gate-a", AlertConfig::default());
        let crowd = |zone: &str, at| Event {
            zone: Some(zone.into()),
            ..event(ActivityType::CrowdFormation, None, at)
        };
        assert!(mgr.process(&crowd("lobby", t(0))).is_some());
        assert!(mgr.process(&crowd("platform", t(1))).is_some());
        assert!(mgr.process(&crowd("lobby", t(2))).is_none());
    }

    #[derive(Default)]
    struct Audit(std::sync::Mutex<Vec<Record>>);

    impl EventStore for Audit {
        fn record(&self, record: &Record) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[test]
    fn undeliverable_alert_is_audited_and_cooldown_advances() {
        let audit = Arc::new(Audit::default());
        let dispatcher = AlertDispatcher::spawn(Arc::new(LogNotifier), audit.clone(), 4).unwrap();
        let handle = dispatcher.handle();
        dispatcher.shutdown();

        let mut mgr = AlertManager::new("gate-a", AlertConfig::default()).with_dispatch(handle);
        let alert = mgr
            .process(&event(ActivityType::Loitering, Some(2), t(0)))
            .unwrap();
        assert!(mgr.process(&event(ActivityType::Loitering, Some(2), t(5))).is_none());

        let stats = mgr.stats();
        assert_eq!((stats.emitted, stats.dropped, stats.events_dropped), (1, 1, 2));
        let records = audit.0.lock().unwrap();
        assert!(records.iter().any(|r| matches!(r, Record::Alert(a) if a.id == alert.id)));
        assert!(records
            .iter()
            .any(|r| matches!(r, Record::DeliveryFailed { alert_id, .. } if *alert_id == alert.id)));
        assert_eq!(records.iter().filter(|r| matches!(r, Record::Event(_))).count(), 2);
    }

    #[test]
    fn purge_keeps_dedup_behaviour() {
        let mut mgr = AlertManager::new("gate-a", AlertConfig::default());
        for track in 0..200 {
            mgr.process(&event(ActivityType::ZoneIntrusion, Some(track), t(0)));
        }
        // 冷却过后旧记录被清理, 同一键可再次告警
        for track in 0..PURGE_EVERY {
            mgr.process(&event(ActivityType::Loitering, Some(track), t(61)));
        }
        assert!(mgr.records.len() <= 200);
        assert!(mgr.process(&event(ActivityType::ZoneIntrusion, Some(1), t(62))).is_some());
    }
}
