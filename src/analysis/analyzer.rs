// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 区域行为分析器
//!
//! 每个摄像头一个实例, 按 (摄像头, 轨迹) 维护状态:
//! - 每个区域的进入时间与已触发标记 (离开区域即清除)
//! - 遗留物的静止锚点
//! - 武器只报一次
//!
//! 只有本帧可见的轨迹参与判定; 短暂丢失的轨迹保留状态,
//! 被跟踪器移除后状态一并删除。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use super::activity::{classify_threat, ActivityType, Event, Evidence, ThreatContext};
use super::zone::Zone;
use crate::config::AnalyzerConfig;
use crate::detection::face::Identity;
use crate::detection::tracker::Track;
use crate::detection::types::{CameraId, ObjectClass, Point, TrackId};

/// 跑动判定使用的轨迹点数
const SPEED_SAMPLES: usize = 5;

#[derive(Clone, Debug)]
struct Dwell {
    entered_at: DateTime<Utc>,
    loitering_fired: bool,
    unauthorized_fired: bool,
    running_fired: bool,
}

impl Dwell {
    fn new(entered_at: DateTime<Utc>) -> Self {
        Self {
            entered_at,
            loitering_fired: false,
            unauthorized_fired: false,
            running_fired: false,
        }
    }
}

#[derive(Clone, Debug)]
struct Anchor {
    point: Point,
    since: DateTime<Utc>,
    fired: bool,
}

#[derive(Clone, Debug, Default)]
struct TrackMemory {
    /// 区域名 → 停留状态
    inside: HashMap<String, Dwell>,
    weapon_fired: bool,
    anchor: Option<Anchor>,
}

/// 事件历史 (有界), 克隆后可在其他线程读取
#[derive(Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<VecDeque<Event>>>,
}

impl EventLog {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, event: Event, cap: usize) {
        let mut log = self.lock();
        log.push_back(event);
        while log.len() > cap {
            log.pop_front();
        }
    }

    fn truncate(&self, cap: usize) {
        let mut log = self.lock();
        while log.len() > cap {
            log.pop_front();
        }
    }

    /// 时间戳不早于 `now - window` 的事件
    pub fn recent(&self, now: DateTime<Utc>, window: chrono::Duration) -> Vec<Event> {
        let since = now - window;
        self.lock()
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 一帧的判定输入
struct FrameCtx<'a> {
    frame_seq: u64,
    timestamp: DateTime<Utc>,
    zones: &'a [Zone],
    identities: &'a HashMap<TrackId, Identity>,
}

impl FrameCtx<'_> {
    fn identity(&self, track: TrackId) -> Identity {
        self.identities.get(&track).cloned().unwrap_or_default()
    }

    fn zone_at(&self, p: &Point) -> Option<&Zone> {
        self.zones.iter().find(|z| z.contains(p))
    }
}

/// 区域行为分析器
pub struct ZoneActivityAnalyzer {
    camera_id: CameraId,
    config: AnalyzerConfig,
    memory: HashMap<TrackId, TrackMemory>,
    /// 已触发聚集告警的区域 (人数回落后解除)
    crowded: HashSet<String>,
    history: EventLog,
}

impl ZoneActivityAnalyzer {
    pub fn new(camera_id: impl Into<CameraId>, config: AnalyzerConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            config,
            memory: HashMap::new(),
            crowded: HashSet::new(),
            history: EventLog::default(),
        }
    }

    pub fn set_config(&mut self, config: AnalyzerConfig) {
        self.config = config;
        self.history.truncate(self.config.history_len);
    }

    /// 清空所有轨迹状态 (历史事件保留)
    pub fn reset(&mut self) {
        self.memory.clear();
        self.crowded.clear();
    }

    /// 当前有状态的轨迹数
    pub fn tracked(&self) -> usize {
        self.memory.len()
    }

    /// 分析一帧, 返回新产生的事件
    pub fn analyze(
        &mut self,
        tracks: &[Track],
        identities: &HashMap<TrackId, Identity>,
        zones: &[Zone],
        frame_seq: u64,
        timestamp: DateTime<Utc>,
    ) -> Vec<Event> {
        let ctx = FrameCtx {
            frame_seq,
            timestamp,
            zones,
            identities,
        };

        let live: HashSet<TrackId> = tracks.iter().map(|t| t.id).collect();
        self.memory.retain(|id, _| live.contains(id));

        let zone_names: HashSet<&str> = zones.iter().map(|z| z.name.as_str()).collect();
        for mem in self.memory.values_mut() {
            mem.inside.retain(|name, _| zone_names.contains(name.as_str()));
        }
        self.crowded.retain(|name| zone_names.contains(name.as_str()));

        let visible: Vec<&Track> = tracks.iter().filter(|t| t.is_visible()).collect();
        let persons: Vec<&Track> = visible.iter().copied().filter(|t| t.is_person()).collect();

        let mut events = Vec::new();
        for track in &visible {
            match track.class {
                ObjectClass::Person => self.check_person(track, &ctx, &mut events),
                ObjectClass::Bag => self.check_unattended(track, &persons, &ctx, &mut events),
                ObjectClass::Weapon => self.check_weapon(track, &ctx, &mut events),
            }
        }
        self.check_crowds(&persons, &ctx, &mut events);

        for event in &events {
            tracing::info!(
                camera = %self.camera_id,
                activity = %event.activity,
                track = ?event.track_id,
                zone = ?event.zone,
                threat = %event.threat,
                "{} {}",
                event.threat.icon(),
                event.description
            );
            self.history.push(event.clone(), self.config.history_len);
        }
        events
    }

    fn check_person(&mut self, track: &Track, ctx: &FrameCtx<'_>, events: &mut Vec<Event>) {
        let identity = ctx.identity(track.id);
        // None: 身份无法核验, 不判定为未授权
        let authorized = identity.authorization();
        let centroid = track.centroid();
        let speed = track.speed(SPEED_SAMPLES);
        let loitering_secs = self.config.loitering_secs;
        let running_speed = self.config.running_speed_px_per_sec;

        let mem = self.memory.entry(track.id).or_default();
        for zone in ctx.zones {
            if !zone.contains(&centroid) {
                // 离开区域: 停留计时与触发标记清零
                mem.inside.remove(&zone.name);
                continue;
            }

            let entered = !mem.inside.contains_key(&zone.name);
            let dwell = mem
                .inside
                .entry(zone.name.clone())
                .or_insert_with(|| Dwell::new(ctx.timestamp));

            if entered && zone.is_restricted() && zone.subscribes(ActivityType::ZoneIntrusion) {
                events.push(person_event(
                    &self.camera_id,
                    ActivityType::ZoneIntrusion,
                    track,
                    zone,
                    authorized,
                    ctx,
                    format!("{} entered restricted zone {}", identity.label(), zone.name),
                ));
            }

            if zone.is_restricted()
                && zone.subscribes(ActivityType::UnauthorizedPerson)
                && authorized == Some(false)
                && !dwell.unauthorized_fired
            {
                dwell.unauthorized_fired = true;
                events.push(person_event(
                    &self.camera_id,
                    ActivityType::UnauthorizedPerson,
                    track,
                    zone,
                    authorized,
                    ctx,
                    format!("{} present in restricted zone {}", identity.label(), zone.name),
                ));
            }

            let secs = seconds_between(dwell.entered_at, ctx.timestamp);
            if zone.subscribes(ActivityType::Loitering)
                && !dwell.loitering_fired
                && secs >= loitering_secs
            {
                dwell.loitering_fired = true;
                events.push(person_event(
                    &self.camera_id,
                    ActivityType::Loitering,
                    track,
                    zone,
                    authorized,
                    ctx,
                    format!("{} loitering in {} for {:.0}s", identity.label(), zone.name, secs),
                ));
            }

            if zone.subscribes(ActivityType::Running) {
                match speed {
                    Some(v) if v > running_speed => {
                        if !dwell.running_fired {
                            dwell.running_fired = true;
                            events.push(person_event(
                                &self.camera_id,
                                ActivityType::Running,
                                track,
                                zone,
                                authorized,
                                ctx,
                                format!("{} running at {:.0} px/s in {}", identity.label(), v, zone.name),
                            ));
                        }
                    }
                    _ => dwell.running_fired = false,
                }
            }
        }
    }

    fn check_unattended(
        &mut self,
        track: &Track,
        persons: &[&Track],
        ctx: &FrameCtx<'_>,
        events: &mut Vec<Event>,
    ) {
        let centroid = track.centroid();
        let cfg = &self.config;
        let attended = persons
            .iter()
            .any(|p| p.centroid().distance(&centroid) <= cfg.abandoned_person_radius_px);

        let mem = self.memory.entry(track.id).or_default();
        let anchor = mem.anchor.get_or_insert_with(|| Anchor {
            point: centroid,
            since: ctx.timestamp,
            fired: false,
        });

        // 移动超出漂移范围或有人在旁: 重新计时
        if anchor.point.distance(&centroid) > cfg.abandoned_drift_px {
            *anchor = Anchor {
                point: centroid,
                since: ctx.timestamp,
                fired: false,
            };
            return;
        }
        if attended {
            anchor.since = ctx.timestamp;
            anchor.fired = false;
            return;
        }

        let secs = seconds_between(anchor.since, ctx.timestamp);
        if anchor.fired || secs < cfg.abandoned_secs {
            return;
        }
        anchor.fired = true;

        let zone = ctx.zone_at(&centroid);
        let where_ = zone.map_or_else(String::new, |z| format!(" in {}", z.name));
        events.push(build_event(
            &self.camera_id,
            ActivityType::AbandonedObject,
            Some(track.id),
            zone,
            None,
            track.confidence,
            ctx,
            centroid,
            Some(track),
            format!("Unattended {} for {:.0}s{}", track.label, secs, where_),
        ));
    }

    fn check_weapon(&mut self, track: &Track, ctx: &FrameCtx<'_>, events: &mut Vec<Event>) {
        let mem = self.memory.entry(track.id).or_default();
        if mem.weapon_fired {
            return;
        }
        mem.weapon_fired = true;

        let centroid = track.centroid();
        let zone = ctx.zone_at(&centroid);
        events.push(build_event(
            &self.camera_id,
            ActivityType::WeaponDetected,
            Some(track.id),
            zone,
            None,
            track.confidence,
            ctx,
            centroid,
            Some(track),
            format!("Weapon detected: {}", track.label),
        ));
    }

    fn check_crowds(&mut self, persons: &[&Track], ctx: &FrameCtx<'_>, events: &mut Vec<Event>) {
        for zone in ctx
            .zones
            .iter()
            .filter(|z| z.subscribes(ActivityType::CrowdFormation))
        {
            let members: Vec<&Track> = persons
                .iter()
                .copied()
                .filter(|t| zone.contains(&t.centroid()))
                .collect();

            if members.len() < self.config.crowd_threshold {
                self.crowded.remove(&zone.name);
                continue;
            }
            if !self.crowded.insert(zone.name.clone()) {
                continue;
            }

            let n = members.len() as f32;
            let center = Point::new(
                members.iter().map(|t| t.centroid().x).sum::<f32>() / n,
                members.iter().map(|t| t.centroid().y).sum::<f32>() / n,
            );
            let confidence = members.iter().map(|t| t.confidence).sum::<f32>() / n;
            events.push(build_event(
                &self.camera_id,
                ActivityType::CrowdFormation,
                None,
                Some(zone),
                None,
                confidence,
                ctx,
                center,
                None,
                format!("{} people gathered in {}", members.len(), zone.name),
            ));
        }
    }

    /// 最近 `window` 内的事件
    pub fn recent(&self, now: DateTime<Utc>, window: chrono::Duration) -> Vec<Event> {
        self.history.recent(now, window)
    }

    /// 共享的事件历史句柄
    pub fn history(&self) -> EventLog {
        self.history.clone()
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn person_event(
    camera: &CameraId,
    activity: ActivityType,
    track: &Track,
    zone: &Zone,
    authorized: Option<bool>,
    ctx: &FrameCtx<'_>,
    description: String,
) -> Event {
    build_event(
        camera,
        activity,
        Some(track.id),
        Some(zone),
        authorized,
        track.confidence,
        ctx,
        track.centroid(),
        Some(track),
        description,
    )
}

#[allow(clippy::too_many_arguments)]
fn build_event(
    camera: &CameraId,
    activity: ActivityType,
    track_id: Option<TrackId>,
    zone: Option<&Zone>,
    authorized: Option<bool>,
    confidence: f32,
    ctx: &FrameCtx<'_>,
    location: Point,
    track: Option<&Track>,
    description: String,
) -> Event {
    let threat = classify_threat(
        activity,
        ThreatContext {
            zone_type: zone.map(|z| z.zone_type),
            authorized,
        },
    );
    Event {
        activity,
        camera_id: camera.clone(),
        track_id,
        zone: zone.map(|z| z.name.clone()),
        threat,
        timestamp: ctx.timestamp,
        confidence,
        description,
        evidence: Evidence {
            frame_seq: ctx.frame_seq,
            captured_at: ctx.timestamp,
            location,
            bbox: track.map(|t| t.bbox),
        },
    }
}
