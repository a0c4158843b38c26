// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 集成测试公共工具: 合成帧源 + 回放检测 + 内存配置
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::Receiver;
use image::RgbImage;
use ndarray::Array1;

use sentinel_rs::alert::{Alert, EventStore, NotifyError, Record};
use sentinel_rs::analysis::{ActivityType, Event, Zone, ZoneType};
use sentinel_rs::config::{
    CameraConfig, MemoryConfigStore, PipelineConfig, ReconnectConfig, SurveillanceConfig,
};
use sentinel_rs::detection::{BBox, Frame, Gallery};
use sentinel_rs::input::{FrameSource, FrameStream, ReadOutcome, SourceError, SyntheticSource};
use sentinel_rs::models::{FaceModel, FaceRegion, ModelError, ReplayModel, ReplayScript};
use sentinel_rs::pipeline::{CameraState, PipelineEvent, SurveillanceManager, SurveillanceManagerBuilder};

pub const WIDTH: u32 = 1280;
pub const HEIGHT: u32 = 720;
pub const FPS: f64 = 10.0;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

/// 覆盖整帧的禁区
pub fn gate_zone() -> Zone {
    Zone::rect(
        "Gate A",
        0.0,
        0.0,
        WIDTH as f32,
        HEIGHT as f32,
        ZoneType::Restricted,
        [
            ActivityType::ZoneIntrusion,
            ActivityType::UnauthorizedPerson,
            ActivityType::Loitering,
        ],
    )
}

pub fn config(with_zone: bool) -> SurveillanceConfig {
    let mut zones = BTreeMap::new();
    if with_zone {
        zones.insert("gate-a".to_string(), vec![gate_zone()]);
    }
    SurveillanceConfig {
        cameras: vec![CameraConfig::new("gate-a", "synthetic://gate-a")],
        pipeline: PipelineConfig {
            // 足够大, 回放过程中不丢帧
            frame_queue: 4096,
            stats_every_frames: 100,
            ..Default::default()
        },
        reconnect: ReconnectConfig {
            initial_ms: 10,
            max_ms: 40,
            multiplier: 2.0,
            max_retries: 3,
            jitter: 0.0,
        },
        zones,
        ..Default::default()
    }
}

/// 一个静止人员, 位于画面中央
pub fn person_script(from: u64, to: u64) -> String {
    format!(
        r#"{{"camera":"gate-a","from":{},"to":{},"detections":[{{"label":"person","confidence":0.9,"bbox":{{"x1":600,"y1":300,"x2":680,"y2":500}}}}]}}"#,
        from, to
    )
}

pub fn source() -> SyntheticSource {
    SyntheticSource::new(WIDTH, HEIGHT, FPS).with_start(start_time())
}

pub fn builder(
    store: Arc<MemoryConfigStore>,
    source: SyntheticSource,
    script: &str,
) -> SurveillanceManagerBuilder {
    builder_with(store, Arc::new(source), script)
}

pub fn builder_with(
    store: Arc<MemoryConfigStore>,
    source: Arc<dyn FrameSource>,
    script: &str,
) -> SurveillanceManagerBuilder {
    let script = ReplayScript::parse(script).unwrap();
    SurveillanceManager::builder(store)
        .source(source)
        .object_model(Box::new(ReplayModel::new(script)))
}

/// 按连接回放指定的 (序号, 毫秒偏移) 帧
///
/// 每次 open 消耗一段; 非最后一段读完后返回读错误, 最后一段返回流结束。
pub struct SessionSource {
    sessions: Mutex<VecDeque<Vec<(u64, i64)>>>,
}

impl SessionSource {
    pub fn new(sessions: Vec<Vec<(u64, i64)>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
        }
    }
}

impl FrameSource for SessionSource {
    fn open(&self, camera_id: &str, url: &str) -> Result<Box<dyn FrameStream>, SourceError> {
        let mut sessions = self.sessions.lock().unwrap();
        let frames = sessions.pop_front().ok_or_else(|| SourceError::Open {
            url: url.to_string(),
            reason: "no more sessions".into(),
        })?;
        Ok(Box::new(SessionStream {
            camera_id: camera_id.to_string(),
            frames: frames.into(),
            last: sessions.is_empty(),
        }))
    }
}

struct SessionStream {
    camera_id: String,
    frames: VecDeque<(u64, i64)>,
    last: bool,
}

impl FrameStream for SessionStream {
    fn read(&mut self) -> Result<ReadOutcome, SourceError> {
        match self.frames.pop_front() {
            Some((seq, offset_ms)) => Ok(ReadOutcome::Frame(Frame::blank(
                self.camera_id.as_str(),
                seq,
                start_time() + chrono::Duration::milliseconds(offset_ms),
                WIDTH,
                HEIGHT,
            ))),
            None if self.last => Ok(ReadOutcome::EndOfStream),
            None => Err(SourceError::Read("connection reset".into())),
        }
    }
}

/// 任何人脸都映射到固定特征
pub struct FixedFace(pub Array1<f32>);

impl FaceModel for FixedFace {
    fn name(&self) -> &str {
        "fixed-face"
    }

    fn detect_faces(&mut self, crop: &RgbImage) -> Result<Vec<FaceRegion>, ModelError> {
        let (w, h) = crop.dimensions();
        Ok(vec![FaceRegion {
            bbox: BBox::new(0.0, 0.0, w as f32, (h / 3) as f32),
            score: 0.95,
        }])
    }

    fn embed(&mut self, _face: &RgbImage) -> Result<Array1<f32>, ModelError> {
        Ok(self.0.clone())
    }
}

pub fn store(config: SurveillanceConfig) -> Arc<MemoryConfigStore> {
    Arc::new(MemoryConfigStore::new(config, Gallery::default()).unwrap())
}

/// feed 中的消息分类
#[derive(Default)]
pub struct Collected {
    pub events: Vec<Event>,
    pub alerts: Vec<Alert>,
    pub states: Vec<CameraState>,
}

impl Collected {
    pub fn events_of(&self, activity: ActivityType) -> Vec<&Event> {
        self.events.iter().filter(|e| e.activity == activity).collect()
    }

    pub fn alerts_of(&self, activity: ActivityType) -> Vec<&Alert> {
        self.alerts.iter().filter(|a| a.activity == activity).collect()
    }
}

pub fn drain(feed: &Receiver<PipelineEvent>) -> Collected {
    let mut out = Collected::default();
    for msg in feed.try_iter() {
        match msg {
            PipelineEvent::Event(e) => out.events.push(e),
            PipelineEvent::Alert(a) => out.alerts.push(a),
            PipelineEvent::StateChanged { state, .. } => out.states.push(state),
        }
    }
    out
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// 收集全部审计记录
#[derive(Default)]
pub struct CollectStore {
    pub records: Mutex<Vec<Record>>,
}

impl EventStore for CollectStore {
    fn record(&self, record: &Record) -> Result<(), NotifyError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
