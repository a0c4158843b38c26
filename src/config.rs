// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 监控系统配置 - 通过JSON文件调整参数
//!
//! 所有阈值、区域与人脸库都在这里定义并校验。非法配置在 [`ConfigStore`]
//! 边界被拒绝, 分析器永远拿不到不合法的区域或阈值。

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::analysis::activity::ActivityType;
use crate::analysis::zone::Zone;
use crate::detection::face::Gallery;
use crate::detection::types::{CameraId, ObjectClass};

/// 默认类别映射 (COCO标签 → 关注类别)
pub static DEFAULT_CLASSES: Lazy<BTreeMap<String, ObjectClass>> = Lazy::new(|| {
    [
        ("person", ObjectClass::Person),
        ("backpack", ObjectClass::Bag),
        ("handbag", ObjectClass::Bag),
        ("suitcase", ObjectClass::Bag),
        ("knife", ObjectClass::Weapon),
        ("baseball bat", ObjectClass::Weapon),
        ("scissors", ObjectClass::Weapon),
    ]
    .into_iter()
    .map(|(label, class)| (label.to_string(), class))
    .collect()
});

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid threshold `{name}`: {reason}")]
    InvalidThreshold { name: &'static str, reason: String },

    #[error("camera `{camera}` zone `{zone}`: {reason}")]
    InvalidZone {
        camera: CameraId,
        zone: String,
        reason: String,
    },

    #[error("invalid camera: {0}")]
    InvalidCamera(String),

    #[error("invalid gallery: {0}")]
    InvalidGallery(String),
}

// ========== 各部分参数 ==========

/// 摄像头
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    /// 源地址 (rtsp://, /dev/video0, synthetic://...)
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl CameraConfig {
    pub fn new(id: impl Into<CameraId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            enabled: true,
        }
    }
}

/// 检测参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub confidence_threshold: f32, // 检测置信度阈值
    pub nms_iou_threshold: f32,    // NMS IOU阈值
    /// 模型标签 → 关注类别, 未列出的标签丢弃
    pub classes: BTreeMap<String, ObjectClass>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_iou_threshold: 0.4,
            classes: (*DEFAULT_CLASSES).clone(),
        }
    }
}

/// 跟踪参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub match_iou_threshold: f32, // 最小匹配IOU
    pub confirm_hits: u32,        // 连续命中多少帧转为Confirmed
    pub tentative_grace_frames: u32, // Tentative 允许连续未匹配的帧数 (检测闪烁)
    pub lost_after_frames: u32,   // 连续未匹配多少帧转为Lost
    pub remove_after_frames: u32, // 连续未匹配多少帧移除
    pub history_len: usize,       // 轨迹点环形缓冲长度
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_iou_threshold: 0.3,
            confirm_hits: 3,
            tentative_grace_frames: 3,
            lost_after_frames: 10,
            remove_after_frames: 30,
            history_len: 30,
        }
    }
}

/// 人脸识别参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    pub authorization_threshold: f32, // 授权相似度阈值
    pub ambiguity_margin: f32,        // 前两名最小差距
    pub borderline_band: f32,         // 阈值下方的临界区宽度
    pub no_face_grace_frames: u32,    // 未检测到人脸时保留身份的帧数
    pub borderline_grace_frames: u32, // 临界分数时保留身份的帧数
    pub recognition_interval_frames: u32, // 每个轨迹的识别间隔
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            authorization_threshold: 0.70,
            ambiguity_margin: 0.08,
            borderline_band: 0.05,
            no_face_grace_frames: 10,
            borderline_grace_frames: 3,
            recognition_interval_frames: 5,
        }
    }
}

/// 行为分析参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub loitering_secs: f64,
    pub abandoned_secs: f64,
    pub abandoned_drift_px: f32,
    pub abandoned_person_radius_px: f32,
    pub running_speed_px_per_sec: f32,
    pub crowd_threshold: usize,
    pub history_len: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            loitering_secs: 30.0,
            abandoned_secs: 60.0,
            abandoned_drift_px: 30.0,
            abandoned_person_radius_px: 150.0,
            running_speed_px_per_sec: 150.0,
            crowd_threshold: 5,
            history_len: 1000,
        }
    }
}

/// 告警参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub default_cooldown_secs: u64,
    /// 按行为类型覆盖冷却时间
    pub cooldowns: BTreeMap<ActivityType, u64>,
    pub dispatch_queue: usize,
    pub notify_retries: u32,
    pub notify_backoff_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            default_cooldown_secs: 60,
            cooldowns: BTreeMap::new(),
            dispatch_queue: 256,
            notify_retries: 3,
            notify_backoff_ms: 200,
        }
    }
}

impl AlertConfig {
    pub fn cooldown_for(&self, activity: ActivityType) -> chrono::Duration {
        let secs = self
            .cooldowns
            .get(&activity)
            .copied()
            .unwrap_or(self.default_cooldown_secs);
        chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64)
    }
}

/// 摄像头流水线参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_queue: usize,       // 采集→处理队列长度 (满时丢最旧帧)
    pub read_timeout_ms: u64,     // 读帧超时, 超时进入重连
    pub state_grace_secs: u64,    // 断线多久以内保留跟踪状态
    pub frame_skip: u32,          // 每N帧分析一帧
    pub stats_every_frames: u64,  // 吞吐日志间隔
    pub feed_capacity: usize,     // 事件订阅通道容量
    pub inference_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue: 8,
            read_timeout_ms: 3000,
            state_grace_secs: 10,
            frame_skip: 1,
            stats_every_frames: 300,
            feed_capacity: 1024,
            inference_timeout_ms: 5000,
        }
    }
}

impl PipelineConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn state_grace(&self) -> Duration {
        Duration::from_secs(self.state_grace_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }
}

/// 重连退避参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub max_retries: u32,
    pub jitter: f64, // 0.1 = ±10%
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
            max_retries: 10,
            jitter: 0.1,
        }
    }
}

/// 运行时可热更新的阈值集合
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub face: FaceConfig,
    pub analyzer: AnalyzerConfig,
    pub alerts: AlertConfig,
}

/// 人脸库来源: 文件路径或内联
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GallerySource {
    Path(PathBuf),
    Inline(Gallery),
}

/// 完整配置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveillanceConfig {
    pub cameras: Vec<CameraConfig>,
    #[serde(flatten)]
    pub thresholds: Thresholds,
    pub pipeline: PipelineConfig,
    pub reconnect: ReconnectConfig,
    /// 摄像头ID → 区域列表
    pub zones: BTreeMap<CameraId, Vec<Zone>>,
    pub gallery: Option<GallerySource>,
}

// ========== 校验 ==========

fn unit_interval(name: &'static str, v: f32) -> Result<(), ConfigError> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold {
            name,
            reason: format!("{} is outside [0, 1]", v),
        })
    }
}

fn positive<T: PartialOrd + Default + std::fmt::Display>(
    name: &'static str,
    v: T,
) -> Result<(), ConfigError> {
    if v > T::default() {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold {
            name,
            reason: format!("{} must be positive", v),
        })
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        unit_interval("detector.confidence_threshold", d.confidence_threshold)?;
        unit_interval("detector.nms_iou_threshold", d.nms_iou_threshold)?;
        if d.classes.is_empty() {
            return Err(ConfigError::InvalidThreshold {
                name: "detector.classes",
                reason: "no class of interest configured".into(),
            });
        }

        let t = &self.tracker;
        unit_interval("tracker.match_iou_threshold", t.match_iou_threshold)?;
        positive("tracker.confirm_hits", t.confirm_hits)?;
        positive("tracker.lost_after_frames", t.lost_after_frames)?;
        positive("tracker.history_len", t.history_len)?;
        if t.remove_after_frames < t.lost_after_frames {
            return Err(ConfigError::InvalidThreshold {
                name: "tracker.remove_after_frames",
                reason: format!(
                    "{} is below lost_after_frames {}",
                    t.remove_after_frames, t.lost_after_frames
                ),
            });
        }
        if t.tentative_grace_frames > t.lost_after_frames {
            return Err(ConfigError::InvalidThreshold {
                name: "tracker.tentative_grace_frames",
                reason: format!(
                    "{} exceeds lost_after_frames {}",
                    t.tentative_grace_frames, t.lost_after_frames
                ),
            });
        }

        let f = &self.face;
        unit_interval("face.authorization_threshold", f.authorization_threshold)?;
        unit_interval("face.ambiguity_margin", f.ambiguity_margin)?;
        unit_interval("face.borderline_band", f.borderline_band)?;
        positive("face.recognition_interval_frames", f.recognition_interval_frames)?;

        let a = &self.analyzer;
        positive("analyzer.loitering_secs", a.loitering_secs)?;
        positive("analyzer.abandoned_secs", a.abandoned_secs)?;
        positive("analyzer.abandoned_drift_px", a.abandoned_drift_px)?;
        positive("analyzer.abandoned_person_radius_px", a.abandoned_person_radius_px)?;
        positive("analyzer.running_speed_px_per_sec", a.running_speed_px_per_sec)?;
        positive("analyzer.crowd_threshold", a.crowd_threshold)?;
        positive("analyzer.history_len", a.history_len)?;

        positive("alerts.dispatch_queue", self.alerts.dispatch_queue)?;
        Ok(())
    }
}

/// 校验单个摄像头的区域列表 (名称唯一, 多边形合法)
pub fn validate_zones(camera: &str, zones: &[Zone]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for zone in zones {
        zone.validate().map_err(|reason| ConfigError::InvalidZone {
            camera: camera.to_string(),
            zone: zone.name.clone(),
            reason,
        })?;
        if !names.insert(zone.name.as_str()) {
            return Err(ConfigError::InvalidZone {
                camera: camera.to_string(),
                zone: zone.name.clone(),
                reason: "duplicate zone name".into(),
            });
        }
    }
    Ok(())
}

impl SurveillanceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for cam in &self.cameras {
            if cam.id.trim().is_empty() {
                return Err(ConfigError::InvalidCamera("empty camera id".into()));
            }
            if !ids.insert(cam.id.as_str()) {
                return Err(ConfigError::InvalidCamera(format!("duplicate id `{}`", cam.id)));
            }
        }

        self.thresholds.validate()?;

        let p = &self.pipeline;
        positive("pipeline.frame_queue", p.frame_queue)?;
        positive("pipeline.read_timeout_ms", p.read_timeout_ms)?;
        positive("pipeline.frame_skip", p.frame_skip)?;
        positive("pipeline.feed_capacity", p.feed_capacity)?;
        positive("pipeline.inference_timeout_ms", p.inference_timeout_ms)?;

        let r = &self.reconnect;
        positive("reconnect.initial_ms", r.initial_ms)?;
        if r.max_ms < r.initial_ms {
            return Err(ConfigError::InvalidThreshold {
                name: "reconnect.max_ms",
                reason: format!("{} is below initial_ms {}", r.max_ms, r.initial_ms),
            });
        }
        if !(r.multiplier.is_finite() && r.multiplier >= 1.0) {
            return Err(ConfigError::InvalidThreshold {
                name: "reconnect.multiplier",
                reason: format!("{} must be >= 1", r.multiplier),
            });
        }
        if !(r.jitter.is_finite() && (0.0..1.0).contains(&r.jitter)) {
            return Err(ConfigError::InvalidThreshold {
                name: "reconnect.jitter",
                reason: format!("{} is outside [0, 1)", r.jitter),
            });
        }

        for (camera, zones) in &self.zones {
            if !ids.contains(camera.as_str()) {
                return Err(ConfigError::InvalidCamera(format!(
                    "zones configured for unknown camera `{}`",
                    camera
                )));
            }
            validate_zones(camera, zones)?;
        }

        if let Some(GallerySource::Inline(gallery)) = &self.gallery {
            gallery.validate().map_err(ConfigError::InvalidGallery)?;
        }
        Ok(())
    }

    pub fn zones_for(&self, camera: &str) -> Vec<Zone> {
        self.zones.get(camera).cloned().unwrap_or_default()
    }

    /// 从JSON文件加载并校验
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::info!(path = %path.display(), cameras = config.cameras.len(), "✅ config loaded");
        Ok(config)
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        let t = &self.thresholds;
        tracing::info!(
            confidence = t.detector.confidence_threshold,
            nms_iou = t.detector.nms_iou_threshold,
            match_iou = t.tracker.match_iou_threshold,
            auth = t.face.authorization_threshold,
            loitering_secs = t.analyzer.loitering_secs,
            cooldown_secs = t.alerts.default_cooldown_secs,
            "🎛️  active thresholds"
        );
        for cam in &self.cameras {
            let zones = self.zones.get(&cam.id).map_or(0, Vec::len);
            tracing::info!(camera = %cam.id, url = %cam.url, enabled = cam.enabled, zones, "📹 camera configured");
        }
    }
}

pub(crate) fn load_gallery_file(path: &Path) -> Result<Gallery, ConfigError> {
    let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let gallery: Gallery = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    gallery.validate().map_err(ConfigError::InvalidGallery)?;
    Ok(gallery)
}

// ========== 配置存储 ==========

/// 配置变更通知
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigUpdate {
    Zones { camera_id: CameraId, zones: Vec<Zone> },
    Thresholds(Box<Thresholds>),
    Gallery(Gallery),
}

impl ConfigUpdate {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ConfigUpdate::Zones { camera_id, zones } => validate_zones(camera_id, zones),
            ConfigUpdate::Thresholds(t) => t.validate(),
            ConfigUpdate::Gallery(g) => g.validate().map_err(ConfigError::InvalidGallery),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConfigUpdate::Zones { .. } => "zones",
            ConfigUpdate::Thresholds(_) => "thresholds",
            ConfigUpdate::Gallery(_) => "gallery",
        }
    }
}

/// 外部配置存储
///
/// 只有校验通过的更新会推送给订阅者。
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<SurveillanceConfig, ConfigError>;

    fn load_gallery(&self) -> Result<Gallery, ConfigError>;

    fn subscribe(&self) -> Receiver<ConfigUpdate>;
}

#[derive(Default)]
struct Subscribers {
    senders: Mutex<Vec<Sender<ConfigUpdate>>>,
}

impl Subscribers {
    fn subscribe(&self) -> Receiver<ConfigUpdate> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn broadcast(&self, update: &ConfigUpdate) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

fn apply_to(config: &mut SurveillanceConfig, gallery: &mut Gallery, update: &ConfigUpdate) {
    match update {
        ConfigUpdate::Zones { camera_id, zones } => {
            config.zones.insert(camera_id.clone(), zones.clone());
        }
        ConfigUpdate::Thresholds(t) => config.thresholds = (**t).clone(),
        ConfigUpdate::Gallery(g) => *gallery = g.clone(),
    }
}

/// 内存配置存储 (测试与嵌入方使用)
pub struct MemoryConfigStore {
    state: Mutex<(SurveillanceConfig, Gallery)>,
    subscribers: Subscribers,
}

impl MemoryConfigStore {
    pub fn new(config: SurveillanceConfig, gallery: Gallery) -> Result<Self, ConfigError> {
        config.validate()?;
        gallery.validate().map_err(ConfigError::InvalidGallery)?;
        Ok(Self {
            state: Mutex::new((config, gallery)),
            subscribers: Subscribers::default(),
        })
    }

    /// 校验并发布更新; 非法更新直接返回错误, 订阅者收不到
    pub fn publish(&self, update: ConfigUpdate) -> Result<(), ConfigError> {
        update.validate()?;
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let (config, gallery) = &mut *state;
            if let ConfigUpdate::Zones { camera_id, .. } = &update {
                if !config.cameras.iter().any(|c| &c.id == camera_id) {
                    return Err(ConfigError::InvalidCamera(format!(
                        "unknown camera `{}`",
                        camera_id
                    )));
                }
            }
            apply_to(config, gallery, &update);
        }
        tracing::info!(kind = update.kind(), "🔄 config update published");
        self.subscribers.broadcast(&update);
        Ok(())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<SurveillanceConfig, ConfigError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .clone())
    }

    fn load_gallery(&self) -> Result<Gallery, ConfigError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .1
            .clone())
    }

    fn subscribe(&self) -> Receiver<ConfigUpdate> {
        self.subscribers.subscribe()
    }
}

/// JSON文件配置存储
///
/// `reload()` 重新读取文件, 与上次内容比较后只推送有变化的部分。
pub struct JsonConfigStore {
    path: PathBuf,
    last: Mutex<Option<(SurveillanceConfig, Gallery)>>,
    subscribers: Subscribers,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: Mutex::new(None),
            subscribers: Subscribers::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<(SurveillanceConfig, Gallery), ConfigError> {
        let config = SurveillanceConfig::load(&self.path)?;
        let gallery = match &config.gallery {
            None => Gallery::default(),
            Some(GallerySource::Inline(g)) => g.clone(),
            Some(GallerySource::Path(p)) => {
                let resolved = if p.is_relative() {
                    self.path
                        .parent()
                        .map_or_else(|| p.clone(), |dir| dir.join(p))
                } else {
                    p.clone()
                };
                load_gallery_file(&resolved)?
            }
        };
        Ok((config, gallery))
    }

    /// 重新加载并推送变更, 返回推送的更新数
    pub fn reload(&self) -> Result<usize, ConfigError> {
        let (config, gallery) = self.read()?;
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        let mut updates = Vec::new();
        if let Some((old, old_gallery)) = last.as_ref() {
            if old.thresholds != config.thresholds {
                updates.push(ConfigUpdate::Thresholds(Box::new(config.thresholds.clone())));
            }
            for cam in &config.cameras {
                let new_zones = config.zones_for(&cam.id);
                if old.zones_for(&cam.id) != new_zones {
                    updates.push(ConfigUpdate::Zones {
                        camera_id: cam.id.clone(),
                        zones: new_zones,
                    });
                }
            }
            if old_gallery != &gallery {
                updates.push(ConfigUpdate::Gallery(gallery.clone()));
            }
        }
        *last = Some((config, gallery));
        drop(last);

        for update in &updates {
            tracing::info!(path = %self.path.display(), kind = update.kind(), "🔄 config change detected");
            self.subscribers.broadcast(update);
        }
        Ok(updates.len())
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<SurveillanceConfig, ConfigError> {
        let (config, gallery) = self.read()?;
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((config.clone(), gallery));
        Ok(config)
    }

    fn load_gallery(&self) -> Result<Gallery, ConfigError> {
        Ok(self.read()?.1)
    }

    fn subscribe(&self) -> Receiver<ConfigUpdate> {
        self.subscribers.subscribe()
    }
}
