// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 监控流水线 (Surveillance Pipeline)
///
/// 每路摄像头两个线程, 通过有界丢旧帧队列通信:
/// - Reader:   读帧 (阻塞在外部帧源上)
/// - Camera:   检测 → 跟踪 → 身份 → 行为分析 → 告警
///
/// 模型推理经 ModelWorker 在所有摄像头间串行化,
/// 告警投递在独立的 AlertDispatcher 线程完成。
pub mod camera;
pub mod manager;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alert::{Alert, AlertStats};
use crate::analysis::{Event, Zone};
use crate::config::{ConfigError, ConfigUpdate, SurveillanceConfig, Thresholds};
use crate::detection::face::{FaceCapability, Gallery};
use crate::detection::types::CameraId;

pub use camera::{CameraPipeline, PipelineParts};
pub use manager::{Capabilities, ManagerError, StartupError, SurveillanceManager, SurveillanceManagerBuilder};

// ========== 状态与统计 ==========

/// 摄像头状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Starting,
    Running,
    Reconnecting,
    Stopped,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CameraState::Starting => "starting",
            CameraState::Running => "running",
            CameraState::Reconnecting => "reconnecting",
            CameraState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// 吞吐统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CameraStats {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,     // 队列满丢弃
    pub frames_out_of_order: u64,
    pub frames_skipped: u64,     // frame_skip 跳过
    pub detection_failures: u64,
    pub events: u64,
    pub reconnects: u64,
    pub active_tracks: usize,
    pub fps: f64,
    pub inference_ms: f64,
}

/// 摄像头状态快照 (status 查询返回)
#[derive(Clone, Debug, Serialize)]
pub struct CameraStatus {
    pub camera_id: CameraId,
    pub state: CameraState,
    /// 超出重连预算后为 false
    pub online: bool,
    pub since: DateTime<Utc>,
    pub last_error: Option<String>,
    pub face: FaceCapability,
    pub stats: CameraStats,
    pub alerts: AlertStats,
}

impl CameraStatus {
    pub fn new(camera_id: impl Into<CameraId>, face: FaceCapability) -> Self {
        Self {
            camera_id: camera_id.into(),
            state: CameraState::Starting,
            online: true,
            since: Utc::now(),
            last_error: None,
            face,
            stats: CameraStats::default(),
            alerts: AlertStats::default(),
        }
    }
}

// ========== 事件订阅 ==========

/// 流水线对外推送的消息 (feed)
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged {
        camera_id: CameraId,
        state: CameraState,
        at: DateTime<Utc>,
    },
    Event(Event),
    Alert(Alert),
}

// ========== 配置快照 ==========

/// 一致的配置视图, 流水线每帧开头读取一次
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub thresholds: Arc<Thresholds>,
    pub zones: BTreeMap<CameraId, Arc<[Zone]>>,
    pub gallery: Arc<Gallery>,
}

impl ConfigSnapshot {
    pub fn new(config: &SurveillanceConfig, gallery: Gallery) -> Self {
        let zones = config
            .cameras
            .iter()
            .map(|c| (c.id.clone(), Arc::from(config.zones_for(&c.id))))
            .collect();
        Self {
            version: 1,
            thresholds: Arc::new(config.thresholds.clone()),
            zones,
            gallery: Arc::new(gallery),
        }
    }

    pub fn zones_for(&self, camera_id: &str) -> Arc<[Zone]> {
        self.zones
            .get(camera_id)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }
}

/// 写时复制的共享配置
///
/// 更新构造新快照后整体替换, 正在处理的帧继续使用旧快照,
/// 下一帧开头看到新版本。
pub struct SharedConfig {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl SharedConfig {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 校验并应用更新, 返回新版本号
    pub fn apply(&self, update: &ConfigUpdate) -> Result<u64, ConfigError> {
        update.validate()?;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);

        let mut zones = current.zones.clone();
        let mut thresholds = current.thresholds.clone();
        let mut gallery = current.gallery.clone();
        match update {
            ConfigUpdate::Zones { camera_id, zones: z } => {
                if !zones.contains_key(camera_id) {
                    return Err(ConfigError::InvalidCamera(format!(
                        "unknown camera `{}`",
                        camera_id
                    )));
                }
                zones.insert(camera_id.clone(), Arc::from(z.clone()));
            }
            ConfigUpdate::Thresholds(t) => thresholds = Arc::new((**t).clone()),
            ConfigUpdate::Gallery(g) => gallery = Arc::new(g.clone()),
        }

        let version = current.version + 1;
        *current = Arc::new(ConfigSnapshot {
            version,
            thresholds,
            zones,
            gallery,
        });
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ZoneType;
    use crate::config::CameraConfig;
    use std::collections::BTreeSet;

    fn config() -> SurveillanceConfig {
        SurveillanceConfig {
            cameras: vec![CameraConfig::new("cam", "synthetic://cam")],
            ..Default::default()
        }
    }

    fn zone(name: &str) -> Zone {
        Zone::rect(name, 0.0, 0.0, 100.0, 100.0, ZoneType::Restricted, BTreeSet::new())
    }

    #[test]
    fn readers_keep_old_snapshot_until_next_load() {
        let shared = SharedConfig::new(ConfigSnapshot::new(&config(), Gallery::default()));
        let before = shared.load();
        assert_eq!(before.version, 1);
        assert!(before.zones_for("cam").is_empty());

        let version = shared
            .apply(&ConfigUpdate::Zones {
                camera_id: "cam".into(),
                zones: vec![zone("door")],
            })
            .unwrap();
        assert_eq!(version, 2);
        assert!(before.zones_for("cam").is_empty());
        assert_eq!(shared.load().zones_for("cam")[0].name, "door");
        assert!(Arc::ptr_eq(&before.thresholds, &shared.load().thresholds));
    }

    #[test]
    fn rejects_invalid_updates() {
        let shared = SharedConfig::new(ConfigSnapshot::new(&config(), Gallery::default()));
        let unknown = ConfigUpdate::Zones {
            camera_id: "nope".into(),
            zones: vec![zone("door")],
        };
        assert!(matches!(shared.apply(&unknown), Err(ConfigError::InvalidCamera(_))));

        let mut t = Thresholds::default();
        t.detector.confidence_threshold = 1.5;
        assert!(shared.apply(&ConfigUpdate::Thresholds(Box::new(t))).is_err());
        assert_eq!(shared.load().version, 1);
    }
}
