// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
#![allow(clippy::type_complexity)]
//! 数字卫兵 多路摄像头监控核心
//!
//! 检测 → 跟踪 → 身份识别 → 行为分析 → 告警去重, 每路摄像头一条流水线并发运行。
pub mod alert; // 告警去重与投递
pub mod analysis; // 区域与行为规则
pub mod config; // 配置参数与热更新
pub mod detection; // 检测、跟踪、人脸身份
pub mod input; // 帧源与采集队列
pub mod models; // 模型接口与推理调度
pub mod pipeline; // 摄像头流水线与管理器

pub use crate::alert::{Alert, AlertManager, Notifier};
pub use crate::analysis::{ActivityType, Event, ThreatLevel, Zone, ZoneActivityAnalyzer, ZoneType};
pub use crate::config::{ConfigStore, ConfigUpdate, JsonConfigStore, MemoryConfigStore, SurveillanceConfig};
pub use crate::detection::{Detector, FaceIdentifier, Gallery, Identity, Tracker};
pub use crate::models::{FaceModel, ModelError, ModelWorker, ObjectModel, ReplayModel};
pub use crate::pipeline::{CameraState, CameraStatus, PipelineEvent, SurveillanceManager};
