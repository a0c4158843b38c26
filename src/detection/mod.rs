// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测系统 (Detection System)
///
/// 每个摄像头一套, 在摄像头线程内同步执行
/// - Detector:       目标检测 (置信度/类别过滤 + NMS)
/// - Tracker:        目标跟踪 (跨帧稳定ID)
/// - FaceIdentifier: 人员身份识别 (人脸库比对)
pub mod detector;
pub mod face;
pub mod tracker;
pub mod types;

pub use detector::{DetectionFailure, Detector};
pub use face::{FaceCapability, FaceIdentifier, Gallery, Identity, KnownPerson};
pub use tracker::{Track, TrackState, Tracker};
pub use types::{BBox, CameraId, Detection, Frame, ObjectClass, Point, TrackId};
