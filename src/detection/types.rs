// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 监控检测系统数据结构定义
/// Data structures for the surveillance detection system
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

// ========== 标识类型 ==========

/// 摄像头ID (配置中的唯一名称, 如 "gate-a")
pub type CameraId = String;

/// 跟踪ID (单个摄像头内单调递增, 存活期间不复用)
pub type TrackId = u64;

// ========== 几何 ==========

/// 帧坐标系中的点
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// 欧氏距离
    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// 检测框 (x1,y1 左上角; x2,y2 右下角)
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 由左上角与宽高构造
    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self::new(x, y, x + w, y + h)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// 中心点
    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// 平移 (测试与回放脚本常用)
    pub fn shifted(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    /// 计算两个边界框的IOU (Intersection over Union)
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 {
            return 0.0;
        }

        intersection / union
    }
}

// ========== 检测 ==========

/// 关注的目标类别
///
/// 模型输出的原始标签经 `DetectorConfig::classes` 映射到这里,
/// 未映射的标签在检测阶段直接丢弃。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Person,
    Bag,
    Weapon,
}

impl ObjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Person => "person",
            ObjectClass::Bag => "bag",
            ObjectClass::Weapon => "weapon",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单帧检测结果, 生成后不再修改
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: ObjectClass,
    /// 模型原始标签 (如 "knife", "suitcase")
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(class: ObjectClass, label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            class,
            label: label.into(),
            confidence,
            bbox,
        }
    }

    pub fn person(confidence: f32, bbox: BBox) -> Self {
        Self::new(ObjectClass::Person, "person", confidence, bbox)
    }
}

// ========== 帧 ==========

/// 采集帧 (采集线程 → 摄像头流水线)
///
/// 像素使用Arc共享, 推理队列与人脸裁剪都只做引用计数, 不复制整帧。
#[derive(Clone)]
pub struct Frame {
    pub camera_id: CameraId,
    /// 源内序号 (同一次连接内单调递增)
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(camera_id: impl Into<CameraId>, seq: u64, captured_at: DateTime<Utc>, image: RgbImage) -> Self {
        Self {
            camera_id: camera_id.into(),
            seq,
            captured_at,
            image: Arc::new(image),
        }
    }

    /// 纯黑帧 (合成源与测试使用)
    pub fn blank(
        camera_id: impl Into<CameraId>,
        seq: u64,
        captured_at: DateTime<Utc>,
        width: u32,
        height: u32,
    ) -> Self {
        Self::new(camera_id, seq, captured_at, RgbImage::new(width, height))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("seq", &self.seq)
            .field("captured_at", &self.captured_at)
            .field("size", &format_args!("{}x{}", self.width(), self.height()))
            .finish()
    }
}
