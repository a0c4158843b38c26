// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 模型统一接口与推理调度
///
/// # 架构说明
///
/// 检测模型与人脸模型都作为黑盒使用, 本模块只定义边界:
/// - **ObjectModel**: 整帧目标检测, 输出未过滤的原始框
/// - **FaceModel**:   人脸检测 + 特征提取 (embedding)
///
/// 推理会话通常不可重入, 所有摄像头共享同一个模型实例时,
/// 调用经 [`ModelWorker`] 串行化: 独立工作线程持有模型,
/// 各摄像头线程通过有界队列投递任务并等待结果。
///
/// ```text
/// camera-1 ──┐
/// camera-2 ──┼─► bounded(N) ─► worker thread (&mut M) ─► reply
/// camera-3 ──┘
/// ```
pub mod replay;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use image::RgbImage;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::detection::types::{BBox, Frame};

pub use replay::{ReplayModel, ReplayScript};

/// 模型错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("inference queue full")]
    QueueFull,

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("inference worker exited")]
    WorkerGone,
}

/// 模型原始输出框 (阈值/类别过滤/NMS之前)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl RawDetection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

/// 人脸区域 (坐标相对于传入的裁剪图)
#[derive(Clone, Debug, PartialEq)]
pub struct FaceRegion {
    pub bbox: BBox,
    pub score: f32,
}

/// 整帧目标检测模型
pub trait ObjectModel: Send {
    fn name(&self) -> &str;

    /// 启动时自检 (模型文件缺失等致命错误在这里暴露)
    fn health_check(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, ModelError>;
}

/// 人脸检测 + 特征提取模型
pub trait FaceModel: Send {
    fn name(&self) -> &str;

    fn health_check(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    /// 在人体裁剪图中定位人脸
    fn detect_faces(&mut self, crop: &RgbImage) -> Result<Vec<FaceRegion>, ModelError>;

    /// 提取人脸特征向量
    fn embed(&mut self, face: &RgbImage) -> Result<Array1<f32>, ModelError>;
}

impl<T: ObjectModel + ?Sized> ObjectModel for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn health_check(&mut self) -> Result<(), ModelError> {
        (**self).health_check()
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, ModelError> {
        (**self).infer(frame)
    }
}

impl<T: FaceModel + ?Sized> FaceModel for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn health_check(&mut self) -> Result<(), ModelError> {
        (**self).health_check()
    }

    fn detect_faces(&mut self, crop: &RgbImage) -> Result<Vec<FaceRegion>, ModelError> {
        (**self).detect_faces(crop)
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Array1<f32>, ModelError> {
        (**self).embed(face)
    }
}

type Job<M> = Box<dyn FnOnce(&mut M) + Send>;

/// 串行推理调度器
///
/// 克隆开销很小 (只克隆发送端), 每个摄像头持有一份。
/// 队列容量按摄像头数量设置: 每个摄像头循环同一时刻最多一个在途请求,
/// 某一路积压不会挤占其他摄像头。
pub struct ModelWorker<M> {
    tx: Sender<Job<M>>,
    timeout: Duration,
    name: Arc<str>,
}

impl<M> Clone for ModelWorker<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            timeout: self.timeout,
            name: self.name.clone(),
        }
    }
}

impl<M: Send + 'static> ModelWorker<M> {
    /// 启动推理线程, 线程在所有句柄释放后退出
    pub fn spawn(
        name: &str,
        model: M,
        queue_capacity: usize,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let (tx, rx): (Sender<Job<M>>, Receiver<Job<M>>) =
            crossbeam_channel::bounded(queue_capacity.max(1));

        let thread_name = format!("infer-{}", name);
        let worker_name = name.to_string();
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || Self::run(worker_name, model, rx))
            .map_err(|e| ModelError::Unavailable(format!("spawn {}: {}", name, e)))?;

        Ok(Self {
            tx,
            timeout,
            name: Arc::from(name),
        })
    }

    fn run(name: String, mut model: M, rx: Receiver<Job<M>>) {
        tracing::debug!(model = %name, "🔍 inference worker started");
        while let Ok(job) = rx.recv() {
            // 模型内部panic只影响当前任务, 调用方收到 WorkerGone/Timeout
            if panic::catch_unwind(AssertUnwindSafe(|| job(&mut model))).is_err() {
                tracing::error!(model = %name, "❌ model panicked during inference");
            }
        }
        tracing::debug!(model = %name, "inference worker exited");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 投递任务并等待结果
    pub fn call<R, F>(&self, f: F) -> Result<R, ModelError>
    where
        R: Send + 'static,
        F: FnOnce(&mut M) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let job: Job<M> = Box::new(move |model| {
            let _ = reply_tx.send(f(model));
        });

        self.tx.send_timeout(job, self.timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(_) => ModelError::QueueFull,
            SendTimeoutError::Disconnected(_) => ModelError::WorkerGone,
        })?;

        reply_rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ModelError::Timeout(self.timeout),
            RecvTimeoutError::Disconnected => ModelError::WorkerGone,
        })
    }
}
