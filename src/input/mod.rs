// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频输入系统 (Video Input System)
///
/// 采集线程与处理线程之间只通过有界队列交换帧
/// - FrameSource/FrameStream: 外部帧源边界 (网络流、本地设备、回放)
/// - FrameQueue:  有界队列, 满时丢弃最旧帧, 采集永不阻塞
/// - Backoff:     带抖动的指数退避 (重连)
/// - SyntheticSource: 合成帧源, 可编排断线/重连场景
pub mod backoff;
pub mod queue;
pub mod synthetic;

use std::time::Duration;

use crate::detection::types::Frame;

pub use backoff::Backoff;
pub use queue::{frame_queue, QueueSender};
pub use synthetic::{SyntheticSource, Step};

/// 帧源错误 (均视为瞬时错误, 由重连策略处理)
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("cannot open {url}: {reason}")]
    Open { url: String, reason: String },

    #[error("read failed: {0}")]
    Read(String),

    #[error("no frame within {0:?}")]
    Timeout(Duration),
}

/// 单次读帧结果
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    EndOfStream,
}

/// 已打开的帧流 (一次连接)
pub trait FrameStream: Send {
    /// 阻塞读取下一帧
    fn read(&mut self) -> Result<ReadOutcome, SourceError>;

    /// 释放连接
    fn close(&mut self) {}
}

/// 帧源工厂, 按摄像头打开连接
pub trait FrameSource: Send + Sync {
    fn open(&self, camera_id: &str, url: &str) -> Result<Box<dyn FrameStream>, SourceError>;
}
