// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 合成帧源
//!
//! 按固定帧率生成纯黑帧, 时间戳由虚拟时钟推进 (与墙钟无关),
//! 配合回放模型即可离线复现完整场景。每路摄像头可编排脚本:
//!
//! ```text
//! [Frames(300), Drop, FailOpen, FailOpen, Gap(5s), Frames(600)]
//! ```
//!
//! 帧序号在同一路摄像头的多次连接之间连续, 回放脚本始终按序号对齐。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{FrameSource, FrameStream, ReadOutcome, SourceError};
use crate::detection::types::{CameraId, Frame};

/// 脚本步骤
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// 输出 n 帧
    Frames(u64),
    /// 连接中断 (read 返回错误)
    Drop,
    /// 下一次 open 失败
    FailOpen,
    /// 虚拟时钟跳过一段时间 (序号同步前进)
    Gap(chrono::Duration),
    /// read 阻塞一段真实时间 (模拟卡流)
    Stall(Duration),
}

struct CameraSim {
    steps: VecDeque<Step>,
    next_seq: u64,
    clock: DateTime<Utc>,
}

#[derive(Clone)]
struct Shared {
    width: u32,
    height: u32,
    interval: chrono::Duration,
    pace: Option<Duration>,
    endless: bool,
    start: DateTime<Utc>,
    scripts: HashMap<CameraId, Vec<Step>>,
}

/// 合成帧源
#[derive(Clone)]
pub struct SyntheticSource {
    shared: Arc<Shared>,
    cameras: Arc<Mutex<HashMap<CameraId, CameraSim>>>,
}

impl SyntheticSource {
    /// `fps` 决定相邻帧的时间戳间隔
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        let micros = (1_000_000.0 / fps.max(0.001)) as i64;
        Self {
            shared: Arc::new(Shared {
                width,
                height,
                interval: chrono::Duration::microseconds(micros),
                pace: None,
                endless: false,
                start: Utc::now(),
                scripts: HashMap::new(),
            }),
            cameras: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn shared_mut(&mut self) -> &mut Shared {
        Arc::make_mut(&mut self.shared)
    }

    /// 虚拟时钟起点
    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.shared_mut().start = start;
        self
    }

    /// 按帧间隔真实休眠, 模拟实时流
    pub fn realtime(mut self, enabled: bool) -> Self {
        let pace = self.shared.interval.to_std().ok();
        self.shared_mut().pace = if enabled { pace } else { None };
        self
    }

    /// 脚本结束后持续出帧 (否则返回 EndOfStream)
    pub fn endless(mut self, enabled: bool) -> Self {
        self.shared_mut().endless = enabled;
        self
    }

    pub fn script(mut self, camera_id: impl Into<CameraId>, steps: Vec<Step>) -> Self {
        self.shared_mut().scripts.insert(camera_id.into(), steps);
        self
    }

    pub fn frame_interval(&self) -> chrono::Duration {
        self.shared.interval
    }

    fn with_camera<R>(&self, camera_id: &str, f: impl FnOnce(&mut CameraSim) -> R) -> R {
        let mut cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner());
        let sim = cameras.entry(camera_id.to_string()).or_insert_with(|| CameraSim {
            steps: self
                .shared
                .scripts
                .get(camera_id)
                .cloned()
                .unwrap_or_default()
                .into(),
            next_seq: 1,
            clock: self.shared.start,
        });
        f(sim)
    }
}

impl FrameSource for SyntheticSource {
    fn open(&self, camera_id: &str, url: &str) -> Result<Box<dyn FrameStream>, SourceError> {
        let refused = self.with_camera(camera_id, |sim| {
            if sim.steps.front() == Some(&Step::FailOpen) {
                sim.steps.pop_front();
                true
            } else {
                false
            }
        });
        if refused {
            return Err(SourceError::Open {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(SyntheticStream {
            source: self.clone(),
            camera_id: camera_id.to_string(),
            closed: false,
        }))
    }
}

enum Next {
    Emit(Frame),
    Stall(Duration),
    Fail,
    End,
}

struct SyntheticStream {
    source: SyntheticSource,
    camera_id: CameraId,
    closed: bool,
}

impl SyntheticStream {
    fn next(&self) -> Next {
        let shared = &self.source.shared;
        self.source.with_camera(&self.camera_id, |sim| loop {
            let emit = match sim.steps.front().cloned() {
                Some(Step::Frames(0)) => {
                    sim.steps.pop_front();
                    continue;
                }
                Some(Step::Frames(n)) => {
                    if n == 1 {
                        sim.steps.pop_front();
                    } else if let Some(Step::Frames(left)) = sim.steps.front_mut() {
                        *left -= 1;
                    }
                    true
                }
                Some(Step::Gap(gap)) => {
                    sim.steps.pop_front();
                    sim.clock += gap;
                    let skipped = gap.num_microseconds().unwrap_or(0)
                        / shared.interval.num_microseconds().unwrap_or(1).max(1);
                    sim.next_seq += skipped.max(0) as u64;
                    continue;
                }
                Some(Step::Stall(d)) => {
                    sim.steps.pop_front();
                    return Next::Stall(d);
                }
                Some(Step::Drop) => {
                    sim.steps.pop_front();
                    return Next::Fail;
                }
                // 连接已断, 由下一次 open 消费
                Some(Step::FailOpen) => return Next::Fail,
                None => shared.endless,
            };
            if !emit {
                return Next::End;
            }
            let frame = Frame::blank(
                self.camera_id.clone(),
                sim.next_seq,
                sim.clock,
                shared.width,
                shared.height,
            );
            sim.next_seq += 1;
            sim.clock += shared.interval;
            return Next::Emit(frame);
        })
    }
}

impl FrameStream for SyntheticStream {
    fn read(&mut self) -> Result<ReadOutcome, SourceError> {
        if self.closed {
            return Err(SourceError::Read("stream closed".into()));
        }
        loop {
            match self.next() {
                Next::Emit(frame) => {
                    if let Some(pace) = self.source.shared.pace {
                        thread::sleep(pace);
                    }
                    return Ok(ReadOutcome::Frame(frame));
                }
                Next::Stall(d) => thread::sleep(d),
                Next::Fail => return Err(SourceError::Read("connection reset".into())),
                Next::End => return Ok(ReadOutcome::EndOfStream),
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
