// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 回放检测模型 - 按帧序号返回预先录制的检测框
//!
//! 脚本为JSON Lines, 每行一段:
//! ```json
//! {"camera":"gate-a","from":1,"to":80,"detections":[
//!   {"label":"person","confidence":0.9,"bbox":{"x1":100,"y1":100,"x2":160,"y2":260},"velocity":[2.0,0.0]}]}
//! ```
//! `to` 缺省等于 `from`; `velocity` 为每帧位移 (像素), 缺省静止。

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::{ModelError, ObjectModel, RawDetection};
use crate::detection::types::{BBox, CameraId, Frame};

#[derive(Clone, Debug, Deserialize)]
struct ScriptedDetection {
    label: String,
    confidence: f32,
    bbox: BBox,
    #[serde(default)]
    velocity: Option<[f32; 2]>,
}

#[derive(Clone, Debug, Deserialize)]
struct ScriptSegment {
    camera: CameraId,
    from: u64,
    #[serde(default)]
    to: Option<u64>,
    #[serde(default)]
    detections: Vec<ScriptedDetection>,
    /// 该区间内推理直接失败 (模拟模型异常)
    #[serde(default)]
    fail: bool,
}

impl ScriptSegment {
    fn covers(&self, seq: u64) -> bool {
        seq >= self.from && seq <= self.to.unwrap_or(self.from)
    }
}

/// 回放脚本
#[derive(Clone, Debug, Default)]
pub struct ReplayScript {
    segments: HashMap<CameraId, Vec<ScriptSegment>>,
}

impl ReplayScript {
    pub fn parse(text: &str) -> Result<Self> {
        let mut script = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let seg: ScriptSegment = serde_json::from_str(line)
                .with_context(|| format!("replay script line {}", lineno + 1))?;
            script.segments.entry(seg.camera.clone()).or_default().push(seg);
        }
        Ok(script)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("read replay script {}", path.display()))?;
        Self::parse(&text)
    }

    fn lookup(&self, camera: &str, seq: u64) -> Result<Vec<RawDetection>, ModelError> {
        let mut out = Vec::new();
        let Some(segments) = self.segments.get(camera) else {
            return Ok(out);
        };
        for seg in segments.iter().filter(|s| s.covers(seq)) {
            if seg.fail {
                return Err(ModelError::Inference(format!(
                    "scripted failure at {}#{}",
                    camera, seq
                )));
            }
            let steps = (seq - seg.from) as f32;
            for det in &seg.detections {
                let [vx, vy] = det.velocity.unwrap_or([0.0, 0.0]);
                out.push(RawDetection::new(
                    det.label.clone(),
                    det.confidence,
                    det.bbox.shifted(vx * steps, vy * steps),
                ));
            }
        }
        Ok(out)
    }
}

/// 回放模型
pub struct ReplayModel {
    script: ReplayScript,
}

impl ReplayModel {
    pub fn new(script: ReplayScript) -> Self {
        Self { script }
    }
}

impl ObjectModel for ReplayModel {
    fn name(&self) -> &str {
        "replay"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, ModelError> {
        self.script.lookup(&frame.camera_id, frame.seq)
    }
}
