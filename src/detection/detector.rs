// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测器 (Detector)
//! 职责: Frame → 目标检测模型 → 置信度过滤 → 类别映射 → 同类NMS → Detection

use std::time::Instant;

use super::types::{CameraId, Detection, Frame};
use crate::config::DetectorConfig;
use crate::models::{ModelError, ModelWorker, ObjectModel, RawDetection};

/// 单帧检测失败, 流水线按 "本帧无检测" 处理
#[derive(Debug, Clone, thiserror::Error)]
#[error("detection failed on {camera}#{seq}: {source}")]
pub struct DetectionFailure {
    pub camera: CameraId,
    pub seq: u64,
    #[source]
    pub source: ModelError,
}

pub struct Detector {
    worker: ModelWorker<Box<dyn ObjectModel>>,
    config: DetectorConfig,

    // 统计
    last_inference_ms: f64,
}

impl Detector {
    pub fn new(worker: ModelWorker<Box<dyn ObjectModel>>, config: DetectorConfig) -> Self {
        Self {
            worker,
            config,
            last_inference_ms: 0.0,
        }
    }

    pub fn set_config(&mut self, config: DetectorConfig) {
        self.config = config;
    }

    pub fn last_inference_ms(&self) -> f64 {
        self.last_inference_ms
    }

    /// 检测一帧
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionFailure> {
        let start = Instant::now();
        let job_frame = frame.clone();
        let raw = self
            .worker
            .call(move |model: &mut Box<dyn ObjectModel>| model.infer(&job_frame))
            .and_then(|r| r)
            .map_err(|source| DetectionFailure {
                camera: frame.camera_id.clone(),
                seq: frame.seq,
                source,
            })?;
        self.last_inference_ms = start.elapsed().as_secs_f64() * 1000.0;

        Ok(postprocess(raw, &self.config))
    }
}

/// 置信度过滤 + 类别映射 + 同类NMS
pub fn postprocess(raw: Vec<RawDetection>, config: &DetectorConfig) -> Vec<Detection> {
    let mut dets: Vec<Detection> = raw
        .into_iter()
        .filter(|r| r.confidence.is_finite() && r.confidence >= config.confidence_threshold)
        .filter(|r| r.bbox.area() > 0.0)
        .filter_map(|r| {
            let label = r.label.trim().to_lowercase();
            config
                .classes
                .get(&label)
                .map(|class| Detection::new(*class, label, r.confidence, r.bbox))
        })
        .collect();

    non_max_suppression(&mut dets, config.nms_iou_threshold);
    dets
}

/// 非极大值抑制, 只在同一类别内互相抑制
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class != xs[index].class {
                continue;
            }
            let iou = xs[prev_index].bbox.iou(&xs[index].bbox);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{BBox, ObjectClass};
    use chrono::Utc;
    use std::time::Duration;

    fn raw(label: &str, conf: f32, x: f32) -> RawDetection {
        RawDetection::new(label, conf, BBox::from_xywh(x, 0.0, 50.0, 100.0))
    }

    #[test]
    fn filters_threshold_and_unknown_classes() {
        let out = postprocess(
            vec![
                raw("person", 0.9, 0.0),
                raw("person", 0.3, 300.0),
                raw("dog", 0.95, 600.0),
                raw("Suitcase", 0.8, 900.0),
            ],
            &DetectorConfig::default(),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].class, ObjectClass::Person);
        assert_eq!(out[1].class, ObjectClass::Bag);
        assert_eq!(out[1].label, "suitcase");
    }

    #[test]
    fn nms_collapses_same_class_only() {
        let out = postprocess(
            vec![
                raw("person", 0.8, 0.0),
                raw("person", 0.9, 5.0),
                raw("knife", 0.7, 5.0),
            ],
            &DetectorConfig::default(),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].confidence, 0.9);
        assert_eq!(out[1].class, ObjectClass::Weapon);
    }

    struct Failing;

    impl ObjectModel for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, ModelError> {
            Err(ModelError::Inference("cuda out of memory".into()))
        }
    }

    #[test]
    fn model_error_is_frame_local_failure() {
        let model: Box<dyn ObjectModel> = Box::new(Failing);
        let worker = ModelWorker::spawn("failing", model, 1, Duration::from_secs(1)).unwrap();
        let mut detector = Detector::new(worker, DetectorConfig::default());
        let err = detector
            .detect(&Frame::blank("gate-a", 7, Utc::now(), 8, 8))
            .unwrap_err();
        assert_eq!(err.seq, 7);
        assert!(matches!(err.source, ModelError::Inference(_)));
    }
}
