// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 启动自检: 模型缺失直接失败, 人脸能力降级必须显式声明
mod common;

use image::RgbImage;
use ndarray::Array1;

use common::*;
use sentinel_rs::detection::face::FaceCapability;
use sentinel_rs::detection::types::Frame;
use sentinel_rs::models::{FaceModel, FaceRegion, ModelError, ObjectModel, RawDetection};
use sentinel_rs::pipeline::{CameraState, ManagerError, StartupError};

struct MissingModel;

impl ObjectModel for MissingModel {
    fn name(&self) -> &str {
        "yolov8m-det.onnx"
    }

    fn health_check(&mut self) -> Result<(), ModelError> {
        Err(ModelError::Unavailable("model file not found".into()))
    }

    fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, ModelError> {
        Ok(Vec::new())
    }
}

struct BrokenFace;

impl FaceModel for BrokenFace {
    fn name(&self) -> &str {
        "arcface"
    }

    fn health_check(&mut self) -> Result<(), ModelError> {
        Err(ModelError::Unavailable("weights corrupted".into()))
    }

    fn detect_faces(&mut self, _crop: &RgbImage) -> Result<Vec<FaceRegion>, ModelError> {
        Ok(Vec::new())
    }

    fn embed(&mut self, _face: &RgbImage) -> Result<Array1<f32>, ModelError> {
        Ok(Array1::zeros(3))
    }
}

#[test]
fn missing_object_model_fails_fast() {
    let err = builder(store(config(true)), source(), "")
        .object_model(Box::new(MissingModel))
        .build()
        .err()
        .unwrap();
    match err {
        StartupError::Model {
            capability, model, ..
        } => {
            assert_eq!(capability, "object detection");
            assert_eq!(model, "yolov8m-det.onnx");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn broken_face_model_is_fatal_unless_degraded_allowed() {
    let err = builder(store(config(true)), source(), "")
        .face_model(Box::new(BrokenFace))
        .build()
        .err()
        .unwrap();
    assert!(matches!(
        err,
        StartupError::Model {
            capability: "face recognition",
            ..
        }
    ));

    let manager = builder(store(config(true)), source(), "")
        .face_model(Box::new(BrokenFace))
        .allow_degraded_face(true)
        .build()
        .unwrap();
    let caps = manager.capabilities();
    assert_eq!(caps.face_model.as_deref(), Some("arcface"));
    assert!(matches!(&caps.face_recognition, FaceCapability::Unavailable(r) if r.contains("weights corrupted")));
    assert_eq!(
        manager.status("gate-a").unwrap().face,
        caps.face_recognition
    );
}

#[test]
fn unknown_camera_operations_are_rejected() {
    let mut manager = builder(store(config(true)), source(), "").build().unwrap();
    assert!(matches!(
        manager.start_camera("lobby"),
        Err(ManagerError::UnknownCamera(_))
    ));
    assert!(manager.status("lobby").is_none());

    manager.stop();
    assert!(matches!(manager.start(), Err(ManagerError::Stopped)));
}

#[test]
fn camera_cannot_restart_after_manager_stop() {
    let mut manager = builder(store(config(true)), source(), "").build().unwrap();
    manager.stop();
    assert!(matches!(
        manager.start_camera("gate-a"),
        Err(ManagerError::Stopped)
    ));
    // 未知摄像头仍优先报告
    assert!(matches!(
        manager.start_camera("lobby"),
        Err(ManagerError::UnknownCamera(_))
    ));
    assert_ne!(
        manager.status("gate-a").unwrap().state,
        CameraState::Running
    );
}
