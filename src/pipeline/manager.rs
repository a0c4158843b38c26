// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 多摄像头管理器
//!
//! 组装共享模型、告警投递线程与各摄像头流水线, 并负责:
//! - 启动自检 (模型缺失直接失败, 不静默降级)
//! - 配置热更新 (订阅 ConfigStore, 校验后整体替换快照)
//! - 状态查询、最近事件与事件订阅

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use super::camera::{CameraPipeline, PipelineParts};
use super::{CameraStatus, ConfigSnapshot, PipelineEvent, SharedConfig};
use crate::alert::{
    AlertDispatcher, AlertManager, EventStore, LogNotifier, Notifier, NullEventStore,
    RetryingNotifier,
};
use crate::analysis::{Event, EventLog, ZoneActivityAnalyzer};
use crate::config::{ConfigError, ConfigStore, ConfigUpdate, SurveillanceConfig};
use crate::detection::face::{FaceCapability, FaceIdentifier};
use crate::detection::types::CameraId;
use crate::detection::{Detector, Tracker};
use crate::input::FrameSource;
use crate::models::{FaceModel, ModelError, ModelWorker, ObjectModel};

/// 启动失败
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[source] ConfigError),

    #[error("face gallery: {0}")]
    Gallery(#[source] ConfigError),

    #[error("no {0} configured")]
    MissingComponent(&'static str),

    #[error("{capability} model `{model}` failed health check: {source}")]
    Model {
        capability: &'static str,
        model: String,
        #[source]
        source: ModelError,
    },

    #[error("spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },
}

/// 运行期操作错误
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown camera `{0}`")]
    UnknownCamera(CameraId),

    #[error("camera `{0}` is disabled")]
    CameraDisabled(CameraId),

    #[error("manager already stopped")]
    Stopped,

    #[error("camera `{0}` is already running")]
    AlreadyRunning(CameraId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("spawn camera `{camera}`: {source}")]
    Spawn {
        camera: CameraId,
        #[source]
        source: std::io::Error,
    },
}

/// 识别能力 (启动后固定)
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub object_model: String,
    pub face_model: Option<String>,
    pub face_recognition: FaceCapability,
}

struct CameraHandle {
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<CameraStatus>>,
    history: EventLog,
    thread: Option<JoinHandle<()>>,
}

impl CameraHandle {
    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("❌ camera thread panicked");
            }
        }
    }
}

/// 构建器
pub struct SurveillanceManagerBuilder {
    store: Arc<dyn ConfigStore>,
    source: Option<Arc<dyn FrameSource>>,
    object_model: Option<Box<dyn ObjectModel>>,
    face_model: Option<Box<dyn FaceModel>>,
    allow_degraded_face: bool,
    notifier: Arc<dyn Notifier>,
    event_store: Arc<dyn EventStore>,
}

impl SurveillanceManagerBuilder {
    pub fn source(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn object_model(mut self, model: Box<dyn ObjectModel>) -> Self {
        self.object_model = Some(model);
        self
    }

    pub fn face_model(mut self, model: Box<dyn FaceModel>) -> Self {
        self.face_model = Some(model);
        self
    }

    /// 人脸模型自检失败时降级运行 (所有人员为Unknown) 而不是拒绝启动
    pub fn allow_degraded_face(mut self, allow: bool) -> Self {
        self.allow_degraded_face = allow;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = store;
        self
    }

    pub fn build(self) -> Result<SurveillanceManager, StartupError> {
        let config = self.store.load().map_err(StartupError::Config)?;
        config.validate().map_err(StartupError::Config)?;
        let gallery = self.store.load_gallery().map_err(StartupError::Gallery)?;
        config.log_summary();

        let source = self
            .source
            .ok_or(StartupError::MissingComponent("frame source"))?;
        let mut object_model = self
            .object_model
            .ok_or(StartupError::MissingComponent("object detection model"))?;

        object_model
            .health_check()
            .map_err(|source| StartupError::Model {
                capability: "object detection",
                model: object_model.name().to_string(),
                source,
            })?;
        let object_name = object_model.name().to_string();
        tracing::info!(model = %object_name, "✅ object detection model ready");

        let camera_count = config.cameras.iter().filter(|c| c.enabled).count().max(1);
        let timeout = config.pipeline.inference_timeout();
        let detector_worker = ModelWorker::spawn(&object_name, object_model, camera_count, timeout)
            .map_err(|source| StartupError::Model {
                capability: "object detection",
                model: object_name.clone(),
                source,
            })?;

        let (face_worker, face_capability, face_name) = match self.face_model {
            None => {
                tracing::warn!("⚠️ no face model configured, face recognition unavailable");
                (
                    None,
                    FaceCapability::Unavailable("no face model configured".into()),
                    None,
                )
            }
            Some(mut model) => {
                let name = model.name().to_string();
                match model.health_check() {
                    Ok(()) => {
                        let worker = ModelWorker::spawn(&name, model, camera_count, timeout).map_err(
                            |source| StartupError::Model {
                                capability: "face recognition",
                                model: name.clone(),
                                source,
                            },
                        )?;
                        tracing::info!(
                            model = %name,
                            persons = gallery.persons.len(),
                            "✅ face recognition ready"
                        );
                        if gallery.is_empty() {
                            tracing::warn!("⚠️ face gallery is empty, every person will be unauthorized");
                        }
                        (Some(worker), FaceCapability::Available, Some(name))
                    }
                    Err(source) if self.allow_degraded_face => {
                        tracing::error!(
                            model = %name,
                            error = %source,
                            "❌ face model failed health check, running without face recognition"
                        );
                        (
                            None,
                            FaceCapability::Unavailable(source.to_string()),
                            Some(name),
                        )
                    }
                    Err(source) => {
                        return Err(StartupError::Model {
                            capability: "face recognition",
                            model: name,
                            source,
                        })
                    }
                }
            }
        };

        let alerts = &config.thresholds.alerts;
        let notifier: Arc<dyn Notifier> = Arc::new(RetryingNotifier::new(
            self.notifier,
            alerts.notify_retries,
            Duration::from_millis(alerts.notify_backoff_ms),
        ));
        let dispatcher = AlertDispatcher::spawn(notifier, self.event_store, alerts.dispatch_queue)
            .map_err(|source| StartupError::Spawn {
                what: "alert dispatcher".into(),
                source,
            })?;

        let shared = Arc::new(SharedConfig::new(ConfigSnapshot::new(&config, gallery)));
        let (feed_tx, feed_rx) = crossbeam_channel::bounded(config.pipeline.feed_capacity.max(1));

        let cameras = config
            .cameras
            .iter()
            .map(|c| {
                let status = CameraStatus::new(c.id.clone(), face_capability.clone());
                (
                    c.id.clone(),
                    CameraHandle {
                        stop: Arc::new(AtomicBool::new(false)),
                        status: Arc::new(Mutex::new(status)),
                        history: EventLog::default(),
                        thread: None,
                    },
                )
            })
            .collect();

        Ok(SurveillanceManager {
            config,
            store: self.store,
            source,
            shared,
            detector_worker,
            face_worker,
            capabilities: Capabilities {
                object_model: object_name,
                face_model: face_name,
                face_recognition: face_capability,
            },
            dispatcher: Some(dispatcher),
            cameras,
            feed_tx,
            feed_rx,
            watcher: None,
            watcher_stop: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// 多摄像头监控管理器
pub struct SurveillanceManager {
    config: SurveillanceConfig,
    store: Arc<dyn ConfigStore>,
    source: Arc<dyn FrameSource>,
    shared: Arc<SharedConfig>,
    detector_worker: ModelWorker<Box<dyn ObjectModel>>,
    face_worker: Option<ModelWorker<Box<dyn FaceModel>>>,
    capabilities: Capabilities,
    dispatcher: Option<AlertDispatcher>,
    cameras: BTreeMap<CameraId, CameraHandle>,
    feed_tx: Sender<PipelineEvent>,
    feed_rx: Receiver<PipelineEvent>,
    watcher: Option<JoinHandle<()>>,
    watcher_stop: Arc<AtomicBool>,
}

impl SurveillanceManager {
    pub fn builder(store: Arc<dyn ConfigStore>) -> SurveillanceManagerBuilder {
        SurveillanceManagerBuilder {
            store,
            source: None,
            object_model: None,
            face_model: None,
            allow_degraded_face: false,
            notifier: Arc::new(LogNotifier),
            event_store: Arc::new(NullEventStore),
        }
    }

    pub fn config(&self) -> &SurveillanceConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// 启动全部已启用的摄像头与配置监听
    pub fn start(&mut self) -> Result<(), ManagerError> {
        if self.dispatcher.is_none() {
            return Err(ManagerError::Stopped);
        }
        self.spawn_watcher()?;
        let ids: Vec<CameraId> = self
            .config
            .cameras
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            self.start_camera(id)?;
        }
        tracing::info!(cameras = ids.len(), "🚀 surveillance started");
        Ok(())
    }

    fn spawn_watcher(&mut self) -> Result<(), ManagerError> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let updates = self.store.subscribe();
        let shared = self.shared.clone();
        let stop = self.watcher_stop.clone();
        let thread = thread::Builder::new()
            .name("config-watch".into())
            .spawn(move || watch_updates(updates, shared, stop))
            .map_err(|source| ManagerError::Spawn {
                camera: "config-watch".into(),
                source,
            })?;
        self.watcher = Some(thread);
        Ok(())
    }

    fn build_parts(&self, camera_id: &str) -> PipelineParts {
        let snapshot = self.shared.load();
        let t = &snapshot.thresholds;
        let face = match &self.face_worker {
            Some(worker) => {
                FaceIdentifier::new(worker.clone(), snapshot.gallery.clone(), t.face.clone())
            }
            None => {
                let reason = match &self.capabilities.face_recognition {
                    FaceCapability::Unavailable(reason) => reason.clone(),
                    FaceCapability::Available => "face model unavailable".into(),
                };
                FaceIdentifier::unavailable(reason, t.face.clone())
            }
        };
        let mut alerts = AlertManager::new(camera_id, t.alerts.clone());
        if let Some(dispatcher) = &self.dispatcher {
            alerts = alerts.with_dispatch(dispatcher.handle());
        }
        PipelineParts {
            detector: Detector::new(self.detector_worker.clone(), t.detector.clone()),
            tracker: Tracker::new(camera_id, t.tracker.clone()),
            face,
            analyzer: ZoneActivityAnalyzer::new(camera_id, t.analyzer.clone()),
            alerts,
        }
    }

    /// 启动单个摄像头 (停止后可再次启动, 状态从零开始)
    pub fn start_camera(&mut self, camera_id: &str) -> Result<(), ManagerError> {
        let camera = self
            .config
            .cameras
            .iter()
            .find(|c| c.id == camera_id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownCamera(camera_id.to_string()))?;
        if !camera.enabled {
            return Err(ManagerError::CameraDisabled(camera.id));
        }
        // 投递线程已退出, 告警无处可去
        if self.dispatcher.is_none() {
            return Err(ManagerError::Stopped);
        }

        let parts = self.build_parts(&camera.id);
        let history = parts.analyzer.history();
        let face = parts.face.capability().clone();

        let handle = self
            .cameras
            .get_mut(camera_id)
            .ok_or_else(|| ManagerError::UnknownCamera(camera_id.to_string()))?;
        if handle.is_running() {
            return Err(ManagerError::AlreadyRunning(camera.id));
        }
        handle.stop();

        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(CameraStatus::new(camera.id.clone(), face)));
        let pipeline = CameraPipeline::new(
            camera.clone(),
            self.source.clone(),
            parts,
            self.shared.clone(),
            self.config.pipeline.clone(),
            self.config.reconnect.clone(),
            stop.clone(),
            status.clone(),
            self.feed_tx.clone(),
        );
        let thread = pipeline.spawn().map_err(|source| ManagerError::Spawn {
            camera: camera.id.clone(),
            source,
        })?;

        handle.stop = stop;
        handle.status = status;
        handle.history = history;
        handle.thread = Some(thread);
        Ok(())
    }

    /// 停止单个摄像头并等待线程退出
    pub fn stop_camera(&mut self, camera_id: &str) -> Result<(), ManagerError> {
        let handle = self
            .cameras
            .get_mut(camera_id)
            .ok_or_else(|| ManagerError::UnknownCamera(camera_id.to_string()))?;
        handle.stop();
        Ok(())
    }

    /// 停止全部摄像头、配置监听与告警投递 (不可再启动)
    pub fn stop(&mut self) {
        if self.dispatcher.is_none() {
            return;
        }
        for handle in self.cameras.values() {
            handle.stop.store(true, Ordering::Relaxed);
        }
        for handle in self.cameras.values_mut() {
            handle.stop();
        }
        self.watcher_stop.store(true, Ordering::Relaxed);
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            let stats = dispatcher.stats();
            dispatcher.shutdown();
            tracing::info!(
                sent = stats.sent,
                failed = stats.failed,
                dropped = stats.dropped,
                "📨 alert dispatcher stopped"
            );
        }
        tracing::info!("🛑 surveillance stopped");
    }

    /// 等待所有摄像头自然结束 (有限帧源)
    pub fn wait(&mut self) {
        for handle in self.cameras.values_mut() {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    tracing::error!("❌ camera thread panicked");
                }
            }
        }
    }

    pub fn status(&self, camera_id: &str) -> Option<CameraStatus> {
        self.cameras.get(camera_id).map(|h| {
            h.status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    pub fn statuses(&self) -> Vec<CameraStatus> {
        self.cameras
            .keys()
            .filter_map(|id| self.status(id))
            .collect()
    }

    /// 直接应用配置更新 (与 ConfigStore 推送走同一路径)
    pub fn apply_update(&self, update: ConfigUpdate) -> Result<u64, ManagerError> {
        let kind = update.kind();
        let version = self.shared.apply(&update)?;
        tracing::info!(kind, version, "🔄 config update applied");
        Ok(version)
    }

    pub fn config_version(&self) -> u64 {
        self.shared.load().version
    }

    /// 全部摄像头最近 `window` 内的事件 (按时间排序)
    pub fn recent_events(&self, now: DateTime<Utc>, window: chrono::Duration) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .cameras
            .values()
            .flat_map(|h| h.history.recent(now, window))
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    /// 事件订阅 (多个订阅者竞争消费同一队列)
    pub fn feed(&self) -> Receiver<PipelineEvent> {
        self.feed_rx.clone()
    }
}

impl Drop for SurveillanceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_updates(updates: Receiver<ConfigUpdate>, shared: Arc<SharedConfig>, stop: Arc<AtomicBool>) {
    tracing::debug!("config watcher started");
    while !stop.load(Ordering::Relaxed) {
        match updates.recv_timeout(Duration::from_millis(100)) {
            Ok(update) => match shared.apply(&update) {
                Ok(version) => {
                    tracing::info!(kind = update.kind(), version, "🔄 config update applied")
                }
                Err(e) => {
                    tracing::warn!(kind = update.kind(), error = %e, "⚠️ config update rejected")
                }
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("config watcher stopped");
}
