// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 单摄像头流水线
//!
//! 职责: 读帧 → 检测 → 跟踪 → 身份识别 → 行为分析 → 告警去重
//!
//! 连接生命周期:
//! ```text
//! Starting ──open ok──► Running ──read err/timeout──► Reconnecting ──open ok──► Running
//!     │                    │                               │
//!     └──────open err──────┼───────────────────────────────┤
//!                          ▼                               ▼
//!                   EndOfStream/stop ──► Stopped ◄── 重试预算耗尽 (offline)
//! ```
//!
//! 断线时长不超过 `state_grace_secs` 时保留跟踪与分析状态,
//! 超出则整体重置, 避免旧轨迹在重连后产生虚假的进入事件。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use super::{CameraState, CameraStatus, ConfigSnapshot, PipelineEvent, SharedConfig};
use crate::alert::AlertManager;
use crate::analysis::ZoneActivityAnalyzer;
use crate::config::{CameraConfig, PipelineConfig, ReconnectConfig};
use crate::detection::face::{FaceIdentifier, Identity};
use crate::detection::types::{Frame, TrackId};
use crate::detection::{Detector, Tracker};
use crate::input::{frame_queue, Backoff, FrameSource, FrameStream, ReadOutcome, SourceError};

/// 停止标志轮询间隔
const POLL: Duration = Duration::from_millis(50);

/// 读线程 → 处理线程的消息
enum Acquired {
    Frame(Frame),
    End,
    Failed(SourceError),
}

/// 一次连接的结束原因
enum SessionEnd {
    Stopped,
    EndOfStream,
    Failed(SourceError),
}

/// 流水线各组件 (由 SurveillanceManager 组装)
pub struct PipelineParts {
    pub detector: Detector,
    pub tracker: Tracker,
    pub face: FaceIdentifier,
    pub analyzer: ZoneActivityAnalyzer,
    pub alerts: AlertManager,
}

pub struct CameraPipeline {
    camera: CameraConfig,
    source: Arc<dyn FrameSource>,
    parts: PipelineParts,
    shared: Arc<SharedConfig>,
    snapshot: Arc<ConfigSnapshot>,
    pipeline: PipelineConfig,
    reconnect: ReconnectConfig,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<CameraStatus>>,
    feed: Sender<PipelineEvent>,

    // 运行状态
    processed_index: u64,
    accepted: u64,
    /// 最近一帧已接受帧的采集时间, 跨连接保留
    last_captured: Option<DateTime<Utc>>,
    window_start: Instant,
    window_frames: u64,
}

impl CameraPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: CameraConfig,
        source: Arc<dyn FrameSource>,
        parts: PipelineParts,
        shared: Arc<SharedConfig>,
        pipeline: PipelineConfig,
        reconnect: ReconnectConfig,
        stop: Arc<AtomicBool>,
        status: Arc<Mutex<CameraStatus>>,
        feed: Sender<PipelineEvent>,
    ) -> Self {
        let snapshot = shared.load();
        let mut this = Self {
            camera,
            source,
            parts,
            shared,
            snapshot: snapshot.clone(),
            pipeline,
            reconnect,
            stop,
            status,
            feed,
            processed_index: 0,
            accepted: 0,
            last_captured: None,
            window_start: Instant::now(),
            window_frames: 0,
        };
        this.apply_snapshot(&snapshot, true);
        this
    }

    /// 在独立线程中运行
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("camera-{}", self.camera.id))
            .spawn(move || self.run())
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn update_status(&self, f: impl FnOnce(&mut CameraStatus)) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    fn publish(&self, event: PipelineEvent) {
        // 订阅方跟不上时丢弃, 不反压流水线
        if let Err(TrySendError::Full(_)) = self.feed.try_send(event) {
            tracing::trace!(camera = %self.camera.id, "feed full, message dropped");
        }
    }

    fn set_state(&self, state: CameraState) {
        let now = Utc::now();
        let changed = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = status.state != state;
            if changed {
                status.state = state;
                status.since = now;
            }
            changed
        };
        if changed {
            tracing::info!(camera = %self.camera.id, state = %state, "📷 camera state changed");
            self.publish(PipelineEvent::StateChanged {
                camera_id: self.camera.id.clone(),
                state,
                at: now,
            });
        }
    }

    /// 可被停止标志打断的等待
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(POLL.min(deadline - now));
        }
    }

    /// 主循环: 连接 → 处理 → 断线重连
    pub fn run(mut self) {
        tracing::info!(camera = %self.camera.id, url = %self.camera.url, "🎬 camera pipeline started");
        self.set_state(CameraState::Starting);

        let mut backoff = Backoff::new(self.reconnect.clone());
        let mut outage: Option<Instant> = None;
        let mut connected_once = false;

        loop {
            if self.stopped() {
                break;
            }

            match self.source.open(&self.camera.id, &self.camera.url) {
                Ok(stream) => {
                    backoff.reset();
                    if let Some(since) = outage.take() {
                        self.after_outage(since.elapsed());
                    }
                    connected_once = true;
                    self.update_status(|s| s.last_error = None);
                    self.set_state(CameraState::Running);
                    tracing::info!(camera = %self.camera.id, "✅ stream connected");

                    match self.run_session(stream) {
                        SessionEnd::Stopped => break,
                        SessionEnd::EndOfStream => {
                            tracing::info!(camera = %self.camera.id, "🏁 end of stream");
                            break;
                        }
                        SessionEnd::Failed(e) => {
                            tracing::warn!(camera = %self.camera.id, error = %e, "⚠️ stream lost");
                            outage = Some(Instant::now());
                            self.update_status(|s| {
                                s.last_error = Some(e.to_string());
                                s.stats.reconnects += 1;
                            });
                            self.set_state(CameraState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        camera = %self.camera.id,
                        attempt = backoff.attempts() + 1,
                        error = %e,
                        "⚠️ cannot open stream"
                    );
                    self.update_status(|s| s.last_error = Some(e.to_string()));
                    if connected_once {
                        outage.get_or_insert_with(Instant::now);
                        self.set_state(CameraState::Reconnecting);
                    }
                }
            }

            match backoff.next_delay() {
                Some(delay) => {
                    tracing::debug!(camera = %self.camera.id, delay_ms = delay.as_millis() as u64, "retrying");
                    self.sleep(delay);
                }
                None => {
                    tracing::error!(
                        camera = %self.camera.id,
                        retries = self.reconnect.max_retries,
                        "❌ camera offline, retry budget exhausted"
                    );
                    self.update_status(|s| s.online = false);
                    break;
                }
            }
        }

        let alerts = self.parts.alerts.stats();
        self.update_status(|s| s.alerts = alerts);
        self.set_state(CameraState::Stopped);
        tracing::info!(camera = %self.camera.id, "🛑 camera pipeline stopped");
    }

    /// 断线结束后决定是否保留状态
    fn after_outage(&mut self, gap: Duration) {
        if gap > self.pipeline.state_grace() {
            tracing::info!(
                camera = %self.camera.id,
                gap_ms = gap.as_millis() as u64,
                "🧹 outage exceeded grace window, tracking state reset"
            );
            self.parts.tracker.reset();
            self.parts.face.reset();
            self.parts.analyzer.reset();
            self.last_captured = None;
        } else {
            tracing::info!(camera = %self.camera.id, gap_ms = gap.as_millis() as u64, "tracking state kept");
        }
    }

    fn spawn_reader(
        &self,
        mut stream: Box<dyn FrameStream>,
        session_stop: Arc<AtomicBool>,
    ) -> (Receiver<Acquired>, Arc<AtomicU64>) {
        let (tx, rx) = frame_queue(self.pipeline.frame_queue);
        let dropped = tx.dropped_counter();
        let stop = self.stop.clone();
        let camera = self.camera.id.clone();

        let reader = move || {
            while !stop.load(Ordering::Relaxed) && !session_stop.load(Ordering::Relaxed) {
                let msg = match stream.read() {
                    Ok(ReadOutcome::Frame(frame)) => Acquired::Frame(frame),
                    Ok(ReadOutcome::EndOfStream) => Acquired::End,
                    Err(e) => Acquired::Failed(e),
                };
                let last = !matches!(msg, Acquired::Frame(_));
                if !tx.push(msg) || last {
                    break;
                }
            }
            stream.close();
            tracing::debug!(camera = %camera, "reader exited");
        };

        if let Err(e) = thread::Builder::new()
            .name(format!("reader-{}", self.camera.id))
            .spawn(reader)
        {
            tracing::error!(camera = %self.camera.id, error = %e, "❌ cannot spawn reader");
        }
        (rx, dropped)
    }

    fn run_session(&mut self, stream: Box<dyn FrameStream>) -> SessionEnd {
        let session_stop = Arc::new(AtomicBool::new(false));
        let (rx, dropped) = self.spawn_reader(stream, session_stop.clone());
        let read_timeout = self.pipeline.read_timeout();

        let mut last_seq: Option<u64> = None;
        let mut synced = 0;
        let mut waited = Duration::ZERO;
        let end = loop {
            if self.stopped() {
                break SessionEnd::Stopped;
            }
            match rx.recv_timeout(POLL) {
                Ok(Acquired::Frame(frame)) => {
                    waited = Duration::ZERO;
                    let newly_dropped = Self::take_dropped(&dropped, &mut synced);
                    self.update_status(|s| {
                        s.stats.frames_received += 1;
                        s.stats.frames_dropped += newly_dropped;
                    });

                    // 乱序或重复帧直接丢弃
                    // 连接内按序号比较; 新连接的首帧按采集时间与上一连接衔接, 允许帧源重新编号
                    let stale = match last_seq {
                        Some(last) => frame.seq <= last,
                        None => self.last_captured.is_some_and(|t| frame.captured_at <= t),
                    };
                    if stale {
                        tracing::debug!(camera = %self.camera.id, seq = frame.seq, "out-of-order frame dropped");
                        self.update_status(|s| s.stats.frames_out_of_order += 1);
                        continue;
                    }
                    last_seq = Some(frame.seq);
                    self.last_captured = Some(frame.captured_at);

                    self.accepted += 1;
                    let skip = u64::from(self.pipeline.frame_skip.max(1));
                    if (self.accepted - 1) % skip != 0 {
                        self.update_status(|s| s.stats.frames_skipped += 1);
                        continue;
                    }
                    self.process_frame(&frame);
                }
                Ok(Acquired::End) => break SessionEnd::EndOfStream,
                Ok(Acquired::Failed(e)) => break SessionEnd::Failed(e),
                Err(RecvTimeoutError::Timeout) => {
                    let newly_dropped = Self::take_dropped(&dropped, &mut synced);
                    if newly_dropped > 0 {
                        self.update_status(|s| s.stats.frames_dropped += newly_dropped);
                    }
                    waited += POLL;
                    if waited >= read_timeout {
                        break SessionEnd::Failed(SourceError::Timeout(read_timeout));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break SessionEnd::Failed(SourceError::Read("reader exited".into()));
                }
            }
        };

        // 卡在 read 中的读线程在返回后自行退出
        session_stop.store(true, Ordering::Relaxed);
        let newly_dropped = Self::take_dropped(&dropped, &mut synced);
        self.update_status(|s| s.stats.frames_dropped += newly_dropped);
        end
    }

    /// 队列丢帧计数的增量
    fn take_dropped(counter: &AtomicU64, synced: &mut u64) -> u64 {
        let total = counter.load(Ordering::Relaxed);
        let delta = total.saturating_sub(*synced);
        *synced = total;
        delta
    }

    /// 将新版本配置下发到各组件
    fn apply_snapshot(&mut self, snapshot: &Arc<ConfigSnapshot>, initial: bool) {
        let t = &snapshot.thresholds;
        let p = &mut self.parts;
        p.detector.set_config(t.detector.clone());
        p.tracker.set_config(t.tracker.clone());
        p.face.set_config(t.face.clone());
        p.analyzer.set_config(t.analyzer.clone());
        p.alerts.set_config(t.alerts.clone());
        if !initial && !Arc::ptr_eq(&self.snapshot.gallery, &snapshot.gallery) {
            p.face.set_gallery(snapshot.gallery.clone());
            tracing::info!(camera = %self.camera.id, persons = snapshot.gallery.persons.len(), "🔄 gallery replaced");
        }
        if !initial {
            tracing::info!(camera = %self.camera.id, version = snapshot.version, "🔄 config applied");
        }
        self.snapshot = snapshot.clone();
    }

    fn process_frame(&mut self, frame: &Frame) {
        // 帧边界: 取一致的配置快照
        let snapshot = self.shared.load();
        if snapshot.version != self.snapshot.version {
            self.apply_snapshot(&snapshot, false);
        }
        let zones = snapshot.zones_for(&self.camera.id);

        self.processed_index += 1;
        let index = self.processed_index;

        let detections = match self.parts.detector.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(camera = %self.camera.id, error = %e, "⚠️ detection failed, frame treated as empty");
                self.update_status(|s| s.stats.detection_failures += 1);
                Vec::new()
            }
        };

        let p = &mut self.parts;
        let tracks = p.tracker.update(&detections, index, frame.captured_at);

        let mut identities: HashMap<TrackId, Identity> = HashMap::new();
        for track in tracks.iter().filter(|t| t.is_person()) {
            let identity = if track.is_visible() {
                p.face.identify(frame, track)
            } else {
                p.face.cached(track.id)
            };
            identities.insert(track.id, identity);
        }
        let live: HashSet<TrackId> = tracks.iter().map(|t| t.id).collect();
        p.face.retain(&live);

        let events = p
            .analyzer
            .analyze(tracks, &identities, &zones, frame.seq, frame.captured_at);
        let active = tracks.len();

        let mut alerts = Vec::new();
        for event in &events {
            if let Some(alert) = p.alerts.process(event) {
                alerts.push(alert);
            }
        }
        let alert_stats = p.alerts.stats();
        let inference_ms = p.detector.last_inference_ms();

        let event_count = events.len() as u64;
        for event in events {
            self.publish(PipelineEvent::Event(event));
        }
        for alert in alerts {
            self.publish(PipelineEvent::Alert(alert));
        }

        self.window_frames += 1;
        let elapsed = self.window_start.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            self.window_frames as f64 / elapsed
        } else {
            0.0
        };
        let stats = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let s = &mut status.stats;
            s.frames_processed += 1;
            s.events += event_count;
            s.active_tracks = active;
            s.inference_ms = inference_ms;
            s.fps = fps;
            status.alerts = alert_stats;
            status.stats
        };

        let every = self.pipeline.stats_every_frames.max(1);
        if stats.frames_processed % every == 0 {
            tracing::info!(
                camera = %self.camera.id,
                processed = stats.frames_processed,
                received = stats.frames_received,
                dropped = stats.frames_dropped,
                tracks = stats.active_tracks,
                events = stats.events,
                "📊 {:.1} fps, inference {:.1} ms",
                stats.fps,
                stats.inference_ms
            );
            self.window_start = Instant::now();
            self.window_frames = 0;
        }
    }
}
