// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 告警投递 (Notifier / EventStore)
//!
//! 摄像头线程只做 `try_send`, 真正的通知与落盘在独立投递线程完成:
//!
//! ```text
//! camera-1 ─┐
//! camera-2 ─┼─► bounded(N) ─► dispatcher thread ─► Notifier (重试策略自带)
//! camera-3 ─┘                                   └─► EventStore (审计, 尽力而为)
//! ```
//!
//! 队列满或投递线程已退出时, 告警与事件直接写入 EventStore,
//! 告警另附一条 `DeliveryFailed`, 不会无声丢失。

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;

use super::manager::Alert;
use crate::analysis::activity::Event;
use crate::detection::types::CameraId;

/// 通知错误
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifier unreachable: {0}")]
    Unreachable(String),

    #[error("notifier rejected alert: {0}")]
    Rejected(String),

    #[error("gave up after {attempts} attempts: {source}")]
    GaveUp {
        attempts: u32,
        #[source]
        source: Box<NotifyError>,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

/// 投递队列错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch queue full")]
    QueueFull,

    #[error("dispatcher stopped")]
    Closed,
}

/// 外部通知通道 (短信/邮件/Webhook等由实现方负责)
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        (**self).notify(alert)
    }
}

/// 审计记录
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Alert(Alert),
    Event(Event),
    /// 最终投递失败, 留待人工跟进
    DeliveryFailed {
        alert_id: String,
        camera_id: CameraId,
        notifier: String,
        error: String,
    },
}

/// 事件/告警存储
pub trait EventStore: Send + Sync {
    fn record(&self, record: &Record) -> Result<(), NotifyError>;
}

// ========== 内置实现 ==========

/// 只写日志的通知器
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        tracing::warn!(
            target: "sentinel_rs::notify",
            alert = %alert.id,
            camera = %alert.camera_id,
            activity = %alert.activity,
            threat = %alert.threat,
            zone = alert.zone.as_deref().unwrap_or("-"),
            x = alert.evidence.location.x,
            y = alert.evidence.location.y,
            "{} {}",
            alert.threat.icon(),
            alert.description
        );
        Ok(())
    }
}

/// 丢弃一切的存储
pub struct NullEventStore;

impl EventStore for NullEventStore {
    fn record(&self, _record: &Record) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// JSON Lines 文件存储 (追加写)
pub struct JsonlEventStore {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventStore {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl EventStore for JsonlEventStore {
    fn record(&self, record: &Record) -> Result<(), NotifyError> {
        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// 带指数退避重试的通知器包装
pub struct RetryingNotifier<N> {
    inner: N,
    retries: u32,
    backoff: Duration,
}

impl<N: Notifier> RetryingNotifier<N> {
    pub fn new(inner: N, retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            retries,
            backoff,
        }
    }
}

impl<N: Notifier> Notifier for RetryingNotifier<N> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.notify(alert) {
                Ok(()) => return Ok(()),
                // 对方明确拒绝, 重试无意义
                Err(e @ NotifyError::Rejected(_)) => return Err(e),
                Err(e) if attempt > self.retries => {
                    return Err(NotifyError::GaveUp {
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(e) => {
                    tracing::debug!(
                        notifier = self.inner.name(),
                        alert = %alert.id,
                        attempt,
                        error = %e,
                        "notify failed, retrying"
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }
}

// ========== 投递线程 ==========

enum Job {
    Alert(Box<Alert>),
    Event(Box<Event>),
    Shutdown,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// 投递统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// 摄像头侧投递句柄 (正常路径非阻塞)
#[derive(Clone)]
pub struct DispatchHandle {
    tx: Sender<Job>,
    counters: Arc<Counters>,
    store: Arc<dyn EventStore>,
}

impl DispatchHandle {
    fn try_send(&self, job: Job) -> Result<(), DispatchError> {
        self.tx.try_send(job).map_err(|e| {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                TrySendError::Full(_) => DispatchError::QueueFull,
                TrySendError::Disconnected(_) => DispatchError::Closed,
            }
        })
    }

    /// 绕过队列直接写审计
    fn record_direct(&self, record: &Record) {
        if let Err(e) = self.store.record(record) {
            tracing::warn!(error = %e, "⚠️  event store write failed");
        }
    }

    /// 告警入队; 失败时告警与失败原因直接落审计, 错误仍返回给调用方
    pub fn submit(&self, alert: &Alert) -> Result<(), DispatchError> {
        self.try_send(Job::Alert(Box::new(alert.clone())))
            .inspect_err(|e| {
                self.record_direct(&Record::Alert(alert.clone()));
                self.record_direct(&Record::DeliveryFailed {
                    alert_id: alert.id.clone(),
                    camera_id: alert.camera_id.clone(),
                    notifier: "dispatch-queue".into(),
                    error: e.to_string(),
                });
            })
    }

    pub fn record_event(&self, event: &Event) -> Result<(), DispatchError> {
        self.try_send(Job::Event(Box::new(event.clone())))
            .inspect_err(|_| self.record_direct(&Record::Event(event.clone())))
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }
}

/// 告警投递线程
pub struct AlertDispatcher {
    handle: DispatchHandle,
    worker: Option<JoinHandle<()>>,
}

impl AlertDispatcher {
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn EventStore>,
        capacity: usize,
    ) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let counters = Arc::new(Counters::default());

        let worker_counters = counters.clone();
        let worker_store = store.clone();
        let worker = thread::Builder::new()
            .name("alert-dispatch".into())
            .spawn(move || run(rx, notifier, worker_store, worker_counters))?;

        Ok(Self {
            handle: DispatchHandle { tx, counters, store },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> DispatchStats {
        self.handle.stats()
    }

    /// 处理完队列中剩余任务后退出
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.handle.tx.send(Job::Shutdown);
            if worker.join().is_err() {
                tracing::error!("❌ alert dispatcher panicked");
            }
        }
    }
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    rx: Receiver<Job>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn EventStore>,
    counters: Arc<Counters>,
) {
    tracing::debug!(notifier = notifier.name(), "📨 alert dispatcher started");
    let store_record = |record: &Record| {
        if let Err(e) = store.record(record) {
            tracing::warn!(error = %e, "⚠️  event store write failed");
        }
    };

    while let Ok(job) = rx.recv() {
        match job {
            Job::Event(event) => store_record(&Record::Event(*event)),
            Job::Alert(alert) => {
                let result = notifier.notify(&alert);
                store_record(&Record::Alert((*alert).clone()));
                match result {
                    Ok(()) => {
                        counters.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            notifier = notifier.name(),
                            alert = %alert.id,
                            camera = %alert.camera_id,
                            error = %e,
                            "❌ alert delivery failed"
                        );
                        store_record(&Record::DeliveryFailed {
                            alert_id: alert.id.clone(),
                            camera_id: alert.camera_id.clone(),
                            notifier: notifier.name().to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
            Job::Shutdown => break,
        }
    }
    tracing::debug!("alert dispatcher exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::activity::{ActivityType, Evidence, ThreatLevel};
    use crate::detection::types::Point;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    fn alert(id: &str) -> Alert {
        let now = Utc::now();
        Alert {
            id: id.into(),
            camera_id: "gate-a".into(),
            activity: ActivityType::WeaponDetected,
            threat: ThreatLevel::Critical,
            timestamp: now,
            track_id: Some(3),
            zone: None,
            confidence: 0.8,
            description: "Weapon detected: knife".into(),
            evidence: Evidence {
                frame_seq: 10,
                captured_at: now,
                location: Point::new(5.0, 5.0),
                bbox: None,
            },
        }
    }

    /// 前 `fail_first` 次失败
    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl Notifier for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn notify(&self, _alert: &Alert) -> Result<(), NotifyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(NotifyError::Unreachable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl EventStore for Collect {
        fn record(&self, record: &Record) -> Result<(), NotifyError> {
            let kind = match record {
                Record::Alert(_) => "alert",
                Record::Event(_) => "event",
                Record::DeliveryFailed { .. } => "delivery_failed",
            };
            self.0.lock().unwrap().push(kind.to_string());
            Ok(())
        }
    }

    #[test]
    fn retrying_notifier_recovers() {
        let n = RetryingNotifier::new(
            Flaky {
                calls: AtomicU32::new(0),
                fail_first: 2,
            },
            3,
            Duration::from_millis(1),
        );
        assert!(n.notify(&alert("a")).is_ok());
        assert_eq!(n.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retrying_notifier_gives_up() {
        let n = RetryingNotifier::new(
            Flaky {
                calls: AtomicU32::new(0),
                fail_first: 100,
            },
            2,
            Duration::from_millis(1),
        );
        match n.notify(&alert("a")) {
            Err(NotifyError::GaveUp { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn failed_delivery_is_recorded_not_retried() {
        let store = Arc::new(Collect::default());
        let notifier = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 1,
        });
        let dispatcher = AlertDispatcher::spawn(notifier.clone(), store.clone(), 8).unwrap();
        let handle = dispatcher.handle();
        handle.submit(&alert("a")).unwrap();
        handle.submit(&alert("b")).unwrap();
        dispatcher.shutdown();

        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *store.0.lock().unwrap(),
            vec!["alert", "delivery_failed", "alert"]
        );
        assert_eq!(handle.stats(), DispatchStats { sent: 1, failed: 1, dropped: 0 });
    }

    /// 阻塞在通知中, 直到测试放行
    struct Gate {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl Notifier for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn notify(&self, _alert: &Alert) -> Result<(), NotifyError> {
            let _ = self.entered.send(());
            let _ = self.release.recv_timeout(Duration::from_secs(5));
            Ok(())
        }
    }

    #[test]
    fn full_queue_alert_goes_straight_to_store() {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let store = Arc::new(Collect::default());
        let gate = Arc::new(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        let dispatcher = AlertDispatcher::spawn(gate, store.clone(), 1).unwrap();
        let handle = dispatcher.handle();

        handle.submit(&alert("a")).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.submit(&alert("b")).unwrap();
        assert_eq!(handle.submit(&alert("c")), Err(DispatchError::QueueFull));
        assert_eq!(*store.0.lock().unwrap(), vec!["alert", "delivery_failed"]);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        dispatcher.shutdown();
        assert_eq!(store.0.lock().unwrap().len(), 4);
        assert_eq!(handle.stats(), DispatchStats { sent: 2, failed: 0, dropped: 1 });
    }

    #[test]
    fn closed_dispatcher_still_audits() {
        let store = Arc::new(Collect::default());
        let dispatcher = AlertDispatcher::spawn(Arc::new(LogNotifier), store.clone(), 4).unwrap();
        let handle = dispatcher.handle();
        dispatcher.shutdown();

        assert_eq!(handle.submit(&alert("a")), Err(DispatchError::Closed));
        assert_eq!(*store.0.lock().unwrap(), vec!["alert", "delivery_failed"]);
    }

    #[test]
    fn jsonl_store_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let store = JsonlEventStore::open(&path).unwrap();
        store.record(&Record::Alert(alert("a"))).unwrap();
        store
            .record(&Record::DeliveryFailed {
                alert_id: "a".into(),
                camera_id: "gate-a".into(),
                notifier: "log".into(),
                error: "timeout".into(),
            })
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "alert");
        assert_eq!(lines[0]["threat"], "critical");
        assert_eq!(lines[1]["type"], "delivery_failed");
    }
}
