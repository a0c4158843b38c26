// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 告警系统 (Alert System)
///
/// - AlertManager:    事件去重与冷却 (每摄像头一个)
/// - AlertDispatcher: 独立线程投递到 Notifier / EventStore
pub mod dispatch;
pub mod manager;

pub use dispatch::{
    AlertDispatcher, DispatchError, DispatchHandle, DispatchStats, EventStore, JsonlEventStore,
    LogNotifier, Notifier, NotifyError, NullEventStore, Record, RetryingNotifier,
};
pub use manager::{Alert, AlertManager, AlertRecord, AlertStats, DedupKey};
