// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 丢旧帧队列
//!
//! 处理慢于采集时丢弃队首 (最旧) 的帧再写入新帧, 采集线程永不阻塞。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// 生产端 (持有一个接收端克隆用于弹出最旧元素)
pub struct QueueSender<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> QueueSender<T> {
    /// 写入; 队列满时丢弃最旧元素。接收端全部释放时返回 false
    pub fn push(&self, mut item: T) -> bool {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// 累计丢弃数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

/// 创建容量为 `capacity` 的丢旧帧队列
pub fn frame_queue<T>(capacity: usize) -> (QueueSender<T>, Receiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let sender = QueueSender {
        tx,
        rx: rx.clone(),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let (tx, rx) = frame_queue(3);
        for i in 0..5 {
            assert!(tx.push(i));
        }
        assert_eq!(tx.dropped(), 2);
        let got: Vec<i32> = rx.try_iter().collect();
        assert_eq!(got, vec![2, 3, 4]);
    }

    #[test]
    fn preserves_order_without_pressure() {
        let (tx, rx) = frame_queue(8);
        for i in 0..4 {
            tx.push(i);
        }
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(tx.dropped(), 0);
    }
}
