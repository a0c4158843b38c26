// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 取帧: 乱序丢弃与丢帧统计
mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use sentinel_rs::analysis::ActivityType;
use sentinel_rs::detection::Frame;
use sentinel_rs::input::Step;
use sentinel_rs::models::{ModelError, ObjectModel, RawDetection};
use sentinel_rs::pipeline::CameraState;

/// 每帧间隔 100ms 的 (序号, 偏移)
fn frames(seqs: &[u64]) -> Vec<(u64, i64)> {
    seqs.iter().map(|&seq| (seq, (seq as i64 - 1) * 100)).collect()
}

#[test]
fn out_of_order_frame_is_dropped_before_analysis() {
    // 人员只出现在乱序到达的第3帧
    let source = SessionSource::new(vec![frames(&[1, 2, 5, 3, 6])]);
    let mut manager = builder_with(store(config(true)), Arc::new(source), &person_script(3, 3))
        .build()
        .unwrap();
    let feed = manager.feed();
    manager.start().unwrap();
    manager.wait();
    let got = drain(&feed);

    assert!(got.events.is_empty());
    assert!(got.alerts.is_empty());
    let stats = manager.status("gate-a").unwrap().stats;
    assert_eq!(stats.frames_received, 5);
    assert_eq!(stats.frames_out_of_order, 1);
    assert_eq!(stats.frames_processed, 4);
}

#[test]
fn replayed_frames_after_reconnect_are_dropped() {
    // 重连后帧源重放了断线前的第4, 5帧
    let source = SessionSource::new(vec![frames(&[1, 2, 3, 4, 5]), frames(&[4, 5, 6, 7])]);
    let mut manager = builder_with(store(config(true)), Arc::new(source), &person_script(1, 7))
        .build()
        .unwrap();
    let feed = manager.feed();
    manager.start().unwrap();
    manager.wait();
    let got = drain(&feed);

    let stats = manager.status("gate-a").unwrap().stats;
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.frames_out_of_order, 2);
    assert_eq!(stats.frames_processed, 7);
    assert_eq!(got.events_of(ActivityType::ZoneIntrusion).len(), 1);
}

#[test]
fn renumbered_stream_after_reconnect_is_accepted() {
    // 帧源重启后从1重新编号, 采集时间仍向前
    let second = vec![(1, 500), (2, 600)];
    let source = SessionSource::new(vec![frames(&[1, 2, 3, 4, 5]), second]);
    let mut manager = builder_with(store(config(true)), Arc::new(source), "")
        .build()
        .unwrap();
    manager.start().unwrap();
    manager.wait();

    let stats = manager.status("gate-a").unwrap().stats;
    assert_eq!(stats.frames_out_of_order, 0);
    assert_eq!(stats.frames_processed, 7);
}

#[test]
fn state_reset_forgets_previous_capture_time() {
    let mut cfg = config(true);
    cfg.pipeline.state_grace_secs = 0;
    let source = SessionSource::new(vec![frames(&[1, 2, 3, 4, 5]), frames(&[4, 5, 6, 7])]);
    let mut manager = builder_with(store(cfg), Arc::new(source), "")
        .build()
        .unwrap();
    manager.start().unwrap();
    manager.wait();

    let stats = manager.status("gate-a").unwrap().stats;
    assert_eq!(stats.frames_out_of_order, 0);
    assert_eq!(stats.frames_processed, 9);
}

/// 第一帧推理很慢, 读线程期间持续出帧
struct SlowFirstFrame;

impl ObjectModel for SlowFirstFrame {
    fn name(&self) -> &str {
        "slow-first-frame"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, ModelError> {
        if frame.seq == 1 {
            thread::sleep(Duration::from_millis(300));
        }
        Ok(Vec::new())
    }
}

#[test]
fn dropped_frames_are_visible_while_running() {
    let mut cfg = config(true);
    cfg.pipeline.frame_queue = 1;
    cfg.pipeline.read_timeout_ms = 5000;
    let script = vec![Step::Frames(50), Step::Stall(Duration::from_secs(2))];
    let mut manager = builder(store(cfg), source().script("gate-a", script), "")
        .object_model(Box::new(SlowFirstFrame))
        .build()
        .unwrap();
    manager.start().unwrap();

    // 连接仍在 (流停顿中), 丢帧数已可见
    assert!(wait_until(Duration::from_millis(1500), || {
        manager.status("gate-a").is_some_and(|s| {
            s.stats.frames_received + s.stats.frames_dropped == 50 && s.stats.frames_dropped > 0
        })
    }));
    assert_eq!(manager.status("gate-a").unwrap().state, CameraState::Running);

    manager.wait();
    let stats = manager.status("gate-a").unwrap().stats;
    assert_eq!(stats.frames_received + stats.frames_dropped, 50);
}
