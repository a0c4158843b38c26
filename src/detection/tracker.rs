// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 多目标跟踪 - 贪心IOU匹配
//!
//! 核心流程:
//! 1. 同类别的 (检测框, 轨迹) 两两计算IOU, 低于阈值的不参与匹配
//! 2. 按 IOU 降序、检测置信度降序、质心距离升序排序后贪心分配
//! 3. 未匹配的检测 → 新建 Tentative 轨迹
//! 4. 未匹配的轨迹 → 计数丢失帧, Tentative 超过 `tentative_grace_frames` 删除,
//!    Confirmed 超过宽限转 Lost, Lost 超过上限删除
//!
//! Tentative 的短暂宽限让检测闪烁的静止目标保持同一ID。

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{BBox, CameraId, Detection, ObjectClass, Point, TrackId};
use crate::config::TrackerConfig;

/// 轨迹状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
}

/// 轨迹点
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrackPoint {
    pub point: Point,
    pub seq: u64,
    pub at: DateTime<Utc>,
}

/// 跟踪对象
#[derive(Clone, Debug, Serialize)]
pub struct Track {
    /// 唯一跟踪ID
    pub id: TrackId,
    pub class: ObjectClass,
    pub label: String,

    /// 当前边界框
    pub bbox: BBox,
    pub confidence: f32,
    pub state: TrackState,

    /// 连续命中帧数
    pub hits: u32,
    /// 连续丢失帧数
    pub misses: u32,
    /// 存活帧数
    pub age: u32,

    pub first_seen: u64,
    pub last_seen: u64,

    /// 历史轨迹 (中心点, 环形缓冲)
    pub history: VecDeque<TrackPoint>,
}

impl Track {
    fn new(id: TrackId, det: &Detection, seq: u64, at: DateTime<Utc>, config: &TrackerConfig) -> Self {
        let state = if config.confirm_hits <= 1 {
            TrackState::Confirmed
        } else {
            TrackState::Tentative
        };
        let mut history = VecDeque::with_capacity(config.history_len);
        history.push_back(TrackPoint {
            point: det.bbox.center(),
            seq,
            at,
        });
        Self {
            id,
            class: det.class,
            label: det.label.clone(),
            bbox: det.bbox,
            confidence: det.confidence,
            state,
            hits: 1,
            misses: 0,
            age: 1,
            first_seen: seq,
            last_seen: seq,
            history,
        }
    }

    pub fn centroid(&self) -> Point {
        self.bbox.center()
    }

    pub fn is_person(&self) -> bool {
        self.class == ObjectClass::Person
    }

    /// 本帧是否有匹配的检测
    pub fn is_visible(&self) -> bool {
        self.misses == 0
    }

    /// 最近 `samples` 个轨迹点的平均速度 (像素/秒)
    pub fn speed(&self, samples: usize) -> Option<f32> {
        if samples < 2 || self.history.len() < 2 {
            return None;
        }
        let n = samples.min(self.history.len());
        let recent: Vec<&TrackPoint> = self.history.iter().skip(self.history.len() - n).collect();
        let first = recent.first()?;
        let last = recent.last()?;
        let secs = (last.at - first.at).num_milliseconds() as f32 / 1000.0;
        if secs <= 0.0 {
            return None;
        }
        let path: f32 = recent
            .windows(2)
            .map(|w| w[0].point.distance(&w[1].point))
            .sum();
        Some(path / secs)
    }

    fn update(&mut self, det: &Detection, seq: u64, at: DateTime<Utc>, config: &TrackerConfig) {
        self.bbox = det.bbox;
        self.confidence = det.confidence;
        self.hits += 1;
        self.misses = 0;
        self.last_seen = seq;

        self.state = match self.state {
            TrackState::Tentative if self.hits >= config.confirm_hits => TrackState::Confirmed,
            TrackState::Lost => TrackState::Confirmed,
            s => s,
        };

        self.history.push_back(TrackPoint {
            point: det.bbox.center(),
            seq,
            at,
        });
        while self.history.len() > config.history_len.max(1) {
            self.history.pop_front();
        }
    }

    fn mark_missed(&mut self, config: &TrackerConfig) {
        self.misses += 1;
        self.hits = 0;
        if self.state == TrackState::Confirmed && self.misses > config.lost_after_frames {
            self.state = TrackState::Lost;
        }
    }

    fn expired(&self, config: &TrackerConfig) -> bool {
        match self.state {
            TrackState::Tentative => self.misses > config.tentative_grace_frames,
            TrackState::Confirmed => false,
            TrackState::Lost => self.misses > config.remove_after_frames,
        }
    }
}

/// 单个摄像头的跟踪器, 轨迹集合只在 `update` 中修改
pub struct Tracker {
    camera_id: CameraId,
    config: TrackerConfig,
    tracks: Vec<Track>,
    /// 下一个分配的ID
    next_id: TrackId,
}

impl Tracker {
    pub fn new(camera_id: impl Into<CameraId>, config: TrackerConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn set_config(&mut self, config: TrackerConfig) {
        self.config = config;
    }

    /// 更新跟踪, 返回当前全部存活轨迹 (含 Lost)
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame_seq: u64,
        captured_at: DateTime<Utc>,
    ) -> &[Track] {
        for track in &mut self.tracks {
            track.age += 1;
        }

        let assignments = self.match_detections_to_tracks(detections);

        let mut matched_det = vec![false; detections.len()];
        let mut matched_track = vec![false; self.tracks.len()];
        for (det_idx, track_idx) in assignments {
            matched_det[det_idx] = true;
            matched_track[track_idx] = true;
            let track = &mut self.tracks[track_idx];
            let was = track.state;
            track.update(&detections[det_idx], frame_seq, captured_at, &self.config);
            if was != track.state {
                tracing::debug!(camera = %self.camera_id, track = track.id, state = ?track.state, "track state changed");
            }
        }

        for (track_idx, &matched) in matched_track.iter().enumerate() {
            if !matched {
                let track = &mut self.tracks[track_idx];
                let was = track.state;
                track.mark_missed(&self.config);
                if was != track.state {
                    tracing::debug!(camera = %self.camera_id, track = track.id, misses = track.misses, "track lost");
                }
            }
        }

        let config = &self.config;
        let camera_id = &self.camera_id;
        self.tracks.retain(|t| {
            let expired = t.expired(config);
            if expired && t.state == TrackState::Lost {
                tracing::debug!(camera = %camera_id, track = t.id, "🗑️  track removed");
            }
            !expired
        });

        for (det_idx, det) in detections.iter().enumerate() {
            if !matched_det[det_idx] {
                let track = Track::new(self.next_id, det, frame_seq, captured_at, &self.config);
                tracing::debug!(camera = %self.camera_id, track = track.id, class = %det.class, "🆕 track created");
                self.tracks.push(track);
                self.next_id += 1;
            }
        }

        &self.tracks
    }

    /// 贪心匹配, 返回 (检测索引, 轨迹索引)
    fn match_detections_to_tracks(&self, detections: &[Detection]) -> Vec<(usize, usize)> {
        if detections.is_empty() || self.tracks.is_empty() {
            return Vec::new();
        }

        struct Candidate {
            iou: f32,
            confidence: f32,
            distance: f32,
            det_idx: usize,
            track_idx: usize,
        }

        let mut candidates = Vec::new();
        for (det_idx, det) in detections.iter().enumerate() {
            for (track_idx, track) in self.tracks.iter().enumerate() {
                if track.class != det.class {
                    continue;
                }
                let iou = det.bbox.iou(&track.bbox);
                if iou >= self.config.match_iou_threshold && iou > 0.0 {
                    candidates.push(Candidate {
                        iou,
                        confidence: det.confidence,
                        distance: det.bbox.center().distance(&track.centroid()),
                        det_idx,
                        track_idx,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.iou
                .total_cmp(&a.iou)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| a.distance.total_cmp(&b.distance))
        });

        let mut assignments = Vec::new();
        let mut used_det = vec![false; detections.len()];
        let mut used_track = vec![false; self.tracks.len()];
        for c in candidates {
            if !used_det[c.det_idx] && !used_track[c.track_idx] {
                assignments.push((c.det_idx, c.track_idx));
                used_det[c.det_idx] = true;
                used_track[c.track_idx] = true;
            }
        }
        assignments
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn live_ids(&self) -> HashSet<TrackId> {
        self.tracks.iter().map(|t| t.id).collect()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// 清空轨迹 (ID计数不回退)
    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}
