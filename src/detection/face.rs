// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 人脸身份识别
//!
//! 对人员轨迹定期做一次 "人脸检测 → 特征提取 → 人脸库比对",
//! 结果按轨迹缓存。识别失败时不立即改判为Unknown:
//! - 没检测到人脸 (遮挡/侧脸): 保留上次身份 `no_face_grace_frames` 帧
//! - 分数落在阈值下方临界区, 或前两名过于接近: 保留 `borderline_grace_frames` 帧
//! - 模型报错: 视为本帧无结果, 不计入失败次数
//!
//! 缓存身份处于失败宽限期内时, 每帧都会重新识别, 直到恢复或降级。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use image::imageops;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use super::tracker::Track;
use super::types::{BBox, Frame, TrackId};
use crate::config::FaceConfig;
use crate::models::{FaceModel, ModelError, ModelWorker};

// ========== 人脸库 ==========

/// 已登记人员
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnownPerson {
    pub name: String,
    #[serde(default)]
    pub authorized: bool,
    /// 登记的特征向量 (可多张照片)
    pub embeddings: Vec<Vec<f32>>,
}

/// 人脸库
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gallery {
    pub version: u64,
    pub persons: Vec<KnownPerson>,
}

/// 比对候选
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub authorized: bool,
    pub score: f32,
}

impl Gallery {
    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    /// 特征维度 (空库为None)
    pub fn dim(&self) -> Option<usize> {
        self.persons
            .iter()
            .flat_map(|p| p.embeddings.first())
            .map(Vec::len)
            .next()
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        let dim = self.dim();
        for person in &self.persons {
            if person.name.trim().is_empty() {
                return Err("person with empty name".into());
            }
            if !names.insert(person.name.as_str()) {
                return Err(format!("duplicate person `{}`", person.name));
            }
            if person.embeddings.is_empty() {
                return Err(format!("person `{}` has no embedding", person.name));
            }
            for emb in &person.embeddings {
                if Some(emb.len()) != dim || emb.is_empty() {
                    return Err(format!(
                        "person `{}` embedding has dimension {}, expected {}",
                        person.name,
                        emb.len(),
                        dim.unwrap_or(0)
                    ));
                }
                if emb.iter().any(|v| !v.is_finite()) || emb.iter().all(|v| *v == 0.0) {
                    return Err(format!("person `{}` has a degenerate embedding", person.name));
                }
            }
        }
        Ok(())
    }

    /// 按最高余弦相似度排序的候选 (每人取其所有登记特征中的最大值)
    pub fn rank(&self, embedding: ArrayView1<f32>) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self
            .persons
            .iter()
            .filter_map(|person| {
                person
                    .embeddings
                    .iter()
                    .filter(|e| e.len() == embedding.len())
                    .map(|e| cosine_similarity(embedding, ArrayView1::from(e.as_slice())))
                    .fold(None, |best: Option<f32>, s| Some(best.map_or(s, |b| b.max(s))))
                    .map(|score| Candidate {
                        name: person.name.clone(),
                        authorized: person.authorized,
                        score,
                    })
            })
            .collect();
        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        out
    }
}

/// 余弦相似度, 任一向量为零时返回0
pub fn cosine_similarity(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let na = a.dot(&a).sqrt();
    let nb = b.dot(&b).sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    a.dot(&b) / (na * nb)
}

// ========== 身份 ==========

/// 轨迹身份
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    Known {
        name: String,
        confidence: f32,
        authorized: bool,
    },
    #[default]
    Unknown,
    /// 人脸识别不可用, 身份无法核验
    Unverified,
}

impl Identity {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Identity::Known { authorized: true, .. })
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known { .. })
    }

    /// 授权判定: Unverified 返回None, 不参与授权相关规则
    pub fn authorization(&self) -> Option<bool> {
        match self {
            Identity::Known { authorized, .. } => Some(*authorized),
            Identity::Unknown => Some(false),
            Identity::Unverified => None,
        }
    }

    /// 日志与告警描述用
    pub fn label(&self) -> String {
        match self {
            Identity::Known {
                name, authorized, ..
            } => {
                if *authorized {
                    name.clone()
                } else {
                    format!("{} (unauthorized)", name)
                }
            }
            Identity::Unknown => "Unknown person".to_string(),
            Identity::Unverified => "Unverified person (face recognition unavailable)".to_string(),
        }
    }
}

/// 单次识别结果
#[derive(Clone, Debug, PartialEq)]
enum Recognition {
    Match(Candidate),
    /// 临界分数或前两名接近
    Borderline,
    /// 检测到人脸但明确不匹配
    Rejected,
    NoFace,
    /// 模型错误, 本帧无结果
    NoResult,
}

#[derive(Clone, Debug, Default)]
struct CachedIdentity {
    identity: Identity,
    last_attempt: Option<u64>,
    no_face_streak: u32,
    borderline_streak: u32,
}

impl CachedIdentity {
    fn failing(&self) -> bool {
        self.identity.is_known() && (self.no_face_streak > 0 || self.borderline_streak > 0)
    }
}

/// 人脸识别能力
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FaceCapability {
    Available,
    Unavailable(String),
}

/// 人脸身份识别器 (每个摄像头一个, 模型通过 [`ModelWorker`] 共享)
pub struct FaceIdentifier {
    worker: Option<ModelWorker<Box<dyn FaceModel>>>,
    capability: FaceCapability,
    gallery: Arc<Gallery>,
    config: FaceConfig,
    cache: HashMap<TrackId, CachedIdentity>,
}

impl FaceIdentifier {
    pub fn new(
        worker: ModelWorker<Box<dyn FaceModel>>,
        gallery: Arc<Gallery>,
        config: FaceConfig,
    ) -> Self {
        Self {
            worker: Some(worker),
            capability: FaceCapability::Available,
            gallery,
            config,
            cache: HashMap::new(),
        }
    }

    /// 无人脸模型: 所有人员均为Unverified
    pub fn unavailable(reason: impl Into<String>, config: FaceConfig) -> Self {
        Self {
            worker: None,
            capability: FaceCapability::Unavailable(reason.into()),
            gallery: Arc::new(Gallery::default()),
            config,
            cache: HashMap::new(),
        }
    }

    pub fn capability(&self) -> &FaceCapability {
        &self.capability
    }

    pub fn set_config(&mut self, config: FaceConfig) {
        self.config = config;
    }

    /// 替换人脸库, 所有轨迹在下一帧重新识别
    pub fn set_gallery(&mut self, gallery: Arc<Gallery>) {
        self.gallery = gallery;
        for entry in self.cache.values_mut() {
            entry.last_attempt = None;
        }
    }

    /// 缓存中的身份 (不触发识别)
    pub fn cached(&self, track_id: TrackId) -> Identity {
        if self.worker.is_none() {
            return Identity::Unverified;
        }
        self.cache
            .get(&track_id)
            .map(|c| c.identity.clone())
            .unwrap_or_default()
    }

    /// 清理已经消失的轨迹
    pub fn retain(&mut self, live: &HashSet<TrackId>) {
        self.cache.retain(|id, _| live.contains(id));
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// 识别人员轨迹身份
    ///
    /// 帧序号取自 `track.last_seen`, 同一轨迹按 `recognition_interval_frames`
    /// 间隔识别, 其余帧直接返回缓存。
    pub fn identify(&mut self, frame: &Frame, track: &Track) -> Identity {
        if self.worker.is_none() {
            return Identity::Unverified;
        }

        let frame_index = track.last_seen;
        let interval = u64::from(self.config.recognition_interval_frames.max(1));
        let due = match self.cache.get(&track.id) {
            None => true,
            Some(c) => {
                c.failing()
                    || c.last_attempt
                        .map_or(true, |last| frame_index.saturating_sub(last) >= interval)
            }
        };
        if !due {
            return self.cached(track.id);
        }

        let outcome = self.recognize(frame, &track.bbox);
        let config = self.config.clone();
        let entry = self.cache.entry(track.id).or_default();
        entry.last_attempt = Some(frame_index);

        match outcome {
            Recognition::Match(c) => {
                if !matches!(&entry.identity, Identity::Known { name, .. } if *name == c.name) {
                    tracing::info!(
                        camera = %frame.camera_id,
                        track = track.id,
                        person = %c.name,
                        score = c.score,
                        authorized = c.authorized,
                        "👤 identity recognized"
                    );
                }
                entry.identity = Identity::Known {
                    name: c.name,
                    confidence: c.score,
                    authorized: c.authorized,
                };
                entry.no_face_streak = 0;
                entry.borderline_streak = 0;
            }
            Recognition::NoResult => {}
            Recognition::Rejected => {
                Self::downgrade(entry, frame, track.id, "face does not match gallery");
            }
            Recognition::NoFace => {
                entry.no_face_streak += 1;
                if entry.identity.is_known() && entry.no_face_streak > config.no_face_grace_frames {
                    Self::downgrade(entry, frame, track.id, "no face within grace window");
                }
            }
            Recognition::Borderline => {
                entry.no_face_streak = 0;
                entry.borderline_streak += 1;
                if entry.identity.is_known()
                    && entry.borderline_streak > config.borderline_grace_frames
                {
                    Self::downgrade(entry, frame, track.id, "borderline score persisted");
                }
            }
        }

        entry.identity.clone()
    }

    fn downgrade(entry: &mut CachedIdentity, frame: &Frame, track: TrackId, reason: &str) {
        if entry.identity.is_known() {
            tracing::info!(camera = %frame.camera_id, track, reason, "❓ identity downgraded to Unknown");
        }
        entry.identity = Identity::Unknown;
        entry.no_face_streak = 0;
        entry.borderline_streak = 0;
    }

    fn recognize(&self, frame: &Frame, bbox: &BBox) -> Recognition {
        let Some(worker) = &self.worker else {
            return Recognition::NoResult;
        };
        let image = frame.image.clone();
        let region = *bbox;

        let embedding = worker.call(move |model: &mut Box<dyn FaceModel>| {
            extract_embedding(model.as_mut(), &image, &region)
        });

        match embedding {
            Ok(Ok(Some(embedding))) => self.classify(&embedding),
            Ok(Ok(None)) => Recognition::NoFace,
            Ok(Err(e)) | Err(e) => {
                tracing::warn!(camera = %frame.camera_id, error = %e, "⚠️  face recognition failed");
                Recognition::NoResult
            }
        }
    }

    fn classify(&self, embedding: &Array1<f32>) -> Recognition {
        let cfg = &self.config;
        let ranked = self.gallery.rank(embedding.view());
        let Some(top) = ranked.first() else {
            return Recognition::Rejected;
        };

        if top.score >= cfg.authorization_threshold {
            let ambiguous = ranked
                .get(1)
                .is_some_and(|second| top.score - second.score < cfg.ambiguity_margin);
            if ambiguous {
                Recognition::Borderline
            } else {
                Recognition::Match(top.clone())
            }
        } else if top.score >= cfg.authorization_threshold - cfg.borderline_band {
            Recognition::Borderline
        } else {
            Recognition::Rejected
        }
    }
}

/// 在人体框内找最大置信度人脸并提取特征; 找不到人脸返回None
fn extract_embedding(
    model: &mut dyn FaceModel,
    image: &image::RgbImage,
    region: &BBox,
) -> Result<Option<Array1<f32>>, ModelError> {
    let Some(person) = crop(image, region) else {
        return Ok(None);
    };
    let faces = model.detect_faces(&person)?;
    let Some(best) = faces.iter().max_by(|a, b| a.score.total_cmp(&b.score)) else {
        return Ok(None);
    };
    let Some(face) = crop(&person, &best.bbox) else {
        return Ok(None);
    };
    model.embed(&face).map(Some)
}

fn crop(image: &image::RgbImage, region: &BBox) -> Option<image::RgbImage> {
    let (w, h) = image.dimensions();
    let x1 = region.x1.max(0.0).min(w as f32) as u32;
    let y1 = region.y1.max(0.0).min(h as f32) as u32;
    let x2 = region.x2.max(0.0).min(w as f32) as u32;
    let y2 = region.y2.max(0.0).min(h as f32) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image())
}
