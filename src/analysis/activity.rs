// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 行为类型、威胁等级与事件

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::zone::ZoneType;
use crate::detection::types::{BBox, CameraId, Point, TrackId};

/// 行为类型 (封闭枚举, 新增类型时分析器与告警模块的match会在编译期提示)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ZoneIntrusion,
    Loitering,
    AbandonedObject,
    WeaponDetected,
    UnauthorizedPerson,
    Running,
    CrowdFormation,
}

impl ActivityType {
    pub const ALL: [ActivityType; 7] = [
        ActivityType::ZoneIntrusion,
        ActivityType::Loitering,
        ActivityType::AbandonedObject,
        ActivityType::WeaponDetected,
        ActivityType::UnauthorizedPerson,
        ActivityType::Running,
        ActivityType::CrowdFormation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::ZoneIntrusion => "zone_intrusion",
            ActivityType::Loitering => "loitering",
            ActivityType::AbandonedObject => "abandoned_object",
            ActivityType::WeaponDetected => "weapon_detected",
            ActivityType::UnauthorizedPerson => "unauthorized_person",
            ActivityType::Running => "running",
            ActivityType::CrowdFormation => "crowd_formation",
        }
    }

    /// 去重键是否带跟踪ID
    ///
    /// 武器与聚集按摄像头去重: 武器框在遮挡下经常换ID,
    /// 聚集本身不属于某一个目标。
    pub fn track_scoped(&self) -> bool {
        match self {
            ActivityType::ZoneIntrusion
            | ActivityType::Loitering
            | ActivityType::AbandonedObject
            | ActivityType::UnauthorizedPerson
            | ActivityType::Running => true,
            ActivityType::WeaponDetected | ActivityType::CrowdFormation => false,
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 威胁等级 (有序: Low < Medium < High < Critical)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }

    /// 控制台图标
    pub fn icon(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "🟢",
            ThreatLevel::Medium => "🟡",
            ThreatLevel::High => "🟠",
            ThreatLevel::Critical => "🔴",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 威胁判定上下文
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ThreatContext {
    /// 事件所在区域类型 (不在任何区域为None)
    pub zone_type: Option<ZoneType>,
    /// 身份授权情况: Some(true) 已授权, Some(false) 未知/未授权, None 非人员目标或身份无法核验
    pub authorized: Option<bool>,
}

/// 由行为类型与上下文确定威胁等级
///
/// 每条规则给出一个候选等级, 多条同时成立时取最高。
pub fn classify_threat(activity: ActivityType, ctx: ThreatContext) -> ThreatLevel {
    let restricted = ctx.zone_type == Some(ZoneType::Restricted);
    let unauthorized = ctx.authorized == Some(false);

    let mut levels = Vec::with_capacity(3);
    match activity {
        ActivityType::WeaponDetected => levels.push(ThreatLevel::Critical),
        ActivityType::UnauthorizedPerson => levels.push(ThreatLevel::High),
        ActivityType::ZoneIntrusion => {
            levels.push(ThreatLevel::Medium);
            if unauthorized {
                levels.push(ThreatLevel::High);
            }
        }
        ActivityType::Loitering => {
            levels.push(ThreatLevel::Medium);
            if restricted && unauthorized {
                levels.push(ThreatLevel::High);
            }
        }
        ActivityType::AbandonedObject | ActivityType::CrowdFormation => {
            levels.push(ThreatLevel::Medium);
            if restricted {
                levels.push(ThreatLevel::High);
            }
        }
        ActivityType::Running => {
            levels.push(ThreatLevel::Low);
            if restricted {
                levels.push(ThreatLevel::Medium);
            }
        }
    }

    levels.into_iter().max().unwrap_or(ThreatLevel::Low)
}

/// 证据帧引用 (截图文件管理不在本系统内, 这里只记录定位信息)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub frame_seq: u64,
    pub captured_at: DateTime<Utc>,
    pub location: Point,
    pub bbox: Option<BBox>,
}

/// 行为事件 (分析器 → 告警管理器, 只被消费一次)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub activity: ActivityType,
    pub camera_id: CameraId,
    pub track_id: Option<TrackId>,
    pub zone: Option<String>,
    pub threat: ThreatLevel,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub description: String,
    pub evidence: Evidence,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(zone_type: Option<ZoneType>, authorized: Option<bool>) -> ThreatContext {
        ThreatContext {
            zone_type,
            authorized,
        }
    }

    #[test]
    fn intrusion_threat_depends_on_identity() {
        let restricted = Some(ZoneType::Restricted);
        assert_eq!(
            classify_threat(ActivityType::ZoneIntrusion, ctx(restricted, Some(false))),
            ThreatLevel::High
        );
        assert_eq!(
            classify_threat(ActivityType::ZoneIntrusion, ctx(restricted, Some(true))),
            ThreatLevel::Medium
        );
    }

    #[test]
    fn weapon_is_always_critical() {
        for zone in [None, Some(ZoneType::Monitored), Some(ZoneType::Restricted)] {
            assert_eq!(
                classify_threat(ActivityType::WeaponDetected, ctx(zone, None)),
                ThreatLevel::Critical
            );
        }
    }

    #[test]
    fn restricted_zone_escalates() {
        assert_eq!(
            classify_threat(ActivityType::AbandonedObject, ctx(Some(ZoneType::Monitored), None)),
            ThreatLevel::Medium
        );
        assert_eq!(
            classify_threat(ActivityType::AbandonedObject, ctx(Some(ZoneType::Restricted), None)),
            ThreatLevel::High
        );
        assert_eq!(
            classify_threat(ActivityType::Running, ctx(None, Some(true))),
            ThreatLevel::Low
        );
    }

    #[test]
    fn threat_levels_are_ordered() {
        assert!(ThreatLevel::Critical > ThreatLevel::High);
        assert!(ThreatLevel::High > ThreatLevel::Medium);
        assert!(ThreatLevel::Medium > ThreatLevel::Low);
    }
}
