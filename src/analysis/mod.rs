// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 行为分析系统 (Analysis System)
///
/// - Zone:                 多边形监控区域与命中判定
/// - ActivityType/Event:   行为类型、威胁等级与事件
/// - ZoneActivityAnalyzer: 按轨迹维护计时状态的规则引擎
pub mod activity;
pub mod analyzer;
pub mod zone;

pub use activity::{classify_threat, ActivityType, Event, Evidence, ThreatContext, ThreatLevel};
pub use analyzer::{EventLog, ZoneActivityAnalyzer};
pub use zone::{Zone, ZoneType};
