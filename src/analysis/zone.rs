// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 监控区域 (多边形)

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::activity::ActivityType;
use crate::detection::types::Point;

/// 区域类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    /// 普通监控区 (徘徊、遗留物等)
    Monitored,
    /// 禁区 (闯入即告警)
    Restricted,
}

/// 监控区域配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    /// 有序多边形顶点 (帧坐标)
    pub points: Vec<Point>,
    pub zone_type: ZoneType,
    /// 该区域订阅的行为类型
    pub activities: BTreeSet<ActivityType>,
}

impl Zone {
    pub fn new(
        name: impl Into<String>,
        points: Vec<Point>,
        zone_type: ZoneType,
        activities: impl IntoIterator<Item = ActivityType>,
    ) -> Self {
        Self {
            name: name.into(),
            points,
            zone_type,
            activities: activities.into_iter().collect(),
        }
    }

    /// 轴对齐矩形区域
    pub fn rect(
        name: impl Into<String>,
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        zone_type: ZoneType,
        activities: impl IntoIterator<Item = ActivityType>,
    ) -> Self {
        let points = vec![
            Point::new(x1, y1),
            Point::new(x2, y1),
            Point::new(x2, y2),
            Point::new(x1, y2),
        ];
        Self::new(name, points, zone_type, activities)
    }

    pub fn subscribes(&self, activity: ActivityType) -> bool {
        self.activities.contains(&activity)
    }

    pub fn is_restricted(&self) -> bool {
        self.zone_type == ZoneType::Restricted
    }

    /// 点是否严格位于多边形内部 (射线法; 边界上的点视为外部)
    pub fn contains(&self, p: &Point) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }

        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[j];
            if on_segment(p, &a, &b) {
                return false;
            }
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// 多边形面积 (鞋带公式)
    pub fn area(&self) -> f32 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            sum += a.x * b.y - b.x * a.y;
        }
        (sum / 2.0).abs()
    }

    /// 配置合法性检查, 返回不合法原因
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("zone name is empty".into());
        }
        if self.points.len() < 3 {
            return Err(format!("polygon needs at least 3 points, got {}", self.points.len()));
        }
        if self.points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err("polygon has non-finite coordinates".into());
        }
        if self.area() <= f32::EPSILON {
            return Err("polygon has zero area".into());
        }
        if self.activities.is_empty() {
            return Err("zone subscribes to no activity".into());
        }
        Ok(())
    }
}

fn on_segment(p: &Point, a: &Point, b: &Point) -> bool {
    const EPS: f32 = 1e-4;
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > EPS * (1.0 + a.distance(b)) {
        return false;
    }
    p.x >= a.x.min(b.x) - EPS
        && p.x <= a.x.max(b.x) + EPS
        && p.y >= a.y.min(b.y) - EPS
        && p.y <= a.y.max(b.y) + EPS
}
