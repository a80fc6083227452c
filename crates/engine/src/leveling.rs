//! 等级曲线
//!
//! 等级完全由累计经验值决定，曲线来自配置。阈值按经验值升序排列，
//! 构造时对等级做单调修正：经验值更高的阈值不会对应更低的等级。

use xp_shared::config::LevelThreshold;

#[derive(Debug, Clone)]
pub struct LevelCurve {
    /// 按 xp_threshold 升序、level 已做单调修正
    thresholds: Vec<LevelThreshold>,
}

impl LevelCurve {
    pub fn new(mut thresholds: Vec<LevelThreshold>) -> Self {
        thresholds.sort_by_key(|t| t.xp_threshold);
        let mut floor = i32::MIN;
        for t in &mut thresholds {
            floor = floor.max(t.level);
            t.level = floor;
        }
        Self { thresholds }
    }

    /// 累计经验值对应的等级；未达到任何阈值（或曲线为空）时为 1 级
    pub fn level_for_xp(&self, xp_total: i64) -> i32 {
        self.thresholds
            .iter()
            .take_while(|t| t.xp_threshold <= xp_total)
            .last()
            .map(|t| t.level)
            .unwrap_or(1)
    }
}
