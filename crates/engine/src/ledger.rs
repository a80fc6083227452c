//! 经验值台账
//!
//! 台账是经验值的唯一事实来源，所有写入都经过条件插入：
//! 同一逻辑奖励（幂等三元组相同）无论投递多少次，只产生一行。
//! 派生状态（总值、等级）在每次成功写入后重算并缓存。

use std::sync::Arc;

use tracing::{debug, info};

use crate::leveling::LevelCurve;
use crate::model::{XpLedgerEntry, XpSource, XpState};
use crate::store::LedgerStore;
use xp_shared::error::Result;

/// 一次加分请求
#[derive(Debug, Clone)]
pub struct AwardXp {
    pub profile_id: String,
    pub source: XpSource,
    /// None 的行不参与幂等约束（管理员手工调整等）
    pub source_ref: Option<String>,
    pub xp_delta: i64,
    pub reason: String,
}

/// 加分结果
#[derive(Debug, Clone)]
pub struct AwardOutcome {
    pub entry: XpLedgerEntry,
    /// false 表示幂等命中，本次调用未产生新行
    pub created: bool,
    /// 加分后的派生状态
    pub state: XpState,
}

pub struct XpLedger {
    store: Arc<dyn LedgerStore>,
    curve: LevelCurve,
}

impl XpLedger {
    pub fn new(store: Arc<dyn LedgerStore>, curve: LevelCurve) -> Self {
        Self { store, curve }
    }

    /// 条件加分
    ///
    /// 重复投递同一逻辑奖励返回 `created: false` 与已有行，状态不变。
    pub async fn award(&self, award: AwardXp) -> Result<AwardOutcome> {
        let entry = XpLedgerEntry::new(
            award.profile_id.clone(),
            award.source,
            award.source_ref,
            award.xp_delta,
            award.reason,
        );

        let outcome = self.store.insert_entry(entry).await?;
        let created = outcome.created();
        let entry = outcome.into_inner();

        let state = if created {
            let state = self.recompute_state(&award.profile_id).await?;
            info!(
                profile_id = %award.profile_id,
                source = %entry.source,
                xp_delta = entry.xp_delta,
                xp_total = state.xp_total,
                level = state.level,
                "经验值已入账"
            );
            state
        } else {
            debug!(
                profile_id = %award.profile_id,
                source = %entry.source,
                source_ref = ?entry.source_ref,
                "幂等命中，跳过加分"
            );
            self.state(&award.profile_id).await?
        };

        Ok(AwardOutcome { entry, created, state })
    }

    /// 从台账全量重算派生状态并写回缓存
    pub async fn recompute_state(&self, profile_id: &str) -> Result<XpState> {
        let entries = self.store.entries_for(profile_id).await?;
        let xp_total: i64 = entries.iter().map(|e| e.xp_delta).sum();

        let state = XpState {
            profile_id: profile_id.to_string(),
            xp_total,
            level: self.curve.level_for_xp(xp_total),
            updated_at: chrono::Utc::now(),
        };
        self.store.save_state(state.clone()).await?;
        Ok(state)
    }

    /// 读取派生状态，缓存缺失时重算
    pub async fn state(&self, profile_id: &str) -> Result<XpState> {
        match self.store.state_for(profile_id).await? {
            Some(state) => Ok(state),
            None => self.recompute_state(profile_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use xp_shared::config::LevelingConfig;

    fn ledger(store: Arc<MemoryStore>) -> XpLedger {
        XpLedger::new(store, LevelCurve::new(LevelingConfig::default().thresholds))
    }

    fn purchase(profile: &str, order: &str, delta: i64) -> AwardXp {
        AwardXp {
            profile_id: profile.to_string(),
            source: XpSource::Shopify,
            source_ref: Some(order.to_string()),
            xp_delta: delta,
            reason: "购买奖励".to_string(),
        }
    }

    #[tokio::test]
    async fn test_award_updates_state_and_level() {
        let store = MemoryStore::new();
        let ledger = ledger(store);

        let outcome = ledger.award(purchase("p-1", "order-1", 100)).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.state.xp_total, 100);
        assert_eq!(outcome.state.level, 2);
    }

    #[tokio::test]
    async fn test_duplicate_award_is_noop() {
        let store = MemoryStore::new();
        let ledger = ledger(store);

        ledger.award(purchase("p-1", "order-1", 100)).await.unwrap();
        let dup = ledger.award(purchase("p-1", "order-1", 100)).await.unwrap();

        assert!(!dup.created);
        assert_eq!(dup.state.xp_total, 100);
    }

    #[tokio::test]
    async fn test_award_without_ref_accumulates() {
        let store = MemoryStore::new();
        let ledger = ledger(store);

        let admin = AwardXp {
            profile_id: "p-1".to_string(),
            source: XpSource::Admin,
            source_ref: None,
            xp_delta: 50,
            reason: "手工调整".to_string(),
        };
        ledger.award(admin.clone()).await.unwrap();
        let second = ledger.award(admin).await.unwrap();

        assert!(second.created);
        assert_eq!(second.state.xp_total, 100);
    }

    #[tokio::test]
    async fn test_negative_delta_reduces_total() {
        let store = MemoryStore::new();
        let ledger = ledger(store);

        ledger.award(purchase("p-1", "order-1", 100)).await.unwrap();
        let outcome = ledger
            .award(AwardXp {
                profile_id: "p-1".to_string(),
                source: XpSource::Admin,
                source_ref: Some("refund-order-1".to_string()),
                xp_delta: -100,
                reason: "订单退款冲正".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.state.xp_total, 0);
        assert_eq!(outcome.state.level, 1);
    }

    #[tokio::test]
    async fn test_state_rebuilds_missing_cache() {
        let store = MemoryStore::new();
        let ledger = ledger(store);

        let state = ledger.state("p-unknown").await.unwrap();
        assert_eq!(state.xp_total, 0);
        assert_eq!(state.level, 1);
    }
}
