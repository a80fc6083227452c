//! 奖励领取
//!
//! 奖励目录由外部维护，引擎负责资格校验与领取记录的生命周期。
//! 同一 (用户, 奖励) 至多存在一条占用中（pending|issued）的记录；
//! 履约失败的记录释放占用，用户可重新领取。

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::ledger::XpLedger;
use crate::model::{ClaimStatus, Reward, RewardClaim};
use crate::store::RewardStore;
use xp_shared::error::{EngineError, Result};

pub struct RewardClaims {
    store: Arc<dyn RewardStore>,
    ledger: Arc<XpLedger>,
}

impl RewardClaims {
    pub fn new(store: Arc<dyn RewardStore>, ledger: Arc<XpLedger>) -> Self {
        Self { store, ledger }
    }

    /// 用户当前可领取的奖励，按等级门槛升序（无门槛的在前）
    pub async fn list_eligible(&self, profile_id: &str) -> Result<Vec<Reward>> {
        let level = self.ledger.state(profile_id).await?.level;

        let mut rewards: Vec<Reward> = self
            .store
            .active_rewards()
            .await?
            .into_iter()
            .filter(|r| r.min_level.is_none_or(|min| level >= min))
            .collect();
        rewards.sort_by_key(|r| (r.min_level.is_some(), r.min_level, r.id.clone()));
        Ok(rewards)
    }

    /// 发起领取
    ///
    /// 校验顺序：奖励存在 → 激活 → 等级达标 → 条件插入领取记录。
    /// 已有占用中的记录时返回该记录（幂等，重复点击不报错不重复发放）。
    pub async fn claim(&self, profile_id: &str, reward_id: &str) -> Result<RewardClaim> {
        let reward = self
            .store
            .reward(reward_id)
            .await?
            .ok_or_else(|| EngineError::RewardNotFound {
                reward_id: reward_id.to_string(),
            })?;

        if !reward.active {
            return Err(EngineError::RewardInactive {
                reward_id: reward_id.to_string(),
            });
        }

        if let Some(required) = reward.min_level {
            let actual = self.ledger.state(profile_id).await?.level;
            if actual < required {
                return Err(EngineError::LevelTooLow {
                    reward_id: reward_id.to_string(),
                    required,
                    actual,
                });
            }
        }

        let outcome = self
            .store
            .insert_claim_if_none_open(RewardClaim::new_pending(profile_id, reward_id))
            .await?;

        if outcome.created() {
            info!(profile_id, reward_id, "领取记录已创建");
        }
        Ok(outcome.into_inner())
    }

    /// 履约方回调：发放成功
    pub async fn mark_issued(&self, claim_id: &str) -> Result<RewardClaim> {
        let claim = self
            .store
            .update_claim_status(claim_id, ClaimStatus::Issued, Some(Utc::now()))
            .await?;
        info!(claim_id, reward_id = %claim.reward_id, "奖励已发放");
        Ok(claim)
    }

    /// 履约方回调：发放失败，释放占用
    pub async fn mark_failed(&self, claim_id: &str) -> Result<RewardClaim> {
        let claim = self
            .store
            .update_claim_status(claim_id, ClaimStatus::Failed, None)
            .await?;
        info!(claim_id, reward_id = %claim.reward_id, "奖励发放失败，占用已释放");
        Ok(claim)
    }
}
