//! 任务评估器
//!
//! 对单个规范事件评估所有激活任务，发放满足任务的经验值奖励。
//! 奖励发放经过台账的幂等三元组（source_ref 为 `任务ID:冷却桶`），
//! 因此同一事件重投、同一冷却桶内的多个事件都只奖励一次——
//! 冷却检查本身只是快路径，正确性不依赖它。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::identity::IdentityResolver;
use crate::ledger::{AwardXp, XpLedger};
use crate::model::{Quest, QuestCompletion, XpSource};
use crate::store::QuestStore;
use xp_shared::error::Result;
use xp_shared::events::Event;

/// 单个任务的评估结果
#[derive(Debug, Clone)]
pub struct QuestOutcome {
    pub quest_id: String,
    pub title: String,
    pub status: QuestOutcomeStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuestOutcomeStatus {
    /// 本次事件触发奖励
    Awarded { xp_delta: i64 },
    /// 规则满足但同一冷却桶已奖励过（幂等命中）
    AlreadyAwarded,
    /// 规则满足但冷却窗口未过
    Cooldown,
    /// 规则不满足
    NotMatched,
    /// 档案无资格，不发放
    Ineligible,
    /// 规则求值失败（配置错误）
    Failed(String),
}

pub struct QuestEvaluator {
    quests: Arc<dyn QuestStore>,
    ledger: Arc<XpLedger>,
    identity: Arc<dyn IdentityResolver>,
}

impl QuestEvaluator {
    pub fn new(
        quests: Arc<dyn QuestStore>,
        ledger: Arc<XpLedger>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            quests,
            ledger,
            identity,
        }
    }

    /// 对事件评估所有激活任务
    ///
    /// 规则求值失败记录为该任务的 `Failed` 结果，不影响其他任务；
    /// 存储错误向上传播，由编排器按瞬态失败重试。
    pub async fn evaluate(&self, event: &Event) -> Result<Vec<QuestOutcome>> {
        let candidates: Vec<Quest> = self
            .quests
            .active_quests()
            .await?
            .into_iter()
            .filter(|q| q.rule.event_kinds().contains(&event.kind))
            .collect();

        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let eligible = self.identity.is_eligible(&event.profile_id).await?;
        let ctx = event.rule_context();
        let counters = self.prefetch_counters(&event.profile_id, &candidates).await?;

        let mut outcomes = Vec::with_capacity(candidates.len());
        for quest in candidates {
            let status = if !eligible {
                QuestOutcomeStatus::Ineligible
            } else {
                match quest.rule.matches(event.kind, &ctx, &counters) {
                    Ok(false) => QuestOutcomeStatus::NotMatched,
                    Ok(true) => self.try_award(&quest, event).await?,
                    Err(e) => {
                        warn!(quest_id = %quest.id, error = %e, "任务规则求值失败");
                        QuestOutcomeStatus::Failed(e.to_string())
                    }
                }
            };
            outcomes.push(QuestOutcome {
                quest_id: quest.id,
                title: quest.title,
                status,
            });
        }
        Ok(outcomes)
    }

    /// 预取所有候选任务引用的计数器，规则求值保持同步
    async fn prefetch_counters(
        &self,
        profile_id: &str,
        candidates: &[Quest],
    ) -> Result<HashMap<String, i64>> {
        let names: HashSet<String> = candidates
            .iter()
            .flat_map(|q| q.rule.counter_names())
            .collect();

        let mut counters = HashMap::with_capacity(names.len());
        for name in names {
            let value = self.quests.counter_value(profile_id, &name).await?;
            counters.insert(name, value);
        }
        Ok(counters)
    }

    async fn try_award(&self, quest: &Quest, event: &Event) -> Result<QuestOutcomeStatus> {
        // 冷却快路径：窗口内已有完成记录直接拒绝，省一次条件插入
        if quest.cooldown_days > 0
            && let Some(last) = self
                .quests
                .latest_completion(&event.profile_id, &quest.id)
                .await?
            && last.completed_at + Duration::days(quest.cooldown_days as i64) > event.occurred_at
        {
            return Ok(QuestOutcomeStatus::Cooldown);
        }

        let outcome = self
            .ledger
            .award(AwardXp {
                profile_id: event.profile_id.clone(),
                source: XpSource::Quest,
                source_ref: Some(self.cooldown_ref(quest, event)),
                xp_delta: quest.xp_reward,
                reason: format!("任务完成: {}", quest.title),
            })
            .await?;

        if !outcome.created {
            return Ok(QuestOutcomeStatus::AlreadyAwarded);
        }

        self.quests
            .insert_completion(QuestCompletion {
                profile_id: event.profile_id.clone(),
                quest_id: quest.id.clone(),
                completed_at: event.occurred_at,
            })
            .await?;

        info!(
            quest_id = %quest.id,
            profile_id = %event.profile_id,
            xp_delta = quest.xp_reward,
            "任务奖励已发放"
        );
        Ok(QuestOutcomeStatus::Awarded {
            xp_delta: quest.xp_reward,
        })
    }

    /// 冷却桶引用：同一桶内的所有事件共享同一个台账三元组。
    /// 无冷却的任务用事件 ID 做引用，每个事件独立奖励。
    fn cooldown_ref(&self, quest: &Quest, event: &Event) -> String {
        if quest.cooldown_days == 0 {
            return format!("{}:{}", quest.id, event.event_id);
        }
        let bucket_seconds = quest.cooldown_days as i64 * 86_400;
        let bucket = event.occurred_at.timestamp().div_euclid(bucket_seconds);
        format!("{}:{}", quest.id, bucket)
    }
}
