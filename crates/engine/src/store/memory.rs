//! 内存存储
//!
//! 使用 DashMap 实现的高并发内存存储，适用于测试和开发环境。
//! 条件插入的原子性依赖 DashMap entry 持有的分片锁：
//! 同一 key 的"检查 + 插入"在锁内完成，并发调用串行通过。

use dashmap::DashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{InsertOutcome, InvocationStore, LedgerStore, QuestStore, RewardStore, SyncStateStore};
use crate::model::{
    ClaimStatus, Quest, QuestCompletion, Reward, RewardClaim, StepInvocation, XpLedgerEntry,
    XpState,
};
use xp_shared::error::{EngineError, Result};

/// 内存存储
///
/// 克隆共享底层数据，可在多个组件间自由传递。
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<XpLedgerEntry>>,
    states: DashMap<String, XpState>,
    quests: DashMap<String, Quest>,
    completions: DashMap<(String, String), Vec<QuestCompletion>>,
    counters: DashMap<(String, String), i64>,
    rewards: DashMap<String, Reward>,
    claims: DashMap<String, RewardClaim>,
    /// (profile_id, reward_id) -> 占用中的领取记录 ID
    open_claims: DashMap<(String, String), String>,
    invocations: DashMap<(String, String), StepInvocation>,
    roles: DashMap<String, Vec<String>>,
    announced: DashMap<String, ()>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注入任务配置（测试/开发用）
    pub fn add_quest(&self, quest: Quest) {
        self.quests.insert(quest.id.clone(), quest);
    }

    /// 注入奖励目录项（测试/开发用）
    pub fn add_reward(&self, reward: Reward) {
        self.rewards.insert(reward.id.clone(), reward);
    }

    /// 设置外部计数器的当前值（测试/开发用）
    pub fn set_counter(&self, profile_id: &str, counter: &str, value: i64) {
        self.counters
            .insert((profile_id.to_string(), counter.to_string()), value);
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_entry(&self, entry: XpLedgerEntry) -> Result<InsertOutcome<XpLedgerEntry>> {
        let mut rows = self.entries.entry(entry.profile_id.clone()).or_default();

        // 分片锁内完成查重与追加，保证条件插入的原子性
        if let Some(ref source_ref) = entry.source_ref
            && let Some(existing) = rows
                .iter()
                .find(|e| super::same_ledger_key(e, &entry.profile_id, entry.source, source_ref))
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        rows.push(entry.clone());
        Ok(InsertOutcome::Created(entry))
    }

    async fn entries_for(&self, profile_id: &str) -> Result<Vec<XpLedgerEntry>> {
        Ok(self
            .entries
            .get(profile_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn save_state(&self, state: XpState) -> Result<()> {
        self.states.insert(state.profile_id.clone(), state);
        Ok(())
    }

    async fn state_for(&self, profile_id: &str) -> Result<Option<XpState>> {
        Ok(self.states.get(profile_id).map(|s| s.clone()))
    }
}

#[async_trait]
impl QuestStore for MemoryStore {
    async fn active_quests(&self) -> Result<Vec<Quest>> {
        Ok(self
            .quests
            .iter()
            .filter(|q| q.active)
            .map(|q| q.clone())
            .collect())
    }

    async fn latest_completion(
        &self,
        profile_id: &str,
        quest_id: &str,
    ) -> Result<Option<QuestCompletion>> {
        let key = (profile_id.to_string(), quest_id.to_string());
        Ok(self
            .completions
            .get(&key)
            .and_then(|rows| rows.iter().max_by_key(|c| c.completed_at).cloned()))
    }

    async fn insert_completion(&self, completion: QuestCompletion) -> Result<()> {
        let key = (completion.profile_id.clone(), completion.quest_id.clone());
        self.completions.entry(key).or_default().push(completion);
        Ok(())
    }

    async fn counter_value(&self, profile_id: &str, counter: &str) -> Result<i64> {
        let key = (profile_id.to_string(), counter.to_string());
        Ok(self.counters.get(&key).map(|v| *v).unwrap_or(0))
    }
}

#[async_trait]
impl RewardStore for MemoryStore {
    async fn reward(&self, reward_id: &str) -> Result<Option<Reward>> {
        Ok(self.rewards.get(reward_id).map(|r| r.clone()))
    }

    async fn active_rewards(&self) -> Result<Vec<Reward>> {
        Ok(self
            .rewards
            .iter()
            .filter(|r| r.active)
            .map(|r| r.clone())
            .collect())
    }

    async fn open_claim(&self, profile_id: &str, reward_id: &str) -> Result<Option<RewardClaim>> {
        let key = (profile_id.to_string(), reward_id.to_string());
        let Some(claim_id) = self.open_claims.get(&key).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self
            .claims
            .get(&claim_id)
            .map(|c| c.clone())
            .filter(|c| c.status.is_open()))
    }

    async fn insert_claim_if_none_open(
        &self,
        claim: RewardClaim,
    ) -> Result<InsertOutcome<RewardClaim>> {
        use dashmap::mapref::entry::Entry;

        let key = (claim.profile_id.clone(), claim.reward_id.clone());

        // entry 锁保证"检查占用 + 写入"原子完成，并发领取恰好一方创建成功
        match self.open_claims.entry(key) {
            Entry::Occupied(mut slot) => {
                let existing = self.claims.get(slot.get()).map(|c| c.clone());
                match existing {
                    Some(existing) if existing.status.is_open() => {
                        Ok(InsertOutcome::Existing(existing))
                    }
                    // 槽位指向已失败的记录，允许重新领取
                    _ => {
                        self.claims.insert(claim.id.clone(), claim.clone());
                        slot.insert(claim.id.clone());
                        Ok(InsertOutcome::Created(claim))
                    }
                }
            }
            Entry::Vacant(slot) => {
                self.claims.insert(claim.id.clone(), claim.clone());
                slot.insert(claim.id.clone());
                Ok(InsertOutcome::Created(claim))
            }
        }
    }

    async fn update_claim_status(
        &self,
        claim_id: &str,
        status: ClaimStatus,
        issued_at: Option<DateTime<Utc>>,
    ) -> Result<RewardClaim> {
        let mut claim = self
            .claims
            .get_mut(claim_id)
            .ok_or_else(|| EngineError::Internal(format!("领取记录不存在: {claim_id}")))?;

        claim.status = status;
        claim.issued_at = issued_at;
        let updated = claim.clone();
        drop(claim);

        // 失败的记录释放占用槽位
        if status == ClaimStatus::Failed {
            let key = (updated.profile_id.clone(), updated.reward_id.clone());
            self.open_claims
                .remove_if(&key, |_, slot_id| slot_id == claim_id);
        }

        Ok(updated)
    }
}

#[async_trait]
impl InvocationStore for MemoryStore {
    async fn record(&self, invocation: StepInvocation) -> Result<()> {
        let key = (invocation.event_id.clone(), invocation.step_name.clone());
        self.invocations.insert(key, invocation);
        Ok(())
    }

    async fn get(&self, event_id: &str, step_name: &str) -> Result<Option<StepInvocation>> {
        let key = (event_id.to_string(), step_name.to_string());
        Ok(self.invocations.get(&key).map(|i| i.clone()))
    }

    async fn dead_lettered(&self) -> Result<Vec<StepInvocation>> {
        Ok(self
            .invocations
            .iter()
            .filter(|i| i.status == crate::model::InvocationStatus::DeadLettered)
            .map(|i| i.clone())
            .collect())
    }
}

#[async_trait]
impl SyncStateStore for MemoryStore {
    async fn known_roles(&self, profile_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self.roles.get(profile_id).map(|r| r.clone()))
    }

    async fn save_roles(&self, profile_id: &str, roles: Vec<String>) -> Result<()> {
        self.roles.insert(profile_id.to_string(), roles);
        Ok(())
    }

    async fn mark_announced(&self, drop_id: &str) -> Result<bool> {
        Ok(self.announced.insert(drop_id.to_string(), ()).is_none())
    }
}
