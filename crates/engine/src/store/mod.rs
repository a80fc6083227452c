//! 持久存储抽象
//!
//! 引擎不拥有存储引擎本身，只依赖这些 trait 表达的契约。
//! 关键契约是三条唯一性约束上的原子"不存在才插入"语义：
//! 台账三元组、任务完成对、领取记录对。两次并发投递同一逻辑奖励时，
//! 恰好一方创建成功，另一方观察到已存在——这是无锁正确性的基础。
//!
//! 提供两个实现：[`memory::MemoryStore`]（DashMap，测试/开发）与
//! [`postgres::PgStore`]（sqlx + 唯一部分索引 + ON CONFLICT）。

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    ClaimStatus, Quest, QuestCompletion, Reward, RewardClaim, StepInvocation, XpLedgerEntry,
    XpSource, XpState,
};
use xp_shared::error::Result;

/// 条件插入结果
///
/// 幂等重投时 `Existing` 是预期的成功结果，不是错误。
#[derive(Debug, Clone)]
pub enum InsertOutcome<T> {
    /// 本次调用创建了记录
    Created(T),
    /// 记录已存在，返回已有记录
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Created(v) | Self::Existing(v) => v,
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerStore — 台账与派生状态（归台账组件）
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// 条件插入台账行
    ///
    /// `source_ref` 非空且同三元组已有记录时返回 `Existing(已有行)`；
    /// `source_ref` 为空的行不参与唯一性约束，总是创建。
    async fn insert_entry(&self, entry: XpLedgerEntry) -> Result<InsertOutcome<XpLedgerEntry>>;

    /// 读取某用户的全部台账行
    async fn entries_for(&self, profile_id: &str) -> Result<Vec<XpLedgerEntry>>;

    /// 保存派生状态缓存（覆盖写，缓存可随时重建）
    async fn save_state(&self, state: XpState) -> Result<()>;

    /// 读取派生状态缓存
    async fn state_for(&self, profile_id: &str) -> Result<Option<XpState>>;
}

// ---------------------------------------------------------------------------
// QuestStore — 任务配置与完成记录（归任务评估器）
// ---------------------------------------------------------------------------

#[async_trait]
pub trait QuestStore: Send + Sync {
    /// 读取所有激活的任务
    async fn active_quests(&self) -> Result<Vec<Quest>>;

    /// 某用户对某任务最近一次的完成记录
    async fn latest_completion(
        &self,
        profile_id: &str,
        quest_id: &str,
    ) -> Result<Option<QuestCompletion>>;

    /// 写入完成记录（台账三元组已保证同一冷却桶只会成功一次）
    async fn insert_completion(&self, completion: QuestCompletion) -> Result<()>;

    /// 外部维护的累计计数器，供阈值型规则使用
    async fn counter_value(&self, profile_id: &str, counter: &str) -> Result<i64>;
}

// ---------------------------------------------------------------------------
// RewardStore — 奖励目录与领取记录（归奖励管理器）
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RewardStore: Send + Sync {
    async fn reward(&self, reward_id: &str) -> Result<Option<Reward>>;

    async fn active_rewards(&self) -> Result<Vec<Reward>>;

    /// 某 (profile, reward) 当前占用中（pending|issued）的领取记录
    async fn open_claim(&self, profile_id: &str, reward_id: &str) -> Result<Option<RewardClaim>>;

    /// 条件插入领取记录：已有占用中的记录时返回 `Existing(已有记录)`
    async fn insert_claim_if_none_open(
        &self,
        claim: RewardClaim,
    ) -> Result<InsertOutcome<RewardClaim>>;

    /// 履约回调的状态迁移
    async fn update_claim_status(
        &self,
        claim_id: &str,
        status: ClaimStatus,
        issued_at: Option<DateTime<Utc>>,
    ) -> Result<RewardClaim>;
}

// ---------------------------------------------------------------------------
// InvocationStore — 步骤调用记录（仅编排器可见）
// ---------------------------------------------------------------------------

#[async_trait]
pub trait InvocationStore: Send + Sync {
    /// 写入/覆盖 (event_id, step_name) 的调用记录
    async fn record(&self, invocation: StepInvocation) -> Result<()>;

    async fn get(&self, event_id: &str, step_name: &str) -> Result<Option<StepInvocation>>;

    /// 所有死信记录，供运维巡检
    async fn dead_lettered(&self) -> Result<Vec<StepInvocation>>;
}

// ---------------------------------------------------------------------------
// SyncStateStore — 外部同步的已知状态（归外部同步包装器）
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// 最近一次同步后的身份组集合，None 表示从未同步过
    async fn known_roles(&self, profile_id: &str) -> Result<Option<Vec<String>>>;

    async fn save_roles(&self, profile_id: &str, roles: Vec<String>) -> Result<()>;

    /// 标记 drop 已公告；返回 true 表示首次标记（应发送公告）
    async fn mark_announced(&self, drop_id: &str) -> Result<bool>;
}

/// 辅助函数：判断台账行是否命中幂等三元组
pub(crate) fn same_ledger_key(entry: &XpLedgerEntry, profile_id: &str, source: XpSource, source_ref: &str) -> bool {
    entry.profile_id == profile_id
        && entry.source == source
        && entry.source_ref.as_deref() == Some(source_ref)
}
