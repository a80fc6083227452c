//! 核心数据模型
//!
//! 定义引擎拥有的持久实体：经验值台账、派生状态、任务与完成记录、
//! 奖励与领取记录、步骤调用记录。所有权边界：台账行与派生状态归台账组件，
//! 完成记录归任务评估器，领取记录归奖励管理器，调用记录归编排器；
//! 跨组件只通过各组件的公开操作产生影响，不直接改写他人实体。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quest::rules::QuestRule;
use xp_shared::events::EventSource;

// ---------------------------------------------------------------------------
// XpSource — 经验值来源
// ---------------------------------------------------------------------------

/// 经验值来源，参与台账幂等三元组 `(profile_id, source, source_ref)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum XpSource {
    Shopify,
    Discord,
    MagReader,
    Ugc,
    /// 任务奖励，source_ref 为 `quest_id:冷却桶`
    Quest,
    /// 管理员手工调整，绕过资格校验的覆盖路径
    Admin,
}

impl XpSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shopify => "shopify",
            Self::Discord => "discord",
            Self::MagReader => "mag-reader",
            Self::Ugc => "ugc",
            Self::Quest => "quest",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shopify" => Some(Self::Shopify),
            "discord" => Some(Self::Discord),
            "mag-reader" => Some(Self::MagReader),
            "ugc" => Some(Self::Ugc),
            "quest" => Some(Self::Quest),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl From<EventSource> for XpSource {
    fn from(source: EventSource) -> Self {
        match source {
            EventSource::Shopify => Self::Shopify,
            EventSource::Discord => Self::Discord,
            EventSource::MagReader => Self::MagReader,
            EventSource::Ugc => Self::Ugc,
        }
    }
}

impl std::fmt::Display for XpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// 台账与派生状态
// ---------------------------------------------------------------------------

/// 经验值台账行
///
/// 只追加，永不更新或删除。`source_ref` 非空时三元组
/// `(profile_id, source, source_ref)` 全局唯一——这是整个系统的幂等原语。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpLedgerEntry {
    pub id: String,
    pub profile_id: String,
    pub source: XpSource,
    pub source_ref: Option<String>,
    /// 允许为负（处罚/冲正），总值不做隐式钳制
    pub xp_delta: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl XpLedgerEntry {
    pub fn new(
        profile_id: impl Into<String>,
        source: XpSource,
        source_ref: Option<String>,
        xp_delta: i64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            profile_id: profile_id.into(),
            source,
            source_ref,
            xp_delta,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

/// 派生的经验值状态缓存
///
/// 永远可以从台账重新计算得出，不是任何事实的来源，可安全重建。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpState {
    pub profile_id: String,
    pub xp_total: i64,
    pub level: i32,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 任务
// ---------------------------------------------------------------------------

/// 任务定义
///
/// 任务是配置数据，由外部创建/编辑，引擎只读取激活的任务。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quest {
    pub id: String,
    /// 外部配置系统中的标识
    pub external_id: String,
    pub title: String,
    pub rule: QuestRule,
    pub xp_reward: i64,
    /// 冷却天数，0 表示每次满足都可奖励
    pub cooldown_days: u32,
    pub active: bool,
}

/// 任务完成记录
///
/// 每次奖励一行，永不修改；冷却窗口内存在记录即阻止再次奖励。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestCompletion {
    pub profile_id: String,
    pub quest_id: String,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 奖励与领取
// ---------------------------------------------------------------------------

/// 奖励目录项，外部维护
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub id: String,
    /// 奖励类型标识（如 discord-role、promo-code），履约方按类型处理
    pub kind: String,
    pub payload: serde_json::Value,
    /// None 表示无等级门槛，对所有人开放
    pub min_level: Option<i32>,
    pub active: bool,
}

/// 领取记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Pending,
    Issued,
    Failed,
}

impl ClaimStatus {
    /// pending 与 issued 视为"占用中"：同一 (profile, reward)
    /// 至多存在一条占用中的领取记录
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Issued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Issued => "ISSUED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "ISSUED" => Some(Self::Issued),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// 奖励领取记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardClaim {
    pub id: String,
    pub profile_id: String,
    pub reward_id: String,
    pub status: ClaimStatus,
    pub issued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RewardClaim {
    pub fn new_pending(profile_id: impl Into<String>, reward_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            profile_id: profile_id.into(),
            reward_id: reward_id.into(),
            status: ClaimStatus::Pending,
            issued_at: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// 步骤调用记录
// ---------------------------------------------------------------------------

/// 步骤调用状态机
///
/// `pending → running → {succeeded | retrying → running（循环）| dead_lettered}`，
/// 终态为 succeeded 与 dead_lettered。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Retrying,
    DeadLettered,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Retrying => "RETRYING",
            Self::DeadLettered => "DEAD_LETTERED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "RETRYING" => Some(Self::Retrying),
            "DEAD_LETTERED" => Some(Self::DeadLettered),
            _ => None,
        }
    }
}

/// 单个 (事件, 步骤) 对的调用记录，仅编排器可写
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInvocation {
    pub event_id: String,
    pub step_name: String,
    /// 已完成的重试轮次（首次执行为 0）
    pub attempt: u32,
    pub status: InvocationStatus,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StepInvocation {
    pub fn pending(event_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            step_name: step_name.into(),
            attempt: 0,
            status: InvocationStatus::Pending,
            last_error: None,
            next_retry_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn running(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self.status = InvocationStatus::Running;
        self.next_retry_at = None;
        self.updated_at = Utc::now();
        self
    }

    pub fn succeeded(mut self) -> Self {
        self.status = InvocationStatus::Succeeded;
        self.last_error = None;
        self.next_retry_at = None;
        self.updated_at = Utc::now();
        self
    }

    pub fn retrying(mut self, error: &str, next_retry_at: DateTime<Utc>) -> Self {
        self.status = InvocationStatus::Retrying;
        self.last_error = Some(error.to_string());
        self.next_retry_at = Some(next_retry_at);
        self.updated_at = Utc::now();
        self
    }

    pub fn dead_lettered(mut self, error: &str) -> Self {
        self.status = InvocationStatus::DeadLettered;
        self.last_error = Some(error.to_string());
        self.next_retry_at = None;
        self.updated_at = Utc::now();
        self
    }
}
