//! 事件模型
//!
//! 定义所有外部来源事件经规范化后的统一信封格式与事件类型分类。
//! 信封一经规范化即不可变，后续组件只读取、不修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 无行为主体事件（如商品上新）使用的保留用户标识
pub const SYSTEM_PROFILE: &str = "system";

// ---------------------------------------------------------------------------
// EventSource — 事件来源
// ---------------------------------------------------------------------------

/// 事件来源系统
///
/// 每个来源有独立的原始报文格式，由规范化器按来源校验；
/// 来源同时参与经验值台账的幂等三元组 `(profile_id, source, source_ref)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    #[serde(rename = "shopify")]
    Shopify,
    #[serde(rename = "discord")]
    Discord,
    #[serde(rename = "mag-reader")]
    MagReader,
    #[serde(rename = "ugc")]
    Ugc,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shopify => "shopify",
            Self::Discord => "discord",
            Self::MagReader => "mag-reader",
            Self::Ugc => "ugc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shopify" => Some(Self::Shopify),
            "discord" => Some(Self::Discord),
            "mag-reader" => Some(Self::MagReader),
            "ugc" => Some(Self::Ugc),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EventKind — 事件类型
// ---------------------------------------------------------------------------

/// 事件类型枚举
///
/// 按业务域划分为四类：商城、社区、杂志、UGC。
/// 分类信息用于路由事件到对应的处理步骤，以及任务规则的事件类型预筛。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    // 商城类事件 — 来自 Shopify webhook
    Purchase,
    ProductDrop,

    // 社区类事件 — 来自 Discord bot
    DiscordMessage,
    DiscordReaction,

    // 杂志类事件 — 来自杂志阅读器
    MagazineRead,
    MagazineQuiz,
    MagazineDownload,

    // UGC 类事件 — 用户投稿审核通过
    UgcApproved,
}

impl EventKind {
    /// 商城类事件涉及订单流转，source_ref 为订单号或 drop 标识
    pub fn is_commerce(&self) -> bool {
        matches!(self, Self::Purchase | Self::ProductDrop)
    }

    /// 社区类事件反映 Discord 活跃度，身份需要经过外部解析
    pub fn is_discord(&self) -> bool {
        matches!(self, Self::DiscordMessage | Self::DiscordReaction)
    }

    /// 杂志类事件来自阅读器，是任务触发最常见的来源
    pub fn is_magazine(&self) -> bool {
        matches!(
            self,
            Self::MagazineRead | Self::MagazineQuiz | Self::MagazineDownload
        )
    }

    /// UGC 类事件在外部审核通过后才会进入引擎
    pub fn is_ugc(&self) -> bool {
        matches!(self, Self::UgcApproved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "PURCHASE",
            Self::ProductDrop => "PRODUCT_DROP",
            Self::DiscordMessage => "DISCORD_MESSAGE",
            Self::DiscordReaction => "DISCORD_REACTION",
            Self::MagazineRead => "MAGAZINE_READ",
            Self::MagazineQuiz => "MAGAZINE_QUIZ",
            Self::MagazineDownload => "MAGAZINE_DOWNLOAD",
            Self::UgcApproved => "UGC_APPROVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PURCHASE" => Some(Self::Purchase),
            "PRODUCT_DROP" => Some(Self::ProductDrop),
            "DISCORD_MESSAGE" => Some(Self::DiscordMessage),
            "DISCORD_REACTION" => Some(Self::DiscordReaction),
            "MAGAZINE_READ" => Some(Self::MagazineRead),
            "MAGAZINE_QUIZ" => Some(Self::MagazineQuiz),
            "MAGAZINE_DOWNLOAD" => Some(Self::MagazineDownload),
            "UGC_APPROVED" => Some(Self::UgcApproved),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event — 规范化事件信封
// ---------------------------------------------------------------------------

/// 规范化事件信封
///
/// 所有进入引擎的事件都规范化为此信封，确保：
/// - `event_id`（UUID v7）串联同一事件在各步骤的调用记录
/// - `source_ref` 携带上游自身的幂等令牌（订单号、消息 ID、答题记录 ID），
///   部分类型可能缺失
/// - `payload` 以 JSON 承载来源特定的业务数据，避免为每种事件定义独立结构
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// 事件唯一标识（UUID v7），时间有序便于索引
    pub event_id: String,
    /// 事件类型
    pub kind: EventKind,
    /// 内部用户标识（规范化时已完成外部身份解析）
    pub profile_id: String,
    /// 事件来源系统
    pub source: EventSource,
    /// 上游幂等令牌，参与台账唯一三元组
    pub source_ref: Option<String>,
    /// 事件业务数据（JSON 对象，不同事件类型携带不同字段）
    pub payload: serde_json::Value,
    /// 事件发生时间（上游时间优先，缺失时取规范化时间）
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// 构建新事件，自动生成 UUID v7 作为 event_id
    pub fn new(
        kind: EventKind,
        profile_id: impl Into<String>,
        source: EventSource,
        source_ref: Option<String>,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            kind,
            profile_id: profile_id.into(),
            source,
            source_ref,
            payload,
            occurred_at,
        }
    }

    /// 将事件转换为任务规则的评估上下文 JSON
    ///
    /// 规则评估需要一个扁平化的 JSON 对象。此方法将信封元数据
    /// （kind、profile_id、source）与业务 payload 合并到同一层级，
    /// 使规则可以直接引用 `total` 或 `collection` 等字段。
    pub fn rule_context(&self) -> serde_json::Value {
        let mut context = serde_json::json!({
            "event_id": self.event_id,
            "kind": self.kind,
            "profile_id": self.profile_id,
            "source": self.source,
            "occurred_at": self.occurred_at.to_rfc3339(),
        });

        if let serde_json::Value::Object(payload_map) = &self.payload
            && let serde_json::Value::Object(ref mut ctx_map) = context
        {
            for (key, value) in payload_map {
                ctx_map.insert(key.clone(), value.clone());
            }
        }

        context
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
