//! 测试工具模块
//!
//! 提供测试所需的原始报文构造器与唯一标识生成器。
//! 原始报文的字段布局与各来源的 webhook 形态保持一致，
//! 供规范化器相关测试直接复用。

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

/// 生成唯一的测试用户 ID
pub fn test_profile_id() -> String {
    format!("test-profile-{}", Uuid::new_v4())
}

/// 生成唯一的测试订单号
pub fn test_order_id() -> String {
    format!("order-{}", Uuid::new_v4())
}

/// Shopify 购买事件原始报文
pub fn raw_purchase(profile_id: &str, order_id: &str, total: f64) -> Value {
    json!({
        "order_id": order_id,
        "profile_id": profile_id,
        "total": total,
        "collection": "issue-12",
    })
}

/// 带上游时间戳的购买报文，用于冷却窗口类测试
pub fn raw_purchase_at(
    profile_id: &str,
    order_id: &str,
    total: f64,
    created_at: DateTime<Utc>,
) -> Value {
    let mut raw = raw_purchase(profile_id, order_id, total);
    raw["created_at"] = json!(created_at.to_rfc3339());
    raw
}

/// Shopify 商品上新报文
pub fn raw_drop(drop_id: &str, title: &str) -> Value {
    json!({
        "drop_id": drop_id,
        "title": title,
    })
}

/// Discord 消息事件原始报文
pub fn raw_discord_message(discord_user_id: &str, message_id: &str) -> Value {
    json!({
        "discord_user_id": discord_user_id,
        "message_id": message_id,
        "activity": "message",
        "channel_id": "chan-general",
    })
}

/// 杂志阅读器事件原始报文，action ∈ {read, quiz, download}
pub fn raw_magazine(
    profile_id: &str,
    magazine_id: &str,
    action: &str,
    attempt_id: Option<&str>,
) -> Value {
    let mut raw = json!({
        "profile_id": profile_id,
        "magazine_id": magazine_id,
        "action": action,
    });
    if let Some(attempt_id) = attempt_id {
        raw["attempt_id"] = json!(attempt_id);
    }
    raw
}

/// UGC 审核事件原始报文
pub fn raw_ugc(profile_id: &str, submission_id: &str, approved: bool) -> Value {
    json!({
        "profile_id": profile_id,
        "submission_id": submission_id,
        "approved": approved,
    })
}
