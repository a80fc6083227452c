//! 事件规范化器
//!
//! 把各来源的原始 webhook 报文转换为统一事件信封。每个来源有独立的
//! 校验规则：缺字段、非法取值是终态的 [`EngineError::InvalidEvent`]，
//! Discord 身份未绑定是终态的 [`EngineError::UnresolvedIdentity`]——
//! 这两类错误重投多少次都不会成功，调用方应直接拒绝原始报文。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;

use crate::identity::IdentityResolver;
use xp_shared::error::{EngineError, Result};
use xp_shared::events::{Event, EventKind, EventSource, SYSTEM_PROFILE};

pub struct EventNormalizer {
    identity: Arc<dyn IdentityResolver>,
}

impl EventNormalizer {
    pub fn new(identity: Arc<dyn IdentityResolver>) -> Self {
        Self { identity }
    }

    /// 按来源规范化原始报文
    pub async fn normalize(&self, source: EventSource, raw: &Value) -> Result<Event> {
        let event = match source {
            EventSource::Shopify => self.normalize_shopify(raw)?,
            EventSource::Discord => self.normalize_discord(raw).await?,
            EventSource::MagReader => self.normalize_magazine(raw)?,
            EventSource::Ugc => self.normalize_ugc(raw)?,
        };
        debug!(
            event_id = %event.event_id,
            kind = %event.kind,
            profile_id = %event.profile_id,
            "事件已规范化"
        );
        Ok(event)
    }

    /// Shopify 报文有两种形态：带 order_id 的购买、带 drop_id 的商品上新
    fn normalize_shopify(&self, raw: &Value) -> Result<Event> {
        if raw.get("order_id").is_some() {
            let order_id = str_field(raw, "order_id", EventSource::Shopify)?;
            let profile_id = str_field(raw, "profile_id", EventSource::Shopify)?;
            let total = raw
                .get("total")
                .and_then(Value::as_f64)
                .ok_or_else(|| invalid(EventSource::Shopify, "缺少或非法的 total 字段"))?;

            let mut payload = json!({
                "orderId": order_id,
                "total": total,
            });
            if let Some(collection) = raw.get("collection").and_then(Value::as_str) {
                payload["collection"] = json!(collection);
            }

            return Ok(Event::new(
                EventKind::Purchase,
                profile_id,
                EventSource::Shopify,
                Some(order_id.to_string()),
                payload,
                occurred_at(raw, EventSource::Shopify)?,
            ));
        }

        if raw.get("drop_id").is_some() {
            let drop_id = str_field(raw, "drop_id", EventSource::Shopify)?;
            let title = str_field(raw, "title", EventSource::Shopify)?;

            // 上新没有行为主体，挂在保留的系统档案下
            return Ok(Event::new(
                EventKind::ProductDrop,
                SYSTEM_PROFILE,
                EventSource::Shopify,
                Some(drop_id.to_string()),
                json!({ "dropId": drop_id, "title": title }),
                occurred_at(raw, EventSource::Shopify)?,
            ));
        }

        Err(invalid(
            EventSource::Shopify,
            "既无 order_id 也无 drop_id，无法识别报文形态",
        ))
    }

    async fn normalize_discord(&self, raw: &Value) -> Result<Event> {
        let discord_user_id = str_field(raw, "discord_user_id", EventSource::Discord)?;
        let message_id = str_field(raw, "message_id", EventSource::Discord)?;
        let activity = str_field(raw, "activity", EventSource::Discord)?;

        let kind = match activity {
            "message" => EventKind::DiscordMessage,
            "reaction" => EventKind::DiscordReaction,
            other => {
                return Err(invalid(
                    EventSource::Discord,
                    &format!("未知的 activity: {other}"),
                ));
            }
        };

        let profile_id = self
            .identity
            .resolve_discord(discord_user_id)
            .await?
            .ok_or_else(|| EngineError::UnresolvedIdentity {
                event_source: EventSource::Discord.as_str().to_string(),
                external_id: discord_user_id.to_string(),
            })?;

        let mut payload = json!({ "discordUserId": discord_user_id });
        if let Some(channel_id) = raw.get("channel_id").and_then(Value::as_str) {
            payload["channelId"] = json!(channel_id);
        }

        Ok(Event::new(
            kind,
            profile_id,
            EventSource::Discord,
            Some(message_id.to_string()),
            payload,
            occurred_at(raw, EventSource::Discord)?,
        ))
    }

    fn normalize_magazine(&self, raw: &Value) -> Result<Event> {
        let profile_id = str_field(raw, "profile_id", EventSource::MagReader)?;
        let magazine_id = str_field(raw, "magazine_id", EventSource::MagReader)?;
        let action = str_field(raw, "action", EventSource::MagReader)?;

        let mut payload = json!({
            "magazineId": magazine_id,
            "action": action,
        });

        // quiz 用上游答题记录做幂等令牌，read/download 按杂志维度去重
        let (kind, source_ref) = match action {
            "read" => (EventKind::MagazineRead, format!("{magazine_id}:read")),
            "download" => (
                EventKind::MagazineDownload,
                format!("{magazine_id}:download"),
            ),
            "quiz" => {
                let attempt_id = str_field(raw, "attempt_id", EventSource::MagReader)?;
                payload["attemptId"] = json!(attempt_id);
                (EventKind::MagazineQuiz, attempt_id.to_string())
            }
            other => {
                return Err(invalid(
                    EventSource::MagReader,
                    &format!("未知的 action: {other}"),
                ));
            }
        };

        Ok(Event::new(
            kind,
            profile_id,
            EventSource::MagReader,
            Some(source_ref),
            payload,
            occurred_at(raw, EventSource::MagReader)?,
        ))
    }

    fn normalize_ugc(&self, raw: &Value) -> Result<Event> {
        let profile_id = str_field(raw, "profile_id", EventSource::Ugc)?;
        let submission_id = str_field(raw, "submission_id", EventSource::Ugc)?;

        // 只有审核通过的投稿才构成事件
        if raw.get("approved").and_then(Value::as_bool) != Some(true) {
            return Err(invalid(EventSource::Ugc, "投稿未通过审核"));
        }

        Ok(Event::new(
            EventKind::UgcApproved,
            profile_id,
            EventSource::Ugc,
            Some(submission_id.to_string()),
            json!({ "submissionId": submission_id }),
            occurred_at(raw, EventSource::Ugc)?,
        ))
    }
}

fn invalid(source: EventSource, reason: &str) -> EngineError {
    EngineError::InvalidEvent {
        event_source: source.as_str().to_string(),
        reason: reason.to_string(),
    }
}

fn str_field<'a>(raw: &'a Value, name: &str, source: EventSource) -> Result<&'a str> {
    raw.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid(source, &format!("缺少 {name} 字段")))
}

/// 上游时间优先：`created_at`/`occurred_at`（RFC 3339），缺失取当前时间，
/// 存在但无法解析按无效事件处理
fn occurred_at(raw: &Value, source: EventSource) -> Result<DateTime<Utc>> {
    let Some(ts) = raw
        .get("created_at")
        .or_else(|| raw.get("occurred_at"))
        .and_then(Value::as_str)
    else {
        return Ok(Utc::now());
    };

    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid(source, &format!("无法解析时间戳: {ts}")))
}
