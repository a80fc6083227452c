//! 处理步骤
//!
//! 编排器分发的四个标准步骤：直接经验值发放、任务评估、
//! 身份组同步、上新公告。步骤自身全部幂等——重复执行
//! 落在台账三元组、差量同步或公告标记上，不产生额外效果。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::discord::{DropAnnouncer, RoleSync};
use crate::identity::IdentityResolver;
use crate::ledger::{AwardXp, XpLedger};
use crate::orchestrator::StepHandler;
use crate::quest::QuestEvaluator;
use xp_shared::error::Result;
use xp_shared::events::{Event, EventKind};

// ---------------------------------------------------------------------------
// DirectXpStep — 按事件类型直接发放经验值
// ---------------------------------------------------------------------------

pub struct DirectXpStep {
    ledger: Arc<XpLedger>,
    identity: Arc<dyn IdentityResolver>,
    xp_table: HashMap<EventKind, i64>,
}

impl DirectXpStep {
    pub fn new(
        ledger: Arc<XpLedger>,
        identity: Arc<dyn IdentityResolver>,
        xp_table: HashMap<EventKind, i64>,
    ) -> Self {
        Self {
            ledger,
            identity,
            xp_table,
        }
    }

    /// 从配置表构建，无法识别的事件类型名跳过并告警
    pub fn from_config(
        ledger: Arc<XpLedger>,
        identity: Arc<dyn IdentityResolver>,
        table: &HashMap<String, i64>,
    ) -> Self {
        let mut xp_table = HashMap::with_capacity(table.len());
        for (name, delta) in table {
            match EventKind::parse(name) {
                Some(kind) => {
                    xp_table.insert(kind, *delta);
                }
                None => warn!(kind = %name, "直接经验值表包含未知事件类型，已忽略"),
            }
        }
        Self::new(ledger, identity, xp_table)
    }
}

#[async_trait]
impl StepHandler for DirectXpStep {
    fn name(&self) -> &'static str {
        "direct-xp"
    }

    fn handles(&self, kind: EventKind) -> bool {
        self.xp_table.contains_key(&kind)
    }

    async fn run(&self, event: &Event, _idempotency_key: &str) -> Result<()> {
        let Some(&xp_delta) = self.xp_table.get(&event.kind) else {
            return Ok(());
        };

        // 无资格档案不发放，但事件本身处理成功
        if !self.identity.is_eligible(&event.profile_id).await? {
            warn!(
                profile_id = %event.profile_id,
                kind = %event.kind,
                "档案无资格，跳过直接经验值"
            );
            return Ok(());
        }

        self.ledger
            .award(AwardXp {
                profile_id: event.profile_id.clone(),
                source: event.source.into(),
                source_ref: event.source_ref.clone(),
                xp_delta,
                reason: format!("事件奖励: {}", event.kind),
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QuestStep — 任务评估
// ---------------------------------------------------------------------------

pub struct QuestStep {
    evaluator: Arc<QuestEvaluator>,
}

impl QuestStep {
    pub fn new(evaluator: Arc<QuestEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl StepHandler for QuestStep {
    fn name(&self) -> &'static str {
        "quest-evaluation"
    }

    fn handles(&self, _kind: EventKind) -> bool {
        // 任何事件都可能触发任务，预筛在评估器内部按规则完成
        true
    }

    async fn run(&self, event: &Event, _idempotency_key: &str) -> Result<()> {
        let outcomes = self.evaluator.evaluate(event).await?;
        debug!(
            event_id = %event.event_id,
            evaluated = outcomes.len(),
            "任务评估完成"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RoleSyncStep — 等级身份组同步
// ---------------------------------------------------------------------------

pub struct RoleSyncStep {
    sync: Arc<RoleSync>,
    ledger: Arc<XpLedger>,
    identity: Arc<dyn IdentityResolver>,
}

impl RoleSyncStep {
    pub fn new(
        sync: Arc<RoleSync>,
        ledger: Arc<XpLedger>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            sync,
            ledger,
            identity,
        }
    }
}

#[async_trait]
impl StepHandler for RoleSyncStep {
    fn name(&self) -> &'static str {
        "role-sync"
    }

    fn handles(&self, kind: EventKind) -> bool {
        // 上新没有行为主体，不触发身份组同步
        kind != EventKind::ProductDrop
    }

    async fn run(&self, event: &Event, _idempotency_key: &str) -> Result<()> {
        let Some(discord_user_id) = self.identity.discord_id_for(&event.profile_id).await? else {
            debug!(profile_id = %event.profile_id, "未绑定 Discord，跳过身份组同步");
            return Ok(());
        };

        let state = self.ledger.state(&event.profile_id).await?;
        self.sync
            .sync(&event.profile_id, &discord_user_id, state.level)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DropAnnounceStep — 商品上新公告
// ---------------------------------------------------------------------------

pub struct DropAnnounceStep {
    announcer: Arc<DropAnnouncer>,
}

impl DropAnnounceStep {
    pub fn new(announcer: Arc<DropAnnouncer>) -> Self {
        Self { announcer }
    }
}

#[async_trait]
impl StepHandler for DropAnnounceStep {
    fn name(&self) -> &'static str {
        "drop-announce"
    }

    fn handles(&self, kind: EventKind) -> bool {
        kind == EventKind::ProductDrop
    }

    async fn run(&self, event: &Event, _idempotency_key: &str) -> Result<()> {
        let drop_id = event
            .source_ref
            .as_deref()
            .unwrap_or(event.event_id.as_str());
        let title = event
            .payload
            .get("title")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("新品");

        self.announcer
            .announce(drop_id, &format!("🛍️ 新品上架：{title}"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::DiscordApi;
    use crate::identity::StaticIdentityResolver;
    use crate::leveling::LevelCurve;
    use crate::model::XpSource;
    use crate::store::memory::MemoryStore;
    use crate::store::{LedgerStore, SyncStateStore};
    use chrono::Utc;
    use dashmap::DashMap;
    use serde_json::json;
    use xp_shared::config::{AppConfig, LevelRole, LevelingConfig};
    use xp_shared::events::EventSource;

    #[derive(Debug, Default)]
    struct NullApi {
        messages: DashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl DiscordApi for NullApi {
        async fn member_roles(&self, _discord_user_id: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn add_role(&self, _discord_user_id: &str, _role_id: &str) -> Result<()> {
            Ok(())
        }

        async fn remove_role(&self, _discord_user_id: &str, _role_id: &str) -> Result<()> {
            Ok(())
        }

        async fn post_message(&self, channel_id: &str, content: &str) -> Result<()> {
            self.messages
                .entry(channel_id.to_string())
                .or_default()
                .push(content.to_string());
            Ok(())
        }
    }

    fn ledger(store: Arc<MemoryStore>) -> Arc<XpLedger> {
        Arc::new(XpLedger::new(
            store,
            LevelCurve::new(LevelingConfig::default().thresholds),
        ))
    }

    fn purchase(profile: &str, order: &str) -> Event {
        Event::new(
            EventKind::Purchase,
            profile,
            EventSource::Shopify,
            Some(order.to_string()),
            json!({"orderId": order, "total": 80.0}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_direct_xp_awards_per_table() {
        let store = MemoryStore::new();
        let identity = StaticIdentityResolver::new();
        let step = DirectXpStep::from_config(
            ledger(store.clone()),
            identity,
            &AppConfig::default_direct_xp(),
        );

        assert!(step.handles(EventKind::Purchase));
        assert!(!step.handles(EventKind::ProductDrop));

        step.run(&purchase("p-1", "order-1"), "key").await.unwrap();
        let entries = store.entries_for("p-1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].xp_delta, 100);
        assert_eq!(entries[0].source, XpSource::Shopify);
    }

    #[tokio::test]
    async fn test_direct_xp_idempotent_across_redelivery() {
        let store = MemoryStore::new();
        let identity = StaticIdentityResolver::new();
        let step = DirectXpStep::from_config(
            ledger(store.clone()),
            identity,
            &AppConfig::default_direct_xp(),
        );

        // 重投后 event_id 不同，但 source_ref 相同
        step.run(&purchase("p-1", "order-1"), "k1").await.unwrap();
        step.run(&purchase("p-1", "order-1"), "k2").await.unwrap();

        assert_eq!(store.entries_for("p-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_xp_skips_ineligible() {
        let store = MemoryStore::new();
        let identity = StaticIdentityResolver::new();
        identity.mark_ineligible("p-banned");
        let step = DirectXpStep::from_config(
            ledger(store.clone()),
            identity,
            &AppConfig::default_direct_xp(),
        );

        // 无资格不发放，但步骤成功（不进入重试）
        step.run(&purchase("p-banned", "order-1"), "key")
            .await
            .unwrap();
        assert!(store.entries_for("p-banned").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_sync_skips_unbound_profile() {
        let store = MemoryStore::new();
        let identity = StaticIdentityResolver::new();
        let api = Arc::new(NullApi::default());
        let sync = Arc::new(RoleSync::new(
            api,
            store.clone(),
            vec![LevelRole {
                min_level: 2,
                role_id: "role-member".to_string(),
            }],
        ));
        let step = RoleSyncStep::new(sync, ledger(store.clone()), identity);

        step.run(&purchase("p-unbound", "order-1"), "key")
            .await
            .unwrap();
        // 未绑定时不应写入同步状态
        assert!(store.known_roles("p-unbound").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drop_announce_contains_title() {
        let store = MemoryStore::new();
        let api = Arc::new(NullApi::default());
        let announcer = Arc::new(DropAnnouncer::new(api.clone(), store, "chan-news"));
        let step = DropAnnounceStep::new(announcer);

        let event = Event::new(
            EventKind::ProductDrop,
            "system",
            EventSource::Shopify,
            Some("drop-12".to_string()),
            json!({"dropId": "drop-12", "title": "12 期黑胶"}),
            Utc::now(),
        );
        step.run(&event, "key").await.unwrap();
        step.run(&event, "key").await.unwrap();

        let messages = api.messages.get("chan-news").map(|m| m.clone()).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("12 期黑胶"));
    }
}
