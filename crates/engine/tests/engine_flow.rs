//! 端到端流程测试
//!
//! 覆盖引擎的关键行为：重投幂等、任务冷却、奖励领取门槛与并发、
//! 限流退避、死信、外部同步的差量语义。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;

use xp_engine::discord::DiscordApi;
use xp_engine::engine::{GamifyEngine, Stores};
use xp_engine::identity::StaticIdentityResolver;
use xp_engine::model::{ClaimStatus, Quest, Reward};
use xp_engine::quest::QuestRule;
use xp_engine::store::memory::MemoryStore;
use xp_engine::{EngineError, EventKind, EventSource, Result};
use xp_shared::config::{AppConfig, LevelRole};
use xp_shared::test_utils::*;

// ---------------------------------------------------------------------------
// 可编程的 Discord 接口替身
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedApi {
    /// 接下来 N 次 add_role 返回 429（Retry-After 50ms）
    rate_limit_next: AtomicU32,
    /// 所有写操作返回 502
    always_fail: std::sync::atomic::AtomicBool,
    add_role_calls: AtomicU32,
    messages: DashMap<String, Vec<String>>,
}

impl ScriptedApi {
    fn check_failures(&self) -> Result<()> {
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(EngineError::ExternalService {
                service: "discord".to_string(),
                message: "502 Bad Gateway".to_string(),
            });
        }
        if self.rate_limit_next.load(Ordering::SeqCst) > 0 {
            self.rate_limit_next.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::RateLimited {
                retry_after: Duration::from_millis(50),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DiscordApi for ScriptedApi {
    async fn member_roles(&self, _discord_user_id: &str) -> Result<Vec<String>> {
        Ok(vec![])
    }

    async fn add_role(&self, _discord_user_id: &str, _role_id: &str) -> Result<()> {
        self.check_failures()?;
        self.add_role_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_role(&self, _discord_user_id: &str, _role_id: &str) -> Result<()> {
        self.check_failures()?;
        Ok(())
    }

    async fn post_message(&self, channel_id: &str, content: &str) -> Result<()> {
        self.check_failures()?;
        self.messages
            .entry(channel_id.to_string())
            .or_default()
            .push(content.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 装配
// ---------------------------------------------------------------------------

struct Fixture {
    store: Arc<MemoryStore>,
    identity: Arc<StaticIdentityResolver>,
    api: Arc<ScriptedApi>,
    engine: GamifyEngine,
}

fn fixture() -> Fixture {
    let (store, stores) = Stores::in_memory();
    let identity = StaticIdentityResolver::new();
    let api = Arc::new(ScriptedApi::default());

    let mut config = AppConfig::default();
    config.direct_xp = AppConfig::default_direct_xp();
    config.discord.announce_channel_id = "chan-news".to_string();
    config.discord.level_roles = vec![LevelRole {
        min_level: 2,
        role_id: "role-member".to_string(),
    }];
    // 测试用快速退避
    config.orchestrator.max_retries = 2;
    config.orchestrator.initial_delay_ms = 1;
    config.orchestrator.max_delay_ms = 10;

    let engine = GamifyEngine::new(&config, stores, identity.clone(), api.clone());
    Fixture {
        store,
        identity,
        api,
        engine,
    }
}

fn purchase_quest(cooldown_days: u32) -> Quest {
    Quest {
        id: "q-purchase".to_string(),
        external_id: "ext-1".to_string(),
        title: "下单有礼".to_string(),
        rule: QuestRule::EventMatch {
            event: EventKind::Purchase,
        },
        xp_reward: 50,
        cooldown_days,
        active: true,
    }
}

// ---------------------------------------------------------------------------
// 场景
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivered_purchase_awards_once() {
    let f = fixture();
    let raw = raw_purchase("p-1", "order-1", 79.0);

    f.engine.ingest(EventSource::Shopify, &raw).await.unwrap();
    f.engine.ingest(EventSource::Shopify, &raw).await.unwrap();

    let state = f.engine.xp_state("p-1").await.unwrap();
    assert_eq!(state.xp_total, 100);
}

#[tokio::test]
async fn quest_cooldown_window() {
    let f = fixture();
    f.store.add_quest(purchase_quest(7));

    let t0 = Utc::now() - chrono::Duration::days(20);

    // 首单：直接 100 + 任务 50
    f.engine
        .ingest(
            EventSource::Shopify,
            &raw_purchase_at("p-1", "order-1", 79.0, t0),
        )
        .await
        .unwrap();
    assert_eq!(f.engine.xp_state("p-1").await.unwrap().xp_total, 150);

    // 一小时后的新订单：冷却中，只有直接经验值
    f.engine
        .ingest(
            EventSource::Shopify,
            &raw_purchase_at("p-1", "order-2", 79.0, t0 + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    assert_eq!(f.engine.xp_state("p-1").await.unwrap().xp_total, 250);

    // 八天后：冷却已过，任务再次奖励
    f.engine
        .ingest(
            EventSource::Shopify,
            &raw_purchase_at("p-1", "order-3", 79.0, t0 + chrono::Duration::days(8)),
        )
        .await
        .unwrap();
    assert_eq!(f.engine.xp_state("p-1").await.unwrap().xp_total, 400);
}

#[tokio::test]
async fn reward_claim_level_gate() {
    let f = fixture();
    f.store.add_reward(Reward {
        id: "r-sticker".to_string(),
        kind: "promo-code".to_string(),
        payload: json!({"code": "XP12"}),
        min_level: Some(2),
        active: true,
    });

    // 0 经验值，1 级，不够门槛
    let err = f.engine.claim_reward("p-1", "r-sticker").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::LevelTooLow {
            required: 2,
            actual: 1,
            ..
        }
    ));

    // 购买升到 2 级后可领取，履约完成后仍占用
    f.engine
        .ingest(EventSource::Shopify, &raw_purchase("p-1", "order-1", 79.0))
        .await
        .unwrap();
    let claim = f.engine.claim_reward("p-1", "r-sticker").await.unwrap();
    assert_eq!(claim.status, ClaimStatus::Pending);

    let issued = f.engine.mark_reward_issued(&claim.id).await.unwrap();
    assert_eq!(issued.status, ClaimStatus::Issued);

    let again = f.engine.claim_reward("p-1", "r-sticker").await.unwrap();
    assert_eq!(again.id, claim.id);
}

#[tokio::test]
async fn concurrent_claims_create_single_record() {
    let f = fixture();
    f.store.add_reward(Reward {
        id: "r-open".to_string(),
        kind: "promo-code".to_string(),
        payload: json!({}),
        min_level: None,
        active: true,
    });
    let engine = Arc::new(f.engine);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.claim_reward("p-1", "r-open").await.unwrap().id })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn rate_limited_sync_retries_after_floor() {
    let f = fixture();
    f.identity.bind_discord("444", "p-1");
    f.api.rate_limit_next.store(1, Ordering::SeqCst);

    let started = std::time::Instant::now();
    let summary = f
        .engine
        .ingest(EventSource::Shopify, &raw_purchase("p-1", "order-1", 79.0))
        .await
        .unwrap();

    assert!(summary.succeeded.contains(&"role-sync".to_string()));
    // Retry-After 50ms 是退避下限（策略本身只有 1ms）
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(f.api.add_role_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_sync_dead_letters_without_blocking_xp() {
    let f = fixture();
    f.identity.bind_discord("444", "p-1");
    f.api.always_fail.store(true, Ordering::SeqCst);

    let summary = f
        .engine
        .ingest(EventSource::Shopify, &raw_purchase("p-1", "order-1", 79.0))
        .await
        .unwrap();

    // 经验值照常入账，同步进入死信
    assert!(summary.succeeded.contains(&"direct-xp".to_string()));
    assert!(summary.dead_lettered.contains(&"role-sync".to_string()));
    assert_eq!(f.engine.xp_state("p-1").await.unwrap().xp_total, 100);

    let dead = f.engine.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].step_name, "role-sync");
    assert_eq!(dead[0].attempt, 2);
}

#[tokio::test]
async fn role_sync_noop_on_redelivery() {
    let f = fixture();
    f.identity.bind_discord("444", "p-1");
    let raw = raw_purchase("p-1", "order-1", 79.0);

    f.engine.ingest(EventSource::Shopify, &raw).await.unwrap();
    f.engine.ingest(EventSource::Shopify, &raw).await.unwrap();

    // 第二次同步差量为空，不再调用接口
    assert_eq!(f.api.add_role_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn product_drop_announced_once() {
    let f = fixture();
    let raw = raw_drop("drop-12", "12 期黑胶");

    f.engine.ingest(EventSource::Shopify, &raw).await.unwrap();
    f.engine.ingest(EventSource::Shopify, &raw).await.unwrap();

    let messages = f.api.messages.get("chan-news").map(|m| m.clone()).unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("12 期黑胶"));

    // 上新事件不给系统档案发经验值
    assert_eq!(f.engine.xp_state("system").await.unwrap().xp_total, 0);
}

#[tokio::test]
async fn unbound_discord_event_rejected() {
    let f = fixture();
    let err = f
        .engine
        .ingest(EventSource::Discord, &raw_discord_message("999", "msg-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnresolvedIdentity { .. }));
}

#[tokio::test]
async fn discord_message_flow_with_identity() {
    let f = fixture();
    f.identity.bind_discord("444", "p-1");

    f.engine
        .ingest(EventSource::Discord, &raw_discord_message("444", "msg-1"))
        .await
        .unwrap();
    // 消息重投同一 message_id，不重复加分
    f.engine
        .ingest(EventSource::Discord, &raw_discord_message("444", "msg-1"))
        .await
        .unwrap();

    assert_eq!(f.engine.xp_state("p-1").await.unwrap().xp_total, 5);
}
