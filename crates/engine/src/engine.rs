//! 引擎装配
//!
//! [`GamifyEngine`] 是库的唯一入口：webhook/API 层完成鉴权与解包后
//! 把原始报文交给 [`GamifyEngine::ingest`]，查询与领取走其余方法。
//! 装配时注入存储、身份解析器与 Discord 接口实现，
//! 其余组件在构造函数内按配置接线。

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::discord::{DiscordApi, DropAnnouncer, RoleSync};
use crate::identity::IdentityResolver;
use crate::ledger::{AwardXp, XpLedger};
use crate::leveling::LevelCurve;
use crate::model::{Reward, RewardClaim, StepInvocation, XpSource, XpState};
use crate::normalizer::EventNormalizer;
use crate::orchestrator::{DispatchSummary, Orchestrator, StepHandler};
use crate::quest::QuestEvaluator;
use crate::rewards::RewardClaims;
use crate::steps::{DirectXpStep, DropAnnounceStep, QuestStep, RoleSyncStep};
use crate::store::memory::MemoryStore;
use crate::store::postgres::PgStore;
use crate::store::{InvocationStore, LedgerStore, QuestStore, RewardStore, SyncStateStore};
use xp_shared::config::{AppConfig, DatabaseConfig};
use xp_shared::database::Database;
use xp_shared::error::Result;
use xp_shared::events::EventSource;

/// 按所有权边界拆分的存储句柄
///
/// 单机部署时五个句柄通常指向同一个存储实例，拆分是为了让
/// 每个组件只看到自己的那部分契约。
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub quests: Arc<dyn QuestStore>,
    pub rewards: Arc<dyn RewardStore>,
    pub invocations: Arc<dyn InvocationStore>,
    pub sync: Arc<dyn SyncStateStore>,
}

impl Stores {
    /// 内存存储（测试/开发），返回底层实例便于注入任务与奖励
    pub fn in_memory() -> (Arc<MemoryStore>, Self) {
        let store = MemoryStore::new();
        let stores = Self {
            ledger: store.clone(),
            quests: store.clone(),
            rewards: store.clone(),
            invocations: store.clone(),
            sync: store.clone(),
        };
        (store, stores)
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            ledger: store.clone(),
            quests: store.clone(),
            rewards: store.clone(),
            invocations: store.clone(),
            sync: store,
        }
    }

    /// 按配置建池并做一次健康检查，失败时尽早暴露而不是等首个事件
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let db = Database::connect(config).await?;
        db.health_check().await?;
        Ok(Self::postgres(db.pool().clone()))
    }
}

pub struct GamifyEngine {
    normalizer: EventNormalizer,
    orchestrator: Orchestrator,
    ledger: Arc<XpLedger>,
    rewards: RewardClaims,
    invocations: Arc<dyn InvocationStore>,
}

impl GamifyEngine {
    pub fn new(
        config: &AppConfig,
        stores: Stores,
        identity: Arc<dyn IdentityResolver>,
        discord: Arc<dyn DiscordApi>,
    ) -> Self {
        let curve = LevelCurve::new(config.leveling.thresholds.clone());
        let ledger = Arc::new(XpLedger::new(stores.ledger.clone(), curve));

        let evaluator = Arc::new(QuestEvaluator::new(
            stores.quests.clone(),
            ledger.clone(),
            identity.clone(),
        ));
        let role_sync = Arc::new(RoleSync::new(
            discord.clone(),
            stores.sync.clone(),
            config.discord.level_roles.clone(),
        ));
        let announcer = Arc::new(DropAnnouncer::new(
            discord,
            stores.sync.clone(),
            config.discord.announce_channel_id.clone(),
        ));

        let steps: Vec<Arc<dyn StepHandler>> = vec![
            Arc::new(DirectXpStep::from_config(
                ledger.clone(),
                identity.clone(),
                &config.direct_xp,
            )),
            Arc::new(QuestStep::new(evaluator)),
            Arc::new(RoleSyncStep::new(
                role_sync,
                ledger.clone(),
                identity.clone(),
            )),
            Arc::new(DropAnnounceStep::new(announcer)),
        ];

        let orchestrator = Orchestrator::new(
            steps,
            stores.invocations.clone(),
            config.orchestrator.retry_policy(),
            config.orchestrator.step_timeout(),
        );

        let rewards = RewardClaims::new(stores.rewards, ledger.clone());
        Self {
            normalizer: EventNormalizer::new(identity),
            orchestrator,
            ledger,
            rewards,
            invocations: stores.invocations,
        }
    }

    /// 摄入一条原始报文：规范化后分发到所有匹配的步骤
    ///
    /// 规范化失败（无效报文、身份未绑定）是终态错误，直接返回；
    /// 步骤层面的失败不会让整个摄入失败，体现在返回的分发结果里。
    pub async fn ingest(&self, source: EventSource, raw: &Value) -> Result<DispatchSummary> {
        let event = self.normalizer.normalize(source, raw).await?;
        let summary = self.orchestrator.dispatch(&event).await?;
        info!(
            event_id = %summary.event_id,
            kind = %event.kind,
            succeeded = summary.succeeded.len(),
            dead_lettered = summary.dead_lettered.len(),
            "事件摄入完成"
        );
        Ok(summary)
    }

    /// 用户当前的经验值状态
    pub async fn xp_state(&self, profile_id: &str) -> Result<XpState> {
        self.ledger.state(profile_id).await
    }

    /// 从台账重建派生状态（运维修复用）
    pub async fn rebuild_xp_state(&self, profile_id: &str) -> Result<XpState> {
        self.ledger.recompute_state(profile_id).await
    }

    /// 管理员手工调整经验值，绕过事件管线
    pub async fn admin_adjust(
        &self,
        profile_id: &str,
        xp_delta: i64,
        reason: &str,
    ) -> Result<XpState> {
        let outcome = self
            .ledger
            .award(AwardXp {
                profile_id: profile_id.to_string(),
                source: XpSource::Admin,
                source_ref: None,
                xp_delta,
                reason: reason.to_string(),
            })
            .await?;
        Ok(outcome.state)
    }

    pub async fn eligible_rewards(&self, profile_id: &str) -> Result<Vec<Reward>> {
        self.rewards.list_eligible(profile_id).await
    }

    pub async fn claim_reward(&self, profile_id: &str, reward_id: &str) -> Result<RewardClaim> {
        self.rewards.claim(profile_id, reward_id).await
    }

    pub async fn mark_reward_issued(&self, claim_id: &str) -> Result<RewardClaim> {
        self.rewards.mark_issued(claim_id).await
    }

    pub async fn mark_reward_failed(&self, claim_id: &str) -> Result<RewardClaim> {
        self.rewards.mark_failed(claim_id).await
    }

    /// 死信列表，供运维巡检与手工补偿
    pub async fn dead_letters(&self) -> Result<Vec<StepInvocation>> {
        self.invocations.dead_lettered().await
    }
}
