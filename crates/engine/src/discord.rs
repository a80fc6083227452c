//! Discord 同步
//!
//! 引擎对 Discord 只做两件事：按等级同步身份组、发送商品上新公告。
//! HTTP 细节封装在 [`DiscordClient`]，错误分类是这里的核心：
//! 429 映射为带重试下限的 [`EngineError::RateLimited`]，5xx 为瞬态，
//! 其余 4xx 为终态（重试也不会成功）。重试本身由编排器负责，
//! 这一层只分类、不重试。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::store::SyncStateStore;
use xp_shared::config::{DiscordConfig, LevelRole};
use xp_shared::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// DiscordApi — 接口抽象
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DiscordApi: Send + Sync {
    /// 成员当前持有的全部身份组 ID
    async fn member_roles(&self, discord_user_id: &str) -> Result<Vec<String>>;

    async fn add_role(&self, discord_user_id: &str, role_id: &str) -> Result<()>;

    async fn remove_role(&self, discord_user_id: &str, role_id: &str) -> Result<()>;

    async fn post_message(&self, channel_id: &str, content: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// DiscordClient — reqwest 实现
// ---------------------------------------------------------------------------

pub struct DiscordClient {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    guild_id: String,
}

#[derive(Debug, Deserialize)]
struct MemberResponse {
    roles: Vec<String>,
}

impl DiscordClient {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| EngineError::Internal(format!("构建 HTTP 客户端失败: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            guild_id: config.guild_id.clone(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, operation: &str) -> Result<reqwest::Response> {
        let response = request
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await
            .map_err(|e| classify_request_error(e, operation))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        Err(classify_status(status.as_u16(), retry_after, operation))
    }
}

/// 按响应状态码分类错误
///
/// 429 携带 Retry-After（秒）作为重试下限，缺失时保守取 1 秒。
fn classify_status(status: u16, retry_after_seconds: Option<f64>, operation: &str) -> EngineError {
    match status {
        429 => EngineError::RateLimited {
            retry_after: Duration::from_secs_f64(retry_after_seconds.unwrap_or(1.0).max(0.0)),
        },
        500..=599 => EngineError::ExternalService {
            service: "discord".to_string(),
            message: format!("{operation} 返回 {status}"),
        },
        _ => EngineError::Internal(format!("{operation} 返回 {status}，不可重试")),
    }
}

fn classify_request_error(error: reqwest::Error, operation: &str) -> EngineError {
    if error.is_timeout() {
        return EngineError::Timeout {
            operation: operation.to_string(),
        };
    }
    EngineError::ExternalService {
        service: "discord".to_string(),
        message: format!("{operation} 请求失败: {error}"),
    }
}

#[async_trait]
impl DiscordApi for DiscordClient {
    async fn member_roles(&self, discord_user_id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/guilds/{}/members/{discord_user_id}",
            self.api_base, self.guild_id
        );
        let response = self
            .send(self.client.get(&url), "discord.member_roles")
            .await?;
        let member: MemberResponse = response
            .json()
            .await
            .map_err(|e| classify_request_error(e, "discord.member_roles"))?;
        Ok(member.roles)
    }

    async fn add_role(&self, discord_user_id: &str, role_id: &str) -> Result<()> {
        let url = format!(
            "{}/guilds/{}/members/{discord_user_id}/roles/{role_id}",
            self.api_base, self.guild_id
        );
        self.send(self.client.put(&url), "discord.add_role").await?;
        Ok(())
    }

    async fn remove_role(&self, discord_user_id: &str, role_id: &str) -> Result<()> {
        let url = format!(
            "{}/guilds/{}/members/{discord_user_id}/roles/{role_id}",
            self.api_base, self.guild_id
        );
        self.send(self.client.delete(&url), "discord.remove_role")
            .await?;
        Ok(())
    }

    async fn post_message(&self, channel_id: &str, content: &str) -> Result<()> {
        let url = format!("{}/channels/{channel_id}/messages", self.api_base);
        self.send(
            self.client
                .post(&url)
                .json(&serde_json::json!({ "content": content })),
            "discord.post_message",
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RoleSync — 等级身份组同步
// ---------------------------------------------------------------------------

/// 一次同步实际执行的变更
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl RoleDiff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// 按等级同步 Discord 身份组
///
/// 只管理映射表中出现的身份组，用户手动获得的其他身份组不受影响。
/// 同步是差量的：与上次已知状态一致时不发任何请求，
/// 重投同一事件自然成为空操作。
pub struct RoleSync {
    api: Arc<dyn DiscordApi>,
    state: Arc<dyn SyncStateStore>,
    role_map: Vec<LevelRole>,
}

impl RoleSync {
    pub fn new(
        api: Arc<dyn DiscordApi>,
        state: Arc<dyn SyncStateStore>,
        role_map: Vec<LevelRole>,
    ) -> Self {
        Self { api, state, role_map }
    }

    pub async fn sync(
        &self,
        profile_id: &str,
        discord_user_id: &str,
        level: i32,
    ) -> Result<RoleDiff> {
        let managed: HashSet<&str> = self.role_map.iter().map(|r| r.role_id.as_str()).collect();
        let desired: HashSet<String> = self
            .role_map
            .iter()
            .filter(|r| level >= r.min_level)
            .map(|r| r.role_id.clone())
            .collect();

        // 首次同步没有已知状态，从接口拉取真实持有集合
        let current: HashSet<String> = match self.state.known_roles(profile_id).await? {
            Some(known) => known.into_iter().collect(),
            None => self
                .api
                .member_roles(discord_user_id)
                .await?
                .into_iter()
                .filter(|r| managed.contains(r.as_str()))
                .collect(),
        };

        let mut diff = RoleDiff::default();
        for role_id in desired.difference(&current) {
            self.api.add_role(discord_user_id, role_id).await?;
            diff.added.push(role_id.clone());
        }
        for role_id in current.difference(&desired) {
            self.api.remove_role(discord_user_id, role_id).await?;
            diff.removed.push(role_id.clone());
        }

        let mut snapshot: Vec<String> = desired.into_iter().collect();
        snapshot.sort();
        self.state.save_roles(profile_id, snapshot).await?;

        if diff.is_noop() {
            debug!(profile_id, level, "身份组已是目标状态");
        } else {
            info!(
                profile_id,
                level,
                added = ?diff.added,
                removed = ?diff.removed,
                "身份组已同步"
            );
        }
        Ok(diff)
    }
}

// ---------------------------------------------------------------------------
// DropAnnouncer — 商品上新公告
// ---------------------------------------------------------------------------

/// 商品上新公告，每个 drop 至多发送一次
pub struct DropAnnouncer {
    api: Arc<dyn DiscordApi>,
    state: Arc<dyn SyncStateStore>,
    channel_id: String,
}

impl DropAnnouncer {
    pub fn new(
        api: Arc<dyn DiscordApi>,
        state: Arc<dyn SyncStateStore>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            state,
            channel_id: channel_id.into(),
        }
    }

    /// 发送公告，重复调用返回 `false` 且不再发送
    pub async fn announce(&self, drop_id: &str, content: &str) -> Result<bool> {
        if !self.state.mark_announced(drop_id).await? {
            debug!(drop_id, "公告已发送过，跳过");
            return Ok(false);
        }

        self.api.post_message(&self.channel_id, content).await?;
        info!(drop_id, channel_id = %self.channel_id, "上新公告已发送");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use dashmap::DashMap;

    /// 记录调用的 Discord 接口替身
    #[derive(Debug, Default)]
    struct RecordingApi {
        live_roles: DashMap<String, Vec<String>>,
        calls: DashMap<String, Vec<String>>,
    }

    impl RecordingApi {
        fn record(&self, op: &str, detail: String) {
            self.calls.entry(op.to_string()).or_default().push(detail);
        }

        fn call_count(&self, op: &str) -> usize {
            self.calls.get(op).map(|c| c.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl DiscordApi for RecordingApi {
        async fn member_roles(&self, discord_user_id: &str) -> Result<Vec<String>> {
            self.record("member_roles", discord_user_id.to_string());
            Ok(self
                .live_roles
                .get(discord_user_id)
                .map(|r| r.clone())
                .unwrap_or_default())
        }

        async fn add_role(&self, discord_user_id: &str, role_id: &str) -> Result<()> {
            self.record("add_role", format!("{discord_user_id}:{role_id}"));
            Ok(())
        }

        async fn remove_role(&self, discord_user_id: &str, role_id: &str) -> Result<()> {
            self.record("remove_role", format!("{discord_user_id}:{role_id}"));
            Ok(())
        }

        async fn post_message(&self, channel_id: &str, content: &str) -> Result<()> {
            self.record("post_message", format!("{channel_id}:{content}"));
            Ok(())
        }
    }

    fn role_map() -> Vec<LevelRole> {
        vec![
            LevelRole {
                min_level: 2,
                role_id: "role-member".to_string(),
            },
            LevelRole {
                min_level: 4,
                role_id: "role-vip".to_string(),
            },
        ]
    }

    #[test]
    fn test_classify_status() {
        let err = classify_status(429, Some(30.0), "discord.add_role");
        assert!(matches!(
            err,
            EngineError::RateLimited { retry_after } if retry_after == Duration::from_secs(30)
        ));

        // Retry-After 缺失时取保守下限
        assert!(matches!(
            classify_status(429, None, "op"),
            EngineError::RateLimited { retry_after } if retry_after == Duration::from_secs(1)
        ));

        assert!(classify_status(502, None, "op").is_retryable());
        // 403 等业务性 4xx 不可重试
        assert!(!classify_status(403, None, "op").is_retryable());
    }

    #[tokio::test]
    async fn test_first_sync_adds_missing_roles() {
        let api = Arc::new(RecordingApi::default());
        let store = MemoryStore::new();
        let sync = RoleSync::new(api.clone(), store, role_map());

        let diff = sync.sync("p-1", "444", 4).await.unwrap();
        let mut added = diff.added.clone();
        added.sort();
        assert_eq!(added, vec!["role-member", "role-vip"]);
        assert!(diff.removed.is_empty());
        assert_eq!(api.call_count("member_roles"), 1);
    }

    #[tokio::test]
    async fn test_repeat_sync_is_noop() {
        let api = Arc::new(RecordingApi::default());
        let store = MemoryStore::new();
        let sync = RoleSync::new(api.clone(), store, role_map());

        sync.sync("p-1", "444", 2).await.unwrap();
        let diff = sync.sync("p-1", "444", 2).await.unwrap();

        assert!(diff.is_noop());
        // 第二次走已知状态，不再拉取成员信息
        assert_eq!(api.call_count("member_roles"), 1);
        assert_eq!(api.call_count("add_role"), 1);
    }

    #[tokio::test]
    async fn test_unmanaged_roles_untouched() {
        let api = Arc::new(RecordingApi::default());
        api.live_roles.insert(
            "444".to_string(),
            vec!["role-unrelated".to_string(), "role-vip".to_string()],
        );
        let store = MemoryStore::new();
        let sync = RoleSync::new(api.clone(), store, role_map());

        // 2 级：应持有 member，vip 应移除，unrelated 不碰
        let diff = sync.sync("p-1", "444", 2).await.unwrap();
        assert_eq!(diff.added, vec!["role-member"]);
        assert_eq!(diff.removed, vec!["role-vip"]);
        assert_eq!(api.call_count("remove_role"), 1);
    }

    #[tokio::test]
    async fn test_level_drop_removes_roles() {
        let api = Arc::new(RecordingApi::default());
        let store = MemoryStore::new();
        let sync = RoleSync::new(api.clone(), store, role_map());

        sync.sync("p-1", "444", 4).await.unwrap();
        let diff = sync.sync("p-1", "444", 2).await.unwrap();

        assert!(diff.added.is_empty());
        assert_eq!(diff.removed, vec!["role-vip"]);
    }

    #[tokio::test]
    async fn test_announce_once_per_drop() {
        let api = Arc::new(RecordingApi::default());
        let store = MemoryStore::new();
        let announcer = DropAnnouncer::new(api.clone(), store, "chan-1");

        assert!(announcer.announce("drop-12", "新品上架！").await.unwrap());
        assert!(!announcer.announce("drop-12", "新品上架！").await.unwrap());
        assert_eq!(api.call_count("post_message"), 1);
    }
}
