//! 身份解析
//!
//! 用户档案系统是外部协作方，引擎只通过这个 trait 提问三件事：
//! Discord 账号映射到哪个档案、档案绑定了哪个 Discord 账号、
//! 档案当前是否有资格累积经验值（封禁/注销的档案无资格）。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use xp_shared::error::Result;

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Discord 用户 ID 映射到内部档案 ID，未绑定返回 None
    async fn resolve_discord(&self, discord_user_id: &str) -> Result<Option<String>>;

    /// 档案 ID 反查绑定的 Discord 用户 ID，供身份组同步使用
    async fn discord_id_for(&self, profile_id: &str) -> Result<Option<String>>;

    /// 档案当前是否有资格累积经验值
    async fn is_eligible(&self, profile_id: &str) -> Result<bool>;
}

/// 静态映射的身份解析器（测试/开发用）
///
/// 默认所有已注册档案均有资格，可显式标记无资格档案。
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    discord_to_profile: DashMap<String, String>,
    profile_to_discord: DashMap<String, String>,
    ineligible: DashMap<String, ()>,
}

impl StaticIdentityResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind_discord(&self, discord_user_id: &str, profile_id: &str) {
        self.discord_to_profile
            .insert(discord_user_id.to_string(), profile_id.to_string());
        self.profile_to_discord
            .insert(profile_id.to_string(), discord_user_id.to_string());
    }

    pub fn mark_ineligible(&self, profile_id: &str) {
        self.ineligible.insert(profile_id.to_string(), ());
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve_discord(&self, discord_user_id: &str) -> Result<Option<String>> {
        Ok(self
            .discord_to_profile
            .get(discord_user_id)
            .map(|p| p.clone()))
    }

    async fn discord_id_for(&self, profile_id: &str) -> Result<Option<String>> {
        Ok(self.profile_to_discord.get(profile_id).map(|d| d.clone()))
    }

    async fn is_eligible(&self, profile_id: &str) -> Result<bool> {
        Ok(!self.ineligible.contains_key(profile_id))
    }
}
