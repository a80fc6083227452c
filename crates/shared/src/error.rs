//! 统一错误处理模块
//!
//! 定义引擎的完整错误分类，使用 thiserror 提供良好的错误信息。
//! 错误分为终态（不重试，立即暴露给调用方）与瞬态（仅由编排器按退避策略重试）两类，
//! `is_retryable` 是编排器判断是否重试的唯一依据。

use std::time::Duration;

use thiserror::Error;

/// 引擎错误类型
#[derive(Debug, Error)]
pub enum EngineError {
    // ==================== 规范化阶段（终态） ====================
    // 字段不能叫 source：thiserror 会把它当作错误链的 source()
    #[error("无效事件: source={event_source}, 原因: {reason}")]
    InvalidEvent { event_source: String, reason: String },

    #[error("无法解析外部身份: source={event_source}, external_id={external_id}")]
    UnresolvedIdentity {
        event_source: String,
        external_id: String,
    },

    // ==================== 业务校验（终态） ====================
    #[error("用户当前不可获得经验值: profile_id={profile_id}")]
    Ineligible { profile_id: String },

    #[error("奖励未找到: reward_id={reward_id}")]
    RewardNotFound { reward_id: String },

    #[error("奖励未激活: reward_id={reward_id}")]
    RewardInactive { reward_id: String },

    #[error("等级不足: reward_id={reward_id}, 需要 {required}, 当前 {actual}")]
    LevelTooLow {
        reward_id: String,
        required: i32,
        actual: i32,
    },

    #[error("任务规则评估失败: {0}")]
    RuleEval(String),

    // ==================== 外部调用（瞬态） ====================
    #[error("外部接口限流: {retry_after:?} 后可重试")]
    RateLimited { retry_after: Duration },

    #[error("操作超时: {operation}")]
    Timeout { operation: String },

    #[error("外部服务错误: {service} - {message}")]
    ExternalService { service: String, message: String },

    // ==================== 存储（瞬态） ====================
    #[error("存储错误: {0}")]
    Store(#[from] sqlx::Error),

    // ==================== 通用 ====================
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// 获取错误码，用于日志与调用方的分支判断
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEvent { .. } => "INVALID_EVENT",
            Self::UnresolvedIdentity { .. } => "UNRESOLVED_IDENTITY",
            Self::Ineligible { .. } => "INELIGIBLE",
            Self::RewardNotFound { .. } => "REWARD_NOT_FOUND",
            Self::RewardInactive { .. } => "REWARD_INACTIVE",
            Self::LevelTooLow { .. } => "LEVEL_TOO_LOW",
            Self::RuleEval(_) => "RULE_EVAL_FAILED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 仅网络抖动、限流、超时、存储故障这类瞬态错误可重试；
    /// 校验类错误重试也不会成功，直接向上传播。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::ExternalService { .. }
                | Self::Store(_)
        )
    }

    /// 限流错误携带的最小等待时间
    ///
    /// 编排器计算下次重试间隔时以此为下限，避免在窗口内再次撞限。
    pub fn retry_after_floor(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = EngineError::LevelTooLow {
            reward_id: "r-1".to_string(),
            required: 3,
            actual: 2,
        };
        assert_eq!(err.code(), "LEVEL_TOO_LOW");
    }

    #[test]
    fn test_terminal_errors_not_retryable() {
        let cases = vec![
            EngineError::InvalidEvent {
                event_source: "shopify".to_string(),
                reason: "缺少 order_id".to_string(),
            },
            EngineError::UnresolvedIdentity {
                event_source: "discord".to_string(),
                external_id: "123".to_string(),
            },
            EngineError::Ineligible {
                profile_id: "p-1".to_string(),
            },
            EngineError::RewardInactive {
                reward_id: "r-1".to_string(),
            },
            EngineError::RuleEval("字段类型不匹配".to_string()),
        ];

        for err in cases {
            assert!(!err.is_retryable(), "{} 不应可重试", err.code());
        }
    }

    #[test]
    fn test_transient_errors_retryable() {
        let rate_limited = EngineError::RateLimited {
            retry_after: Duration::from_secs(30),
        };
        assert!(rate_limited.is_retryable());
        assert_eq!(
            rate_limited.retry_after_floor(),
            Some(Duration::from_secs(30))
        );

        let timeout = EngineError::Timeout {
            operation: "discord.add_role".to_string(),
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.retry_after_floor(), None);

        let store = EngineError::Store(sqlx::Error::PoolTimedOut);
        assert!(store.is_retryable());
    }
}
