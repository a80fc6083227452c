//! 工作流编排器
//!
//! 事件进入引擎后由编排器分发到各处理步骤。每个 (事件, 步骤) 对
//! 有独立的调用记录与状态机，互不影响：一个步骤死信不妨碍
//! 其他步骤成功。重试只发生在这一层——步骤实现遇到瞬态错误
//! 直接向上返回，由编排器按指数退避重试，限流错误的
//! Retry-After 作为退避下限。

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::model::{InvocationStatus, StepInvocation};
use crate::store::InvocationStore;
use xp_shared::error::Result;
use xp_shared::events::{Event, EventKind};
use xp_shared::retry::RetryPolicy;

/// 稳定的步骤幂等键
///
/// 同一 (事件, 步骤) 对无论重试多少次得到同一个键，
/// 步骤实现可将其透传给下游接口做请求去重。
pub fn idempotency_key(event_id: &str, step_name: &str) -> String {
    let digest = Sha256::digest(format!("{event_id}:{step_name}").as_bytes());
    let mut key = String::with_capacity(64);
    for byte in digest {
        let _ = write!(key, "{byte:02x}");
    }
    key
}

// ---------------------------------------------------------------------------
// StepHandler — 处理步骤抽象
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StepHandler: Send + Sync {
    /// 步骤名，进入调用记录主键，必须稳定
    fn name(&self) -> &'static str;

    /// 是否处理该类型的事件
    fn handles(&self, kind: EventKind) -> bool;

    /// 执行一次步骤逻辑
    ///
    /// 实现必须幂等：同一事件重复执行不产生额外效果。
    /// 瞬态错误直接返回，不要在步骤内部重试。
    async fn run(&self, event: &Event, idempotency_key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// 单个事件的分发结果
#[derive(Debug, Clone)]
pub struct DispatchSummary {
    pub event_id: String,
    /// 本次（或此前）已成功的步骤
    pub succeeded: Vec<String>,
    /// 因调用记录已是成功终态而跳过的步骤
    pub skipped: Vec<String>,
    /// 进入死信的步骤
    pub dead_lettered: Vec<String>,
}

enum StepResult {
    Succeeded,
    Skipped,
    DeadLettered,
}

pub struct Orchestrator {
    steps: Vec<Arc<dyn StepHandler>>,
    invocations: Arc<dyn InvocationStore>,
    policy: RetryPolicy,
    step_timeout: std::time::Duration,
}

impl Orchestrator {
    pub fn new(
        steps: Vec<Arc<dyn StepHandler>>,
        invocations: Arc<dyn InvocationStore>,
        policy: RetryPolicy,
        step_timeout: std::time::Duration,
    ) -> Self {
        Self {
            steps,
            invocations,
            policy,
            step_timeout,
        }
    }

    /// 分发事件到所有匹配的步骤
    ///
    /// 步骤按注册顺序依次执行，后序步骤能看到前序步骤的写入
    /// （身份组同步读取直接发放后的等级）。一个步骤死信不阻断
    /// 后续步骤；调用记录的存储错误向上传播（记录不可靠时
    /// 继续执行会破坏 exactly-once 保证）。
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary {
            event_id: event.event_id.clone(),
            succeeded: vec![],
            skipped: vec![],
            dead_lettered: vec![],
        };

        for step in self.steps.iter().filter(|s| s.handles(event.kind)) {
            match self.run_step(step.as_ref(), event).await? {
                StepResult::Succeeded => summary.succeeded.push(step.name().to_string()),
                StepResult::Skipped => summary.skipped.push(step.name().to_string()),
                StepResult::DeadLettered => summary.dead_lettered.push(step.name().to_string()),
            }
        }
        Ok(summary)
    }

    async fn run_step(&self, step: &dyn StepHandler, event: &Event) -> Result<StepResult> {
        // 终态调用记录不再执行：成功直接跳过，死信保留给运维处置，
        // 重投不得覆盖死信记录重新跑一遍
        if let Some(prev) = self.invocations.get(&event.event_id, step.name()).await? {
            match prev.status {
                InvocationStatus::Succeeded => return Ok(StepResult::Skipped),
                InvocationStatus::DeadLettered => return Ok(StepResult::DeadLettered),
                _ => {}
            }
        }

        let key = idempotency_key(&event.event_id, step.name());
        let mut invocation = StepInvocation::pending(&event.event_id, step.name());
        self.invocations.record(invocation.clone()).await?;

        let mut attempt: u32 = 0;
        loop {
            invocation = invocation.running(attempt);
            self.invocations.record(invocation.clone()).await?;

            let outcome = match tokio::time::timeout(self.step_timeout, step.run(event, &key)).await
            {
                Ok(result) => result,
                Err(_) => Err(xp_shared::error::EngineError::Timeout {
                    operation: step.name().to_string(),
                }),
            };

            match outcome {
                Ok(()) => {
                    invocation = invocation.succeeded();
                    self.invocations.record(invocation).await?;
                    info!(
                        event_id = %event.event_id,
                        step = step.name(),
                        attempt,
                        "步骤执行成功"
                    );
                    return Ok(StepResult::Succeeded);
                }
                Err(e) if !e.is_retryable() => {
                    // 终态错误重试也不会成功，直接死信
                    error!(
                        event_id = %event.event_id,
                        step = step.name(),
                        code = e.code(),
                        error = %e,
                        "步骤遇到终态错误，进入死信"
                    );
                    invocation = invocation.dead_lettered(&e.to_string());
                    self.invocations.record(invocation).await?;
                    return Ok(StepResult::DeadLettered);
                }
                Err(e) => {
                    if !self.policy.should_retry(attempt) {
                        error!(
                            event_id = %event.event_id,
                            step = step.name(),
                            attempt,
                            error = %e,
                            "重试次数耗尽，进入死信"
                        );
                        invocation = invocation.dead_lettered(&e.to_string());
                        self.invocations.record(invocation).await?;
                        return Ok(StepResult::DeadLettered);
                    }

                    let delay = self.policy.delay_with_floor(attempt, e.retry_after_floor());
                    warn!(
                        event_id = %event.event_id,
                        step = step.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "步骤瞬态失败，退避后重试"
                    );
                    invocation = invocation.retrying(
                        &e.to_string(),
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                    self.invocations.record(invocation.clone()).await?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
