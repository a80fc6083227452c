//! 游戏化引擎核心库
//!
//! 将来自商城、Discord、杂志阅读器与 UGC 审核的异构事件转化为
//! 持久且幂等的状态变更：经验值台账、任务完成记录、奖励领取，
//! 以及对外部 Discord 身份组/公告的同步。
//!
//! 引擎不拥有任何传输层：webhook/API 层完成鉴权与解包后调用
//! [`engine::GamifyEngine::ingest`]，其余全部在库内完成。

pub mod discord;
pub mod engine;
pub mod identity;
pub mod ledger;
pub mod leveling;
pub mod model;
pub mod normalizer;
pub mod orchestrator;
pub mod quest;
pub mod rewards;
pub mod steps;
pub mod store;

pub use engine::{GamifyEngine, Stores};
pub use xp_shared::error::{EngineError, Result};
pub use xp_shared::events::{Event, EventKind, EventSource};
