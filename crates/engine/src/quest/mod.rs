//! 任务系统
//!
//! 任务 = 规则（数据）+ 经验值奖励 + 冷却窗口。规则是可序列化的
//! 数据结构，由外部配置系统编辑，引擎只负责求值与奖励发放。

pub mod evaluator;
pub mod rules;

pub use evaluator::{QuestEvaluator, QuestOutcome, QuestOutcomeStatus};
pub use rules::{FilterOp, QuestRule};
