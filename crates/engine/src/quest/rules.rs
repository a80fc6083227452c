//! 任务规则
//!
//! 规则是带标签的数据变体，以 JSON 存储在任务配置中，支持嵌套组合。
//! 求值是同步纯函数：所有异步依赖（计数器）在求值前由调用方预取，
//! 递归不跨越 await 点。
//!
//! 上下文是规范事件的扁平化视图（信封字段 + 载荷字段），字段名
//! 支持点号路径（如 `payload 内嵌对象的 a.b`）。

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use xp_shared::error::{EngineError, Result};
use xp_shared::events::EventKind;

// ---------------------------------------------------------------------------
// 比较算子
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// 字段值是否在给定数组内
    In,
    /// 字段（字符串或数组）是否包含给定值
    Contains,
}

// ---------------------------------------------------------------------------
// 规则树
// ---------------------------------------------------------------------------

/// 任务规则节点
///
/// 叶子节点锚定一个事件类型；组合节点对子规则做与/或。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestRule {
    /// 事件类型匹配即满足
    EventMatch { event: EventKind },
    /// 事件类型匹配且外部计数器达到阈值
    Threshold {
        event: EventKind,
        counter: String,
        min_count: i64,
    },
    /// 事件类型匹配且载荷字段满足比较条件
    FieldFilter {
        event: EventKind,
        field: String,
        op: FilterOp,
        value: Value,
    },
    /// 所有子规则满足
    All { rules: Vec<QuestRule> },
    /// 任一子规则满足
    Any { rules: Vec<QuestRule> },
}

impl QuestRule {
    /// 规则引用的事件类型集合，用于求值前的快速过滤
    pub fn event_kinds(&self) -> HashSet<EventKind> {
        let mut kinds = HashSet::new();
        self.collect_kinds(&mut kinds);
        kinds
    }

    fn collect_kinds(&self, kinds: &mut HashSet<EventKind>) {
        match self {
            Self::EventMatch { event }
            | Self::Threshold { event, .. }
            | Self::FieldFilter { event, .. } => {
                kinds.insert(*event);
            }
            Self::All { rules } | Self::Any { rules } => {
                for rule in rules {
                    rule.collect_kinds(kinds);
                }
            }
        }
    }

    /// 规则引用的计数器名称，供调用方预取
    pub fn counter_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        self.collect_counters(&mut names);
        names
    }

    fn collect_counters(&self, names: &mut HashSet<String>) {
        match self {
            Self::Threshold { counter, .. } => {
                names.insert(counter.clone());
            }
            Self::All { rules } | Self::Any { rules } => {
                for rule in rules {
                    rule.collect_counters(names);
                }
            }
            _ => {}
        }
    }

    /// 对单个事件求值
    ///
    /// `ctx` 是事件的扁平化上下文，`counters` 是预取的计数器快照。
    /// 字段缺失视为不匹配；规则本身格式非法返回 [`EngineError::RuleEval`]。
    pub fn matches(
        &self,
        kind: EventKind,
        ctx: &Value,
        counters: &HashMap<String, i64>,
    ) -> Result<bool> {
        match self {
            Self::EventMatch { event } => Ok(*event == kind),
            Self::Threshold {
                event,
                counter,
                min_count,
            } => {
                if *event != kind {
                    return Ok(false);
                }
                Ok(counters.get(counter).copied().unwrap_or(0) >= *min_count)
            }
            Self::FieldFilter {
                event,
                field,
                op,
                value,
            } => {
                if *event != kind {
                    return Ok(false);
                }
                match lookup(ctx, field) {
                    Some(actual) => compare(actual, *op, value),
                    None => Ok(false),
                }
            }
            Self::All { rules } => {
                for rule in rules {
                    if !rule.matches(kind, ctx, counters)? {
                        return Ok(false);
                    }
                }
                Ok(!rules.is_empty())
            }
            Self::Any { rules } => {
                for rule in rules {
                    if rule.matches(kind, ctx, counters)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// 点号路径字段查找
fn lookup<'a>(ctx: &'a Value, field: &str) -> Option<&'a Value> {
    let mut current = ctx;
    for part in field.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn compare(actual: &Value, op: FilterOp, expected: &Value) -> Result<bool> {
    match op {
        FilterOp::Eq => Ok(values_equal(actual, expected)),
        FilterOp::Neq => Ok(!values_equal(actual, expected)),
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            // 数值比较，非数值字段视为不匹配
            let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) else {
                return Ok(false);
            };
            Ok(match op {
                FilterOp::Gt => a > b,
                FilterOp::Gte => a >= b,
                FilterOp::Lt => a < b,
                FilterOp::Lte => a <= b,
                _ => unreachable!(),
            })
        }
        FilterOp::In => {
            let Some(candidates) = expected.as_array() else {
                return Err(EngineError::RuleEval(format!(
                    "in 算子的比较值必须是数组，实际为: {expected}"
                )));
            };
            Ok(candidates.iter().any(|c| values_equal(actual, c)))
        }
        FilterOp::Contains => match actual {
            Value::Array(items) => Ok(items.iter().any(|i| values_equal(i, expected))),
            Value::String(s) => Ok(expected.as_str().is_some_and(|sub| s.contains(sub))),
            _ => Ok(false),
        },
    }
}

/// 数值相等做跨类型归一（1 == 1.0），其余按结构相等
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}
