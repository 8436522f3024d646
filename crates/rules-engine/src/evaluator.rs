//! 条件评估器
//!
//! 对单个事实的 JSON 投影评估条件树。逻辑组短路求值，操作符支持数值、
//! 字符串、数组和时间比较。

use crate::compiler::PatternCache;
use crate::document::{Condition, LogicalOperator, Operator, RuleNode};
use crate::error::{Result, RuleError};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::trace;

/// 按点号分隔的路径取字段值，如 "value.level" 或 "parentPath.0"
pub fn lookup_field<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;

    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// 条件评估器
pub struct ConditionEvaluator<'a> {
    patterns: &'a PatternCache,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(patterns: &'a PatternCache) -> Self {
        Self { patterns }
    }

    /// 评估条件树，评估错误（类型不匹配等）视为不匹配
    pub fn matches(&self, node: &RuleNode, fact: &Value) -> bool {
        match node {
            RuleNode::Condition(cond) => self.matches_condition(cond, fact),
            RuleNode::Group(group) => match group.operator {
                LogicalOperator::And => group.children.iter().all(|c| self.matches(c, fact)),
                LogicalOperator::Or => group.children.iter().any(|c| self.matches(c, fact)),
            },
        }
    }

    fn matches_condition(&self, cond: &Condition, fact: &Value) -> bool {
        let field_value = lookup_field(fact, &cond.field);
        match self.evaluate(field_value, cond.operator, &cond.value) {
            Ok(matched) => matched,
            Err(e) => {
                trace!(field = %cond.field, operator = %cond.operator, error = %e, "条件评估失败，视为不匹配");
                false
            }
        }
    }

    /// 评估单个条件
    ///
    /// * `field_value` - 从事实中获取的字段值
    /// * `operator` - 操作符
    /// * `expected` - 规则中定义的期望值
    pub fn evaluate(
        &self,
        field_value: Option<&Value>,
        operator: Operator,
        expected: &Value,
    ) -> Result<bool> {
        match operator {
            Operator::IsEmpty => return Ok(is_empty(field_value)),
            Operator::IsNotEmpty => return Ok(!is_empty(field_value)),
            _ => {}
        }

        // 字段不存在时其余操作符均不匹配
        let Some(field) = field_value else {
            return Ok(false);
        };

        match operator {
            Operator::Eq => Ok(loose_eq(field, expected)),
            Operator::Neq => Ok(!loose_eq(field, expected)),
            Operator::Gt => compare(field, expected, |a, b| a > b),
            Operator::Gte => compare(field, expected, |a, b| a >= b),
            Operator::Lt => compare(field, expected, |a, b| a < b),
            Operator::Lte => compare(field, expected, |a, b| a <= b),
            Operator::Between => between(field, expected),
            Operator::In => Ok(as_array(expected)?.iter().any(|v| loose_eq(field, v))),
            Operator::NotIn => Ok(!as_array(expected)?.iter().any(|v| loose_eq(field, v))),
            Operator::Contains => contains(field, expected),
            Operator::ContainsAny => {
                let have = as_array(field)?;
                Ok(as_array(expected)?
                    .iter()
                    .any(|e| have.iter().any(|h| loose_eq(h, e))))
            }
            Operator::ContainsAll => {
                let have = as_array(field)?;
                Ok(as_array(expected)?
                    .iter()
                    .all(|e| have.iter().any(|h| loose_eq(h, e))))
            }
            Operator::StartsWith => Ok(as_str(field)?.starts_with(as_str(expected)?)),
            Operator::EndsWith => Ok(as_str(field)?.ends_with(as_str(expected)?)),
            Operator::Regex => self.regex_match(field, expected),
            Operator::Before => time_compare(field, expected, |a, b| a < b),
            Operator::After => time_compare(field, expected, |a, b| a > b),
            Operator::IsEmpty | Operator::IsNotEmpty => Ok(false),
        }
    }

    fn regex_match(&self, field: &Value, expected: &Value) -> Result<bool> {
        let text = as_str(field)?;
        let pattern = as_str(expected)?;
        // 编译阶段已缓存所有规则中的正则
        match self.patterns.get(pattern) {
            Some(regex) => Ok(regex.is_match(text)),
            None => {
                let regex = regex::Regex::new(pattern)
                    .map_err(|e| RuleError::Parse(format!("无效的正则表达式 '{}': {}", pattern, e)))?;
                Ok(regex.is_match(text))
            }
        }
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(arr)) => arr.is_empty(),
        Some(Value::Object(obj)) => obj.is_empty(),
        _ => false,
    }
}

/// 相等比较，数值统一按浮点比较（100 == 100.0）
fn loose_eq(field: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(field), as_f64(expected)) {
        return (a - b).abs() < f64::EPSILON;
    }
    field == expected
}

fn compare<F>(field: &Value, expected: &Value, cmp: F) -> Result<bool>
where
    F: Fn(f64, f64) -> bool,
{
    Ok(cmp(as_number(field)?, as_number(expected)?))
}

/// 范围比较，expected 为 [min, max]
fn between(field: &Value, expected: &Value) -> Result<bool> {
    let bounds = as_array(expected)?;
    let [min, max] = bounds.as_slice() else {
        return Err(RuleError::Parse("between 操作符需要 [min, max] 数组".to_string()));
    };

    let value = as_number(field)?;
    Ok(value >= as_number(min)? && value <= as_number(max)?)
}

fn contains(field: &Value, expected: &Value) -> Result<bool> {
    match field {
        Value::String(s) => Ok(s.contains(as_str(expected)?)),
        Value::Array(arr) => Ok(arr.iter().any(|item| loose_eq(item, expected))),
        _ => Err(type_mismatch("string or array", field)),
    }
}

fn time_compare<F>(field: &Value, expected: &Value, cmp: F) -> Result<bool>
where
    F: Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
{
    Ok(cmp(parse_datetime(field)?, parse_datetime(expected)?))
}

/// 解析时间：RFC 3339 字符串、纯日期或毫秒时间戳
fn parse_datetime(value: &Value) -> Result<DateTime<Utc>> {
    if let Some(millis) = value.as_i64() {
        return DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| RuleError::Parse(format!("时间戳超出范围: {}", millis)));
    }

    let s = value
        .as_str()
        .ok_or_else(|| type_mismatch("datetime string or epoch millis", value))?;

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| RuleError::Parse(format!("无法解析日期时间: '{}'", s)))
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_number(value: &Value) -> Result<f64> {
    as_f64(value).ok_or_else(|| type_mismatch("number", value))
}

fn as_str(value: &Value) -> Result<&str> {
    value.as_str().ok_or_else(|| type_mismatch("string", value))
}

fn as_array(value: &Value) -> Result<&Vec<Value>> {
    value.as_array().ok_or_else(|| type_mismatch("array", value))
}

fn type_mismatch(expected: &str, actual: &Value) -> RuleError {
    let actual = match actual {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    RuleError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}
