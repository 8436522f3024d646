//! 规则文档模型
//!
//! 一个规则集的规则文本是一个 JSON 文档：声明使用的全局变量，以及若干条
//! `when` 条件树 + `then` 动作列表组成的规则。

use crate::models::FactKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 规则集文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub globals: Vec<String>,
    pub rules: Vec<RuleDefinition>,
}

/// 单条规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default)]
    pub salience: i32,
    #[serde(default)]
    pub fact: FactSelector,
    /// 为空时匹配选择器允许的所有事实
    #[serde(default)]
    pub when: Option<RuleNode>,
    #[serde(default)]
    pub then: Vec<RuleAction>,
}

/// 规则匹配的事实类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactSelector {
    #[default]
    Any,
    State,
    Event,
    Custom,
}

impl FactSelector {
    pub fn matches(&self, kind: FactKind) -> bool {
        match self {
            Self::Any => true,
            Self::State => kind == FactKind::AssetState,
            Self::Event => kind == FactKind::AssetEvent,
            Self::Custom => kind == FactKind::Custom,
        }
    }
}

// ==================== 条件树 ====================

/// 规则节点（条件或逻辑组）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleNode {
    Condition(Condition),
    Group(LogicalGroup),
}

/// 条件节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// 逻辑组节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalGroup {
    pub operator: LogicalOperator,
    pub children: Vec<RuleNode>,
}

impl LogicalGroup {
    pub fn and(children: Vec<RuleNode>) -> Self {
        Self {
            operator: LogicalOperator::And,
            children,
        }
    }

    pub fn or(children: Vec<RuleNode>) -> Self {
        Self {
            operator: LogicalOperator::Or,
            children,
        }
    }
}

/// 条件操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    In,
    NotIn,
    Contains,
    ContainsAny,
    ContainsAll,
    StartsWith,
    EndsWith,
    Regex,
    Before,
    After,
    IsEmpty,
    IsNotEmpty,
}

impl Operator {
    /// 操作数必须是数组的操作符
    pub fn expects_array(&self) -> bool {
        matches!(
            self,
            Self::In | Self::NotIn | Self::ContainsAny | Self::ContainsAll
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 与 serde 表示保持一致
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// 逻辑操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    And,
    Or,
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

// ==================== 动作 ====================

/// 规则动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    /// 通过 LOG 全局变量输出日志，消息中的 `${path}` 取自匹配事实
    Log { message: String },

    /// 插入自定义事实
    Insert { fact: Value },

    /// 撤回与给定值相等的自定义事实
    RetractCustom { fact: Value },

    /// 通过 assets 全局变量写资产属性
    #[serde(rename_all = "camelCase")]
    WriteAttribute {
        /// 为空时使用匹配事实的 assetId
        #[serde(default)]
        asset_id: Option<String>,
        attribute_name: String,
        #[serde(default)]
        value: Option<Value>,
        /// 从匹配事实中取值的字段路径
        #[serde(default)]
        value_from: Option<String>,
    },

    /// 通过 users 全局变量查询租户用户，并以自定义事实插入结果
    InsertUsers {
        #[serde(default)]
        realm: Option<String>,
    },
}

impl RuleAction {
    /// 动作依赖的全局变量
    pub fn required_global(&self) -> Option<&'static str> {
        match self {
            Self::Log { .. } => Some(crate::facade::GLOBAL_LOG),
            Self::WriteAttribute { .. } => Some(crate::facade::GLOBAL_ASSETS),
            Self::InsertUsers { .. } => Some(crate::facade::GLOBAL_USERS),
            Self::Insert { .. } | Self::RetractCustom { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Insert { .. } => "insert",
            Self::RetractCustom { .. } => "retract_custom",
            Self::WriteAttribute { .. } => "write_attribute",
            Self::InsertUsers { .. } => "insert_users",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_deserialization() {
        let json = r#"
        {
            "globals": ["assets", "LOG"],
            "rules": [
                {
                    "name": "high-temperature",
                    "salience": 10,
                    "fact": "state",
                    "when": {
                        "type": "group",
                        "operator": "AND",
                        "children": [
                            { "type": "condition", "field": "attributeName", "operator": "eq", "value": "temperature" },
                            { "type": "condition", "field": "value", "operator": "gt", "value": 25 }
                        ]
                    },
                    "then": [
                        { "action": "log", "message": "too hot: ${value}" },
                        { "action": "write_attribute", "attributeName": "fan", "value": true }
                    ]
                }
            ]
        }
        "#;

        let doc: RuleDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.globals, vec!["assets", "LOG"]);
        let rule = &doc.rules[0];
        assert_eq!(rule.salience, 10);
        assert_eq!(rule.fact, FactSelector::State);
        assert!(matches!(rule.when, Some(RuleNode::Group(_))));
        assert_eq!(
            rule.then[1],
            RuleAction::WriteAttribute {
                asset_id: None,
                attribute_name: "fan".to_string(),
                value: Some(json!(true)),
                value_from: None,
            }
        );
    }

    #[test]
    fn test_rule_defaults() {
        let rule: RuleDefinition = serde_json::from_str(r#"{"name": "any"}"#).unwrap();
        assert_eq!(rule.salience, 0);
        assert_eq!(rule.fact, FactSelector::Any);
        assert!(rule.when.is_none());
        assert!(rule.then.is_empty());
    }

    #[test]
    fn test_unknown_action_rejected() {
        let result = serde_json::from_str::<RuleAction>(r#"{"action": "explode"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_fact_selector_matches() {
        assert!(FactSelector::Any.matches(FactKind::Custom));
        assert!(FactSelector::Event.matches(FactKind::AssetEvent));
        assert!(!FactSelector::State.matches(FactKind::AssetEvent));
    }

    #[test]
    fn test_operator_display() {
        assert_eq!(Operator::NotIn.to_string(), "not_in");
        assert_eq!(Operator::IsNotEmpty.to_string(), "is_not_empty");
        assert_eq!(LogicalOperator::Or.to_string(), "OR");
        assert!(Operator::ContainsAll.expects_array());
        assert!(!Operator::Eq.expects_array());
    }

    #[test]
    fn test_required_globals() {
        let action = RuleAction::Insert { fact: json!({}) };
        assert_eq!(action.required_global(), None);
        let action = RuleAction::InsertUsers { realm: None };
        assert_eq!(action.required_global(), Some("users"));
    }
}
