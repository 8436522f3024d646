//! 测试数据：一栋楼的资产层级和常用规则集

use rules_engine::{AssetState, Ruleset, RulesetScope};

pub const REALM: &str = "building-realm";

/// building -> floor-1 -> room-101 / room-102
pub fn room_state(room: &str, attribute: &str, value: impl Into<serde_json::Value>) -> AssetState {
    AssetState::new(room, attribute, value, 0)
        .in_realm(REALM)
        .with_name(room)
        .with_type("Room")
        .with_parents(["building", "floor-1"])
}

/// 温度过高时打开房间的空调
pub fn cooling_ruleset(id: i64, scope: RulesetScope) -> Ruleset {
    let rules = r#"{
        "globals": ["assets", "LOG"],
        "rules": [{
            "name": "cooling",
            "fact": "state",
            "when": {
                "type": "group",
                "operator": "AND",
                "children": [
                    {"type": "condition", "field": "attributeName", "operator": "eq", "value": "temperature"},
                    {"type": "condition", "field": "value", "operator": "gte", "value": 28}
                ]
            },
            "then": [
                {"action": "log", "message": "${assetName} 温度 ${value}"},
                {"action": "write_attribute", "attributeName": "cooling", "value": true}
            ]
        }]
    }"#;
    Ruleset::new(id, "cooling", scope, 1, rules)
}

/// 有人时点亮楼层照明
pub fn lighting_ruleset(id: i64, scope: RulesetScope) -> Ruleset {
    let rules = r#"{
        "globals": ["assets"],
        "rules": [{
            "name": "presence-lighting",
            "fact": "event",
            "when": {"type": "condition", "field": "attributeName", "operator": "eq", "value": "presence"},
            "then": [{"action": "write_attribute", "assetId": "floor-1", "attributeName": "lights", "value": "on"}]
        }]
    }"#;
    Ruleset::new(id, "lighting", scope, 1, rules)
}

/// 语法错误的规则集
pub fn broken_ruleset(id: i64, scope: RulesetScope) -> Ruleset {
    Ruleset::new(id, "broken", scope, 1, r#"{"rules": [{"name": "#)
}
