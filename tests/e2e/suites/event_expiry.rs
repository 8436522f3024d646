//! 资产事件测试套件
//!
//! 验证事件触发规则以及逻辑时钟下的过期撤回。

use crate::helpers::fixtures::*;
use crate::helpers::*;
use rules_engine::RulesetScope;
use serde_json::json;
use std::time::Duration;

#[cfg(test)]
mod event_tests {
    use super::*;

    #[test]
    fn test_presence_event_turns_lights_on_and_expires() {
        let env = TestEnvironment::setup();
        let floor = RulesetScope::asset(REALM, "floor-1");
        env.service.deploy(lighting_ruleset(1, floor.clone()), false).unwrap();

        env.service.insert_event(
            room_state("room-102", "presence", true),
            Duration::from_secs(60),
        );
        assert!(wait_for(|| env.writes.for_asset("floor-1").len() == 1));
        assert_eq!(env.writes.for_asset("floor-1")[0].value, json!("on"));

        let engine = env.service.engine(&floor).unwrap();
        assert_eq!(engine.fact_stats().events, 1);

        env.service.advance_clock(Duration::from_secs(59)).unwrap();
        assert_eq!(engine.fact_stats().events, 1);
        env.service.advance_clock(Duration::from_secs(1)).unwrap();
        assert_eq!(engine.fact_stats().events, 0);
    }

    #[test]
    fn test_events_are_dropped_by_stopped_engines() {
        let env = TestEnvironment::setup();
        env.service.insert_event(
            room_state("room-101", "presence", true),
            Duration::from_secs(60),
        );

        // 全局引擎没有规则集，事件不会被缓存
        let global = env.service.global_engine();
        assert!(!global.is_running());
        assert_eq!(global.fact_stats().total, 0);
        assert!(global.facts().is_empty());
    }
}
