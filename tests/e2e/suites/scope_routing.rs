//! 状态路由测试套件
//!
//! 验证属性状态按租户和资产层级分发到对应引擎。

use crate::helpers::fixtures::*;
use crate::helpers::*;
use rules_engine::{AttributeRef, RulesetScope};

#[cfg(test)]
mod routing_tests {
    use super::*;

    #[test]
    fn test_state_reaches_every_relevant_scope() {
        let env = TestEnvironment::setup();
        env.service
            .deploy(cooling_ruleset(1, RulesetScope::Global), false)
            .unwrap();
        env.service
            .deploy(cooling_ruleset(2, RulesetScope::tenant(REALM)), false)
            .unwrap();
        env.service
            .deploy(cooling_ruleset(3, RulesetScope::asset(REALM, "floor-1")), false)
            .unwrap();
        env.service
            .deploy(cooling_ruleset(4, RulesetScope::asset(REALM, "floor-2")), false)
            .unwrap();

        env.service.upsert_state(room_state("room-101", "temperature", 35));

        // 全局、租户、floor-1 三个引擎各写回一次
        assert!(wait_for(|| env.writes.for_asset("room-101").len() == 3));

        let floor_2 = env
            .service
            .engine(&RulesetScope::asset(REALM, "floor-2"))
            .unwrap();
        assert!(floor_2.facts().is_empty());
    }

    #[test]
    fn test_other_realm_does_not_reach_tenant_engine() {
        let env = TestEnvironment::setup();
        let tenant = RulesetScope::tenant(REALM);
        env.service.deploy(cooling_ruleset(1, tenant.clone()), false).unwrap();

        let foreign = room_state("room-101", "temperature", 35).in_realm("other-realm");
        env.service.upsert_state(foreign);

        let engine = env.service.engine(&tenant).unwrap();
        assert!(engine.facts().is_empty());
        assert_eq!(env.service.global_engine().facts().len(), 1);
    }

    #[test]
    fn test_retract_state_reaches_routed_engines() {
        let env = TestEnvironment::setup();
        let floor = RulesetScope::asset(REALM, "floor-1");
        env.service.deploy(cooling_ruleset(1, floor.clone()), false).unwrap();

        env.service.upsert_state(room_state("room-101", "temperature", 20));
        let engine = env.service.engine(&floor).unwrap();
        assert_eq!(engine.facts().len(), 1);

        env.service
            .retract_state(&AttributeRef::new("room-101", "temperature"));
        assert!(engine.facts().is_empty());
        assert!(env.service.global_engine().facts().is_empty());

        // 再次移除未知状态不会出错
        env.service
            .retract_state(&AttributeRef::new("room-101", "temperature"));
    }
}
