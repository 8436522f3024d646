//! 规则集生命周期测试套件
//!
//! 验证多作用域部署、编译失败恢复和引擎移除。

use crate::helpers::fixtures::*;
use crate::helpers::*;
use rules_engine::{DeploymentStatus, RulesetScope};

#[cfg(test)]
mod deployment_tests {
    use super::*;

    /// 租户引擎编译失败后通过撤回恢复
    #[test]
    fn test_tenant_failure_and_recovery() {
        let env = TestEnvironment::setup();
        let scope = RulesetScope::tenant(REALM);

        let status = env.service.deploy(cooling_ruleset(1, scope.clone()), false).unwrap();
        assert!(status.running);

        let status = env.service.deploy(broken_ruleset(2, scope.clone()), false).unwrap();
        assert!(!status.running);
        assert_eq!(status.ruleset(1).unwrap().status, DeploymentStatus::Ready);
        assert_eq!(status.ruleset(2).unwrap().status, DeploymentStatus::Failed);

        // 错误期间推送的状态在恢复后回放
        env.service.upsert_state(room_state("room-101", "temperature", 30));
        assert!(env.writes.all().is_empty());

        env.service.retract(&scope, 2);
        let status = env.service.status(&scope).unwrap();
        assert!(status.running);
        assert!(status.error.is_none());

        assert!(wait_for(|| env.writes.for_asset("room-101").len() == 1));
    }

    /// 租户引擎的故障不影响全局引擎
    #[test]
    fn test_failure_is_isolated_to_scope() {
        let env = TestEnvironment::setup();
        env.service
            .deploy(cooling_ruleset(1, RulesetScope::Global), false)
            .unwrap();
        env.service
            .deploy(broken_ruleset(2, RulesetScope::tenant(REALM)), false)
            .unwrap();

        env.service.upsert_state(room_state("room-102", "temperature", 29));
        assert!(wait_for(|| env.writes.for_asset("room-102").len() == 1));

        let global = env.service.status(&RulesetScope::Global).unwrap();
        assert!(global.running);
        assert!(global.error.is_none());
    }

    /// 撤回最后一个规则集后作用域引擎被移除，之后重新部署会重建并回放状态
    #[test]
    fn test_scoped_engine_is_recreated_with_known_states() {
        let env = TestEnvironment::setup();
        let scope = RulesetScope::asset(REALM, "floor-1");

        env.service.deploy(cooling_ruleset(1, scope.clone()), false).unwrap();
        env.service.retract(&scope, 1);
        assert!(env.service.engine(&scope).is_none());

        env.service.upsert_state(room_state("room-101", "temperature", 31));
        env.service.deploy(cooling_ruleset(1, scope.clone()), false).unwrap();

        let engine = env.service.engine(&scope).unwrap();
        assert_eq!(engine.facts().len(), 1);
        assert!(wait_for(|| env.writes.for_asset("room-101").len() == 1));
    }
}
