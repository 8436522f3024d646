//! JSON 规则会话
//!
//! 工作内存由一把互斥锁保护。触发循环在锁内查找下一个激活（规则集插入顺序，
//! 然后 salience 降序、声明顺序，再按事实插入顺序），在锁外执行规则动作。
//! 每个 (规则, 事实句柄) 组合只评估一次，重新插入的事实获得新句柄后会再次激活。

use crate::compiler::{CompiledRule, CompiledRuleset};
use crate::document::RuleAction;
use crate::error::{Result, RuleError};
use crate::evaluator::{ConditionEvaluator, lookup_field};
use crate::facade::{
    AssetsFacade, AttributeWriteRequest, GLOBAL_ASSETS, GLOBAL_LOG, GLOBAL_USERS, GlobalValue,
    RulesLog, UsersFacade,
};
use crate::models::{DEFAULT_REALM, Fact, FactHandle, FactStats};
use crate::runtime::clock::SessionClock;
use crate::runtime::memory::WorkingMemory;
use crate::runtime::{FireListener, RuleFiring, RuleSession, WorkUnit};
use parking_lot::{Condvar, Mutex};
use regex::Regex;
use rules_shared::observability::metrics;
use serde_json::{Value, json};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, trace};

/// 空闲时最长等待时间
const MAX_IDLE_WAIT: Duration = Duration::from_millis(100);

static NEXT_FACT_HANDLE: AtomicU64 = AtomicU64::new(1);

static MESSAGE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([a-zA-Z0-9_.]+)\}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ActivationKey {
    ruleset: usize,
    rule: usize,
    handle: FactHandle,
}

#[derive(Clone, Default)]
struct SessionGlobals {
    assets: Option<Arc<dyn AssetsFacade>>,
    users: Option<Arc<dyn UsersFacade>>,
    log: Option<RulesLog>,
}

struct Activation {
    key: ActivationKey,
    fact: Value,
    globals: SessionGlobals,
}

#[derive(Default)]
struct SessionState {
    memory: WorkingMemory,
    pending: VecDeque<WorkUnit>,
    globals: SessionGlobals,
    /// 已评估过的 (规则, 事实) 组合
    evaluated: HashSet<ActivationKey>,
    /// 自上次完整扫描后工作内存是否有新事实
    dirty: bool,
}

pub struct JsonRuleSession {
    rulesets: Vec<Arc<CompiledRuleset>>,
    declared_globals: HashSet<String>,
    clock: SessionClock,
    state: Mutex<SessionState>,
    fire_listener: Mutex<Option<FireListener>>,
    wakeup: Condvar,
    halted: AtomicBool,
    disposed: AtomicBool,
}

impl JsonRuleSession {
    pub fn new(rulesets: Vec<Arc<CompiledRuleset>>, clock: SessionClock) -> Self {
        let declared_globals = rulesets
            .iter()
            .flat_map(|r| r.globals.iter().cloned())
            .collect();

        Self {
            rulesets,
            declared_globals,
            clock,
            state: Mutex::new(SessionState::default()),
            fire_listener: Mutex::new(None),
            wakeup: Condvar::new(),
            halted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(RuleError::FactOperation(format!(
                "会话已停止，无法{}",
                operation
            )));
        }
        Ok(())
    }

    /// 应用排队的工作单元
    fn apply_pending(state: &mut SessionState) {
        while let Some(unit) = state.pending.pop_front() {
            match unit {
                WorkUnit::Replace { old, handle, fact } => {
                    if let Some(old) = old {
                        if state.memory.remove(old).is_some() {
                            state.evaluated.retain(|k| k.handle != old);
                        } else {
                            trace!(target: "rules", handle = %old, "待替换的事实已不在工作内存中");
                        }
                    }
                    trace!(target: "rules", %handle, kind = fact.kind().as_str(), "更新事实");
                    state.memory.insert(handle, fact);
                    state.dirty = true;
                }
            }
        }
    }

    /// 查找下一个激活并标记为已评估
    fn next_activation(&self, state: &mut SessionState) -> Option<Activation> {
        let SessionState {
            memory,
            evaluated,
            globals,
            ..
        } = state;

        for (ruleset_idx, ruleset) in self.rulesets.iter().enumerate() {
            let evaluator = ConditionEvaluator::new(&ruleset.patterns);

            for (rule_idx, rule) in ruleset.rules.iter().enumerate() {
                for (handle, fact) in memory.iter() {
                    if !rule.selector.matches(fact.kind()) {
                        continue;
                    }

                    let key = ActivationKey {
                        ruleset: ruleset_idx,
                        rule: rule_idx,
                        handle: *handle,
                    };
                    if !evaluated.insert(key) {
                        continue;
                    }

                    let projected = fact.to_json();
                    let matched = rule
                        .when
                        .as_ref()
                        .is_none_or(|when| evaluator.matches(when, &projected));

                    if matched {
                        return Some(Activation {
                            key,
                            fact: projected,
                            globals: globals.clone(),
                        });
                    }
                }
            }
        }

        None
    }

    fn rule(&self, key: &ActivationKey) -> &CompiledRule {
        &self.rulesets[key.ruleset].rules[key.rule]
    }

    /// 在锁外执行规则动作
    fn fire(&self, activation: Activation) -> Result<()> {
        let rule = self.rule(&activation.key);
        debug!(target: "rules", rule = %rule.name, handle = %activation.key.handle, "规则触发");
        metrics::record_rule_fired(&rule.name);

        for action in &rule.actions {
            self.execute(rule, action, &activation)
                .map_err(|reason| RuleError::Execution {
                    rule: rule.name.clone(),
                    reason,
                })?;
        }

        let listener = self.fire_listener.lock().clone();
        if let Some(listener) = listener {
            listener(&RuleFiring {
                ruleset_id: self.rulesets[activation.key.ruleset].ruleset_id,
                rule: rule.name.clone(),
                handle: activation.key.handle,
                fact: activation.fact,
            });
        }
        Ok(())
    }

    fn execute(
        &self,
        rule: &CompiledRule,
        action: &RuleAction,
        activation: &Activation,
    ) -> std::result::Result<(), String> {
        let fact = &activation.fact;
        let globals = &activation.globals;

        match action {
            RuleAction::Log { message } => {
                let log = globals.log.as_ref().ok_or_else(|| unbound(GLOBAL_LOG))?;
                log.info(&rule.name, &interpolate(message, fact));
            }
            RuleAction::Insert { fact: value } => {
                self.insert(Fact::Custom(value.clone()))
                    .map_err(|e| e.to_string())?;
            }
            RuleAction::RetractCustom { fact: value } => {
                let handles = self.state.lock().memory.find_custom(value);
                for handle in handles {
                    self.delete(handle).map_err(|e| e.to_string())?;
                }
            }
            RuleAction::WriteAttribute {
                asset_id,
                attribute_name,
                value,
                value_from,
            } => {
                let assets = globals.assets.as_ref().ok_or_else(|| unbound(GLOBAL_ASSETS))?;

                let asset_id = match asset_id {
                    Some(id) => id.clone(),
                    None => lookup_field(fact, "assetId")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| "匹配的事实没有 assetId".to_string())?,
                };

                let value = match (value, value_from) {
                    (Some(value), _) => value.clone(),
                    (None, Some(path)) => lookup_field(fact, path)
                        .cloned()
                        .ok_or_else(|| format!("匹配的事实没有字段 '{}'", path))?,
                    (None, None) => return Err("写属性动作没有值".to_string()),
                };

                assets
                    .dispatch(AttributeWriteRequest {
                        asset_id,
                        attribute_name: attribute_name.clone(),
                        value,
                        source_rule: rule.name.clone(),
                    })
                    .map_err(|e| e.to_string())?;
            }
            RuleAction::InsertUsers { realm } => {
                let users = globals.users.as_ref().ok_or_else(|| unbound(GLOBAL_USERS))?;

                let realm = realm
                    .clone()
                    .or_else(|| lookup_field(fact, "realm").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| DEFAULT_REALM.to_string());
                let user_ids = users.user_ids(&realm);

                self.insert(Fact::Custom(json!({
                    "factType": "users",
                    "realm": realm,
                    "userIds": user_ids,
                })))
                .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

fn unbound(name: &str) -> String {
    format!("全局变量 '{}' 未绑定", name)
}

/// 用匹配事实的字段替换消息中的 `${path}`
fn interpolate(message: &str, fact: &Value) -> String {
    MESSAGE_PLACEHOLDER
        .replace_all(message, |caps: &regex::Captures| match lookup_field(fact, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

impl RuleSession for JsonRuleSession {
    fn clock(&self) -> SessionClock {
        self.clock.clone()
    }

    fn set_global(&self, name: &str, value: GlobalValue) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RuleError::Session("会话已释放".to_string()));
        }
        if !self.declared_globals.contains(name) {
            return Err(RuleError::UnknownGlobal(name.to_string()));
        }
        if value.binding_name() != name {
            return Err(RuleError::Session(format!(
                "全局变量 '{}' 不能绑定 {:?}",
                name, value
            )));
        }

        let mut state = self.state.lock();
        match value {
            GlobalValue::Assets(assets) => state.globals.assets = Some(assets),
            GlobalValue::Users(users) => state.globals.users = Some(users),
            GlobalValue::Logger(log) => state.globals.log = Some(log),
        }
        Ok(())
    }

    fn set_fire_listener(&self, listener: Option<FireListener>) {
        *self.fire_listener.lock() = listener;
    }

    fn insert(&self, fact: Fact) -> Result<FactHandle> {
        self.ensure_active("插入事实")?;
        let handle = self.next_handle();

        {
            let mut state = self.state.lock();
            Self::apply_pending(&mut state);
            trace!(target: "rules", %handle, kind = fact.kind().as_str(), "插入事实");
            state.memory.insert(handle, fact);
            state.dirty = true;
        }

        self.wakeup.notify_all();
        Ok(handle)
    }

    fn delete(&self, handle: FactHandle) -> Result<()> {
        self.ensure_active("删除事实")?;

        let mut state = self.state.lock();
        Self::apply_pending(&mut state);
        if state.memory.remove(handle).is_none() {
            return Err(RuleError::FactOperation(format!("未知的事实句柄 {}", handle)));
        }
        state.evaluated.retain(|k| k.handle != handle);
        trace!(target: "rules", %handle, "删除事实");
        Ok(())
    }

    fn next_handle(&self) -> FactHandle {
        FactHandle(NEXT_FACT_HANDLE.fetch_add(1, Ordering::SeqCst))
    }

    fn submit(&self, unit: WorkUnit) -> Result<()> {
        self.ensure_active("提交工作单元")?;

        {
            let mut state = self.state.lock();
            state.pending.push_back(unit);
            state.dirty = true;
        }

        self.wakeup.notify_all();
        Ok(())
    }

    fn fire_until_halt(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RuleError::Session("会话已释放".to_string()));
        }

        loop {
            if self.halted.load(Ordering::SeqCst) {
                return Ok(());
            }

            let activation = {
                let mut state = self.state.lock();
                Self::apply_pending(&mut state);
                if state.dirty {
                    let next = self.next_activation(&mut state);
                    if next.is_none() {
                        state.dirty = false;
                    }
                    next
                } else {
                    None
                }
            };

            if let Some(activation) = activation {
                self.fire(activation)?;
                continue;
            }

            // 实时时钟的到期作业在触发线程上执行，逻辑时钟由推进方执行
            if !self.clock.is_pseudo() {
                self.clock.run_due_jobs();
            }

            let mut state = self.state.lock();
            if self.halted.load(Ordering::SeqCst) {
                return Ok(());
            }
            if !state.dirty && state.pending.is_empty() {
                let wait = self.clock.idle_wait(MAX_IDLE_WAIT);
                self.wakeup.wait_for(&mut state, wait);
            }
        }
    }

    fn halt(&self) {
        {
            let _state = self.state.lock();
            self.halted.store(true, Ordering::SeqCst);
        }
        self.wakeup.notify_all();
    }

    fn dispose(&self) {
        self.halt();
        self.disposed.store(true, Ordering::SeqCst);

        {
            let mut state = self.state.lock();
            state.memory.clear();
            state.pending.clear();
            state.evaluated.clear();
            state.globals = SessionGlobals::default();
        }
        self.fire_listener.lock().take();

        self.clock.clear_jobs();
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn stats(&self) -> FactStats {
        let mut state = self.state.lock();
        Self::apply_pending(&mut state);
        state.memory.stats()
    }

    fn facts(&self) -> Vec<(FactHandle, Fact)> {
        let mut state = self.state.lock();
        Self::apply_pending(&mut state);
        state.memory.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RulesetCompiler;
    use crate::facade::MockAssetsFacade;
    use crate::models::AssetState;
    use std::thread;
    use std::time::Instant;

    fn session_with(documents: &[&str]) -> Arc<JsonRuleSession> {
        let mut compiler = RulesetCompiler::new();
        let rulesets = documents
            .iter()
            .enumerate()
            .map(|(i, doc)| Arc::new(compiler.compile(i as i64, doc).unwrap()))
            .collect();
        Arc::new(JsonRuleSession::new(rulesets, SessionClock::pseudo(0)))
    }

    fn spawn_firing(session: &Arc<JsonRuleSession>) -> thread::JoinHandle<Result<()>> {
        let session = session.clone();
        thread::spawn(move || session.fire_until_halt())
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn custom_facts(session: &JsonRuleSession) -> Vec<Value> {
        session
            .facts()
            .into_iter()
            .filter_map(|(_, f)| match f {
                Fact::Custom(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    fn state(asset: &str, attribute: &str, value: Value) -> Fact {
        Fact::State(AssetState::new(asset, attribute, value, 0))
    }

    #[test]
    fn test_fires_by_salience_and_refraction() {
        let session = session_with(&[r#"
        {
            "rules": [
                { "name": "low", "fact": "state", "then": [{ "action": "insert", "fact": { "fired": "low" } }] },
                { "name": "high", "salience": 10, "fact": "state", "then": [{ "action": "insert", "fact": { "fired": "high" } }] }
            ]
        }
        "#]);
        let worker = spawn_firing(&session);

        session.insert(state("a1", "temperature", json!(20))).unwrap();
        assert!(wait_until(|| custom_facts(&session).len() == 2));
        assert_eq!(
            custom_facts(&session),
            vec![json!({"fired": "high"}), json!({"fired": "low"})]
        );

        // 同一句柄不会再次激活
        thread::sleep(Duration::from_millis(50));
        assert_eq!(custom_facts(&session).len(), 2);

        session.halt();
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn test_condition_filters_facts() {
        let session = session_with(&[r#"
        {
            "rules": [{
                "name": "hot",
                "fact": "state",
                "when": { "type": "condition", "field": "value", "operator": "gt", "value": 25 },
                "then": [{ "action": "insert", "fact": { "alarm": true } }]
            }]
        }
        "#]);
        let worker = spawn_firing(&session);

        session.insert(state("a1", "temperature", json!(20))).unwrap();
        session.insert(state("a2", "temperature", json!(30))).unwrap();

        assert!(wait_until(|| custom_facts(&session).len() == 1));
        session.halt();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_replace_unit_is_applied_atomically() {
        let session = session_with(&[r#"{"rules": [{"name": "noop", "fact": "custom"}]}"#]);

        let old = session.insert(state("a1", "t", json!(1))).unwrap();
        let handle = session.next_handle();
        session
            .submit(WorkUnit::Replace {
                old: Some(old),
                handle,
                fact: state("a1", "t", json!(2)),
            })
            .unwrap();

        let facts = session.facts();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].0, handle);
        assert_eq!(facts[0].1, state("a1", "t", json!(2)));
    }

    #[test]
    fn test_replace_is_never_observed_half_applied() {
        let session = session_with(&[r#"{"rules": [{"name": "watch", "fact": "state"}]}"#]);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&session);
        let sink = observed.clone();
        let listener: FireListener = Arc::new(move |firing: &RuleFiring| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let copies = session
                .facts()
                .iter()
                .filter(|(_, fact)| {
                    fact.as_state()
                        .is_some_and(|s| s.asset_id == "a1" && s.attribute_name == "t")
                })
                .count();
            sink.lock().push((firing.fact["value"].clone(), copies));
        });
        session.set_fire_listener(Some(listener));
        let worker = spawn_firing(&session);

        let mut handle = session.insert(state("a1", "t", json!(0))).unwrap();
        for i in 1..=200 {
            let next = session.next_handle();
            session
                .submit(WorkUnit::Replace {
                    old: Some(handle),
                    handle: next,
                    fact: state("a1", "t", json!(i)),
                })
                .unwrap();
            handle = next;
        }

        assert!(wait_until(|| observed.lock().iter().any(|(v, _)| *v == json!(200))));
        session.halt();
        worker.join().unwrap().unwrap();

        // 规则每次触发时工作内存中恰好有一个该属性的事实
        let observed = observed.lock();
        assert!(!observed.is_empty());
        assert!(observed.iter().all(|(_, copies)| *copies == 1), "{:?}", *observed);
    }

    #[test]
    fn test_fire_listener_reports_successful_firings() {
        let session = session_with(&[
            r#"{"rules": [{"name": "first", "fact": "state"}]}"#,
            r#"{"globals": ["LOG"], "rules": [{"name": "unbound-log", "fact": "state", "then": [{"action": "log", "message": "x"}]}]}"#,
        ]);
        let firings = Arc::new(Mutex::new(Vec::new()));
        let sink = firings.clone();
        let listener: FireListener = Arc::new(move |firing: &RuleFiring| sink.lock().push(firing.clone()));
        session.set_fire_listener(Some(listener));

        let handle = session.insert(state("a1", "t", json!(5))).unwrap();
        // LOG 未绑定，第二个规则集的规则失败且不通知监听器
        assert!(session.fire_until_halt().is_err());

        let firings = firings.lock();
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].ruleset_id, 0);
        assert_eq!(firings[0].rule, "first");
        assert_eq!(firings[0].handle, handle);
        assert_eq!(firings[0].fact["value"], json!(5));
    }

    #[test]
    fn test_delete_unknown_handle() {
        let session = session_with(&[r#"{"rules": []}"#]);
        let err = session.delete(FactHandle(u64::MAX)).unwrap_err();
        assert_eq!(err.code(), "FACT_OPERATION_ERROR");
    }

    #[test]
    fn test_operations_after_halt_fail() {
        let session = session_with(&[r#"{"rules": []}"#]);
        let handle = session.insert(state("a1", "t", json!(1))).unwrap();
        session.halt();

        assert!(session.is_halted());
        assert!(session.insert(state("a2", "t", json!(1))).is_err());
        assert!(session.delete(handle).is_err());
        // halt 后触发循环立即返回
        assert!(session.fire_until_halt().is_ok());
    }

    #[test]
    fn test_set_global() {
        let session = session_with(&[r#"{"globals": ["LOG"], "rules": []}"#]);

        assert!(session
            .set_global(GLOBAL_LOG, GlobalValue::Logger(RulesLog::new("test")))
            .is_ok());

        let err = session
            .set_global(GLOBAL_USERS, GlobalValue::Users(Arc::new(crate::facade::EmptyUsersFacade)))
            .unwrap_err();
        assert_eq!(err, RuleError::UnknownGlobal("users".to_string()));

        let err = session
            .set_global(GLOBAL_LOG, GlobalValue::Users(Arc::new(crate::facade::EmptyUsersFacade)))
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_ERROR");
    }

    #[test]
    fn test_write_attribute_uses_facade() {
        let session = session_with(&[r#"
        {
            "globals": ["assets"],
            "rules": [{
                "name": "mirror",
                "fact": "state",
                "when": { "type": "condition", "field": "attributeName", "operator": "eq", "value": "setpoint" },
                "then": [{ "action": "write_attribute", "attributeName": "target", "valueFrom": "value" }]
            }]
        }
        "#]);

        let mut assets = MockAssetsFacade::new();
        assets
            .expect_dispatch()
            .withf(|r| r.asset_id == "a1" && r.attribute_name == "target" && r.value == json!(21))
            .times(1)
            .returning(|_| Ok(()));
        session
            .set_global(GLOBAL_ASSETS, GlobalValue::Assets(Arc::new(assets)))
            .unwrap();

        session.insert(state("a1", "setpoint", json!(21))).unwrap();
        let worker = spawn_firing(&session);
        thread::sleep(Duration::from_millis(200));
        session.halt();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_failing_action_returns_execution_error() {
        let session = session_with(&[r#"
        {
            "globals": ["LOG"],
            "rules": [{ "name": "needs-log", "then": [{ "action": "log", "message": "hi" }] }]
        }
        "#]);

        session.insert(state("a1", "t", json!(1))).unwrap();
        // LOG 未绑定，动作失败
        let err = session.fire_until_halt().unwrap_err();
        assert!(matches!(err, RuleError::Execution { ref rule, .. } if rule == "needs-log"));

        // 失败的激活不会重复触发，重新进入循环后只等待 halt
        let worker = spawn_firing(&session);
        thread::sleep(Duration::from_millis(50));
        session.halt();
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn test_retract_custom() {
        let session = session_with(&[r#"
        {
            "rules": [
                { "name": "raise", "fact": "state", "then": [{ "action": "insert", "fact": { "alarm": "a1" } }] },
                {
                    "name": "clear",
                    "fact": "custom",
                    "when": { "type": "condition", "field": "alarm", "operator": "eq", "value": "a1" },
                    "then": [{ "action": "retract_custom", "fact": { "alarm": "a1" } }]
                }
            ]
        }
        "#]);
        let worker = spawn_firing(&session);

        session.insert(state("a1", "t", json!(1))).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(session.stats().total, 1);
        assert!(custom_facts(&session).is_empty());

        session.halt();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_dispose_clears_memory_and_jobs() {
        let session = session_with(&[r#"{"rules": []}"#]);
        session.insert(state("a1", "t", json!(1))).unwrap();
        session.schedule(10, Box::new(|| {}));

        session.dispose();
        assert!(session.is_halted());
        assert_eq!(session.stats().total, 0);
        assert_eq!(session.clock().pending_jobs(), 0);
        assert!(session.fire_until_halt().is_err());
    }

    #[test]
    fn test_interpolate() {
        let fact = json!({"assetId": "a1", "value": 30, "nested": {"x": "y"}});
        assert_eq!(
            interpolate("${assetId} is ${value} (${nested.x}) ${missing}", &fact),
            "a1 is 30 (y) ${missing}"
        );
    }
}
