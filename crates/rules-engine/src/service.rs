//! 规则服务
//!
//! 持有全局引擎以及按需创建的租户、资产引擎，把规则集部署到对应作用域，
//! 并把宿主推送的属性状态和资产事件分发给所有相关引擎：全局引擎、资产所在
//! 租户的引擎、资产自身及其祖先资产的引擎。

use crate::engine::{EngineContext, RulesEngine};
use crate::error::Result;
use crate::models::{AssetState, AttributeRef, EngineStatus, Ruleset, RulesetScope};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub struct RulesService {
    context: EngineContext,
    global: Arc<RulesEngine>,
    tenants: DashMap<String, Arc<RulesEngine>>,
    assets: DashMap<String, Arc<RulesEngine>>,
    /// 最近一次推送的属性状态，用于初始化新建的引擎
    known_states: DashMap<AttributeRef, AssetState>,
}

impl RulesService {
    pub fn new(context: EngineContext) -> Self {
        let global = Arc::new(RulesEngine::new(RulesetScope::Global, context.clone()));
        Self {
            context,
            global,
            tenants: DashMap::new(),
            assets: DashMap::new(),
            known_states: DashMap::new(),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn global_engine(&self) -> Arc<RulesEngine> {
        self.global.clone()
    }

    /// 作用域对应的引擎，尚未创建时返回空
    pub fn engine(&self, scope: &RulesetScope) -> Option<Arc<RulesEngine>> {
        match scope {
            RulesetScope::Global => Some(self.global.clone()),
            RulesetScope::Tenant { realm } => self.tenants.get(realm).map(|e| e.value().clone()),
            RulesetScope::Asset { asset_id, .. } => {
                self.assets.get(asset_id).map(|e| e.value().clone())
            }
        }
    }

    // ==================== 规则集 ====================

    /// 部署规则集到其作用域的引擎，必要时创建引擎
    ///
    /// 部署在持有注册表条目时完成，同一作用域上并发的撤回不会移除这个引擎。
    #[instrument(skip(self, ruleset), fields(scope = %ruleset.scope, ruleset_id = ruleset.id))]
    pub fn deploy(&self, ruleset: Ruleset, force_update: bool) -> Result<EngineStatus> {
        ruleset.scope.validate()?;
        let scope = ruleset.scope.clone();

        let Some((engines, key)) = self.registry(&scope) else {
            self.global.deploy(ruleset, force_update)?;
            return Ok(self.global.status());
        };

        let engine = engines
            .entry(key.clone())
            .or_insert_with(|| self.create_engine(&scope));
        engine.deploy(ruleset, force_update)?;
        Ok(engine.status())
    }

    /// 从作用域撤回规则集，非全局引擎变空后被移除
    #[instrument(skip(self), fields(scope = %scope))]
    pub fn retract(&self, scope: &RulesetScope, ruleset_id: i64) {
        let Some((engines, key)) = self.registry(scope) else {
            self.global.retract(ruleset_id);
            return;
        };

        // 撤回和移除空引擎在同一个条目锁内完成
        let removed = match engines.entry(key.clone()) {
            Entry::Occupied(entry) => {
                entry.get().retract(ruleset_id);
                if entry.get().is_empty() {
                    Some(entry.remove())
                } else {
                    None
                }
            }
            Entry::Vacant(_) => {
                debug!("作用域没有引擎，忽略撤回");
                None
            }
        };

        if let Some(engine) = removed {
            engine.stop();
            info!(engine = %engine.scope(), "作用域引擎已移除");
        }
    }

    /// 非全局作用域所在的注册表和键
    fn registry<'s, 'k>(
        &'s self,
        scope: &'k RulesetScope,
    ) -> Option<(&'s DashMap<String, Arc<RulesEngine>>, &'k String)> {
        match scope {
            RulesetScope::Global => None,
            RulesetScope::Tenant { realm } => Some((&self.tenants, realm)),
            RulesetScope::Asset { asset_id, .. } => Some((&self.assets, asset_id)),
        }
    }

    /// 创建作用域引擎并用已知的相关属性状态初始化
    fn create_engine(&self, scope: &RulesetScope) -> Arc<RulesEngine> {
        let engine = Arc::new(RulesEngine::new(scope.clone(), self.context.clone()));
        let mut seeded = 0;
        for state in self.known_states.iter() {
            if is_relevant(scope, state.value()) {
                engine.upsert_state(state.value().clone());
                seeded += 1;
            }
        }
        info!(engine = %scope, seeded, "创建作用域引擎");
        engine
    }

    // ==================== 事实分发 ====================

    /// 推送属性状态到所有相关引擎
    pub fn upsert_state(&self, state: AssetState) {
        self.known_states.insert(state.attribute_ref(), state.clone());
        for engine in self.engines_for(&state) {
            engine.upsert_state(state.clone());
        }
    }

    /// 移除属性状态；未知状态广播给所有引擎
    pub fn retract_state(&self, attribute: &AttributeRef) {
        let engines = match self.known_states.remove(attribute) {
            Some((_, state)) => self.engines_for(&state),
            None => {
                debug!(%attribute, "未记录的属性状态，广播移除");
                self.all_engines()
            }
        };
        for engine in engines {
            engine.retract_state(attribute);
        }
    }

    /// 插入资产事件到所有相关引擎
    pub fn insert_event(&self, state: AssetState, expires_in: Duration) {
        for engine in self.engines_for(&state) {
            engine.insert_event(expires_in, state.clone());
        }
    }

    fn engines_for(&self, state: &AssetState) -> Vec<Arc<RulesEngine>> {
        let mut engines = vec![self.global.clone()];
        if let Some(tenant) = self.tenants.get(&state.realm) {
            engines.push(tenant.value().clone());
        }
        for asset_id in state.parent_path.iter().chain(std::iter::once(&state.asset_id)) {
            if let Some(engine) = self.assets.get(asset_id)
                && !engines.iter().any(|e| Arc::ptr_eq(e, engine.value()))
            {
                engines.push(engine.value().clone());
            }
        }
        engines
    }

    fn all_engines(&self) -> Vec<Arc<RulesEngine>> {
        std::iter::once(self.global.clone())
            .chain(self.tenants.iter().map(|e| e.value().clone()))
            .chain(self.assets.iter().map(|e| e.value().clone()))
            .collect()
    }

    // ==================== 时钟与状态 ====================

    /// 推进所有运行中引擎的会话时钟，然后推进宿主逻辑时钟
    ///
    /// 两步之间没有锁。先推进会话时钟，推进期间启动的引擎以推进前的宿主时间
    /// 为起点，不会被推进两次；它的会话时钟会落后本次推进的时长。
    pub fn advance_clock(&self, by: Duration) -> Result<i64> {
        if !self.context.timer.is_pseudo() {
            return self.context.timer.advance_time(by);
        }
        for engine in self.all_engines() {
            engine.advance_session_clock(by);
        }
        self.context.timer.advance_time(by)
    }

    pub fn status(&self, scope: &RulesetScope) -> Option<EngineStatus> {
        self.engine(scope).map(|engine| engine.status())
    }

    pub fn statuses(&self) -> Vec<EngineStatus> {
        self.all_engines().iter().map(|engine| engine.status()).collect()
    }

    /// 停止所有引擎
    pub fn shutdown(&self) {
        info!("停止所有规则引擎");
        for engine in self.all_engines() {
            engine.stop();
        }
        let failed = self.statuses().iter().filter(|s| s.error.is_some()).count();
        if failed > 0 {
            warn!(failed, "部分引擎处于错误状态");
        }
    }
}

/// 属性状态是否属于作用域
fn is_relevant(scope: &RulesetScope, state: &AssetState) -> bool {
    match scope {
        RulesetScope::Global => true,
        RulesetScope::Tenant { realm } => state.realm == *realm,
        RulesetScope::Asset { asset_id, .. } => state.is_within(asset_id),
    }
}
