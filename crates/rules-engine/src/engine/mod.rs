//! 作用域规则引擎
//!
//! 每个作用域（全局、租户、资产）拥有一个引擎实例。引擎维护已部署的规则集、
//! 知识库、运行中的会话以及宿主推送的属性状态。所有公共操作都在引擎互斥锁内
//! 串行执行；触发线程只持有会话的弱引用，不会获取引擎锁。

mod deployment;
mod expiration;
mod facts;
mod lifecycle;

use crate::error::RuleError;
use crate::facade::Facades;
use crate::models::{
    AssetEvent, AssetState, AttributeRef, EngineStatus, Fact, FactSnapshot, FactStats, Ruleset,
    RulesetScope, RulesetSummary,
};
use crate::runtime::{
    FireListener, JsonRulesRuntime, KnowledgeBase, RuleFiring, RuleSession, RulesRuntime,
    SessionClock,
};
use crate::stats::{LogStatsSink, StatsSink};
use crate::template::{TemplateCompiler, TemplateSource};
use crate::timer::TimerService;
use indexmap::IndexMap;
use lifecycle::{FiringWorker, StatsTimer};
use parking_lot::{Mutex, MutexGuard};
use rules_shared::EngineConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, instrument};

/// 资产事件观察者，在事件插入会话后调用
pub type EventObserver = Arc<dyn Fn(&AssetEvent) + Send + Sync>;

/// 引擎进入错误状态时调用
///
/// 调用时持有引擎锁，经由 `RulesService` 部署或撤回时还持有注册表条目，
/// 监听器内不能再访问同一引擎或服务。
pub type ErrorListener = Arc<dyn Fn(&RulesetScope, &RuleError) + Send + Sync>;

/// 触发线程记录的致命错误，由下一次公共操作取出
type FaultSlot = Arc<Mutex<Option<RuleError>>>;

/// 引擎共享的宿主能力
#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub timer: TimerService,
    pub runtime: Arc<dyn RulesRuntime>,
    pub facades: Facades,
    pub template_source: Option<Arc<dyn TemplateSource>>,
    pub stats_sink: Arc<dyn StatsSink>,
    /// 新建引擎默认使用的错误监听器
    pub error_listener: Option<ErrorListener>,
    /// 新建引擎默认使用的规则触发监听器
    pub fire_listener: Option<FireListener>,
}

impl EngineContext {
    /// 按配置的时钟模式创建上下文，使用 JSON 规则运行时
    pub fn new(config: EngineConfig) -> Self {
        let timer = TimerService::new(config.clock);
        Self {
            config,
            timer,
            runtime: Arc::new(JsonRulesRuntime::new()),
            facades: Facades::default(),
            template_source: None,
            stats_sink: Arc::new(LogStatsSink),
            error_listener: None,
            fire_listener: None,
        }
    }

    pub fn with_timer(mut self, timer: TimerService) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn RulesRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_facades(mut self, facades: Facades) -> Self {
        self.facades = facades;
        self
    }

    pub fn with_template_source(mut self, source: Arc<dyn TemplateSource>) -> Self {
        self.template_source = Some(source);
        self
    }

    pub fn with_stats_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.stats_sink = sink;
        self
    }

    pub fn with_error_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&RulesetScope, &RuleError) + Send + Sync + 'static,
    {
        self.error_listener = Some(Arc::new(listener));
        self
    }

    pub fn with_fire_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&RuleFiring) + Send + Sync + 'static,
    {
        self.fire_listener = Some(Arc::new(listener));
        self
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("timer", &self.timer)
            .field("template_source", &self.template_source.is_some())
            .field("error_listener", &self.error_listener.is_some())
            .field("fire_listener", &self.fire_listener.is_some())
            .finish()
    }
}

/// 引擎跟踪的属性状态
#[derive(Debug, Clone)]
struct TrackedFact {
    state: AssetState,
    /// 在当前会话中的句柄，引擎未运行时为空
    handle: Option<crate::models::FactHandle>,
}

struct EngineInner {
    ctx: EngineContext,
    scope: RulesetScope,
    label: String,
    templates: TemplateCompiler,
    knowledge_base: Option<Arc<dyn KnowledgeBase>>,
    rulesets: IndexMap<i64, Ruleset>,
    failures: IndexMap<i64, RuleError>,
    error: Option<RuleError>,
    running: bool,
    session: Option<Arc<dyn RuleSession>>,
    worker: Option<FiringWorker>,
    stats_timer: Option<StatsTimer>,
    facts: IndexMap<AttributeRef, TrackedFact>,
    state_inserts: u64,
    event_observer: Option<EventObserver>,
    error_listener: Option<ErrorListener>,
    fire_listener: Option<FireListener>,
    fault: FaultSlot,
}

impl EngineInner {
    fn new(scope: &RulesetScope, ctx: EngineContext) -> Self {
        let error_listener = ctx.error_listener.clone();
        let fire_listener = ctx.fire_listener.clone();
        Self {
            ctx,
            scope: scope.clone(),
            label: scope.to_string(),
            templates: TemplateCompiler::new(),
            knowledge_base: None,
            rulesets: IndexMap::new(),
            failures: IndexMap::new(),
            error: None,
            running: false,
            session: None,
            worker: None,
            stats_timer: None,
            facts: IndexMap::new(),
            state_inserts: 0,
            event_observer: None,
            error_listener,
            fire_listener,
            fault: Arc::new(Mutex::new(None)),
        }
    }

    /// 取出触发线程记录的致命错误，停止引擎并进入错误状态
    fn reap_fault(&mut self) {
        let fault = self.fault.lock().take();
        if let Some(fault) = fault {
            error!(engine = %self.label, error = %fault, "规则触发线程已放弃，引擎进入错误状态");
            self.stop();
            self.set_error(fault);
        }
    }

    /// 记录引擎错误并通知错误监听器
    fn set_error(&mut self, error: RuleError) {
        if let Some(listener) = &self.error_listener {
            listener(&self.scope, &error);
        }
        self.error = Some(error);
    }

    fn summaries(&self) -> Vec<RulesetSummary> {
        self.rulesets.values().map(Ruleset::summary).collect()
    }
}

impl fmt::Display for EngineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RulesEngine{{id='{}', running={}, error=", self.label, self.running)?;
        match &self.error {
            Some(error) => write!(f, "'{}'", error)?,
            None => write!(f, "None")?,
        }
        write!(f, ", rulesets=[")?;
        for (i, ruleset) in self.rulesets.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", ruleset.name, ruleset.status)?;
        }
        write!(f, "]}}")
    }
}

/// 单个作用域的规则引擎
pub struct RulesEngine {
    scope: RulesetScope,
    inner: Mutex<EngineInner>,
}

impl RulesEngine {
    pub fn new(scope: RulesetScope, ctx: EngineContext) -> Self {
        let inner = EngineInner::new(&scope, ctx);
        Self {
            scope,
            inner: Mutex::new(inner),
        }
    }

    pub fn scope(&self) -> &RulesetScope {
        &self.scope
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        let mut inner = self.inner.lock();
        inner.reap_fault();
        inner
    }

    // ==================== 规则集 ====================

    /// 部署或更新规则集
    ///
    /// 编译失败不会返回错误，而是体现在引擎状态中；只有作用域不匹配时返回错误。
    #[instrument(skip(self, ruleset), fields(engine = %self.scope, ruleset_id = ruleset.id, version = ruleset.version))]
    pub fn deploy(&self, ruleset: Ruleset, force_update: bool) -> crate::error::Result<()> {
        ruleset.scope.validate()?;
        if ruleset.scope != self.scope {
            return Err(RuleError::InvalidInput(format!(
                "规则集 {} 的作用域 {} 与引擎作用域 {} 不一致",
                ruleset.id, ruleset.scope, self.scope
            )));
        }
        self.lock().deploy(ruleset, force_update);
        Ok(())
    }

    /// 撤回规则集，未部署过的 ID 忽略
    #[instrument(skip(self), fields(engine = %self.scope))]
    pub fn retract(&self, ruleset_id: i64) {
        self.lock().retract(ruleset_id);
    }

    pub fn start(&self) {
        self.lock().start();
    }

    pub fn stop(&self) {
        self.lock().stop();
    }

    // ==================== 事实 ====================

    /// 插入或更新属性状态
    pub fn upsert_state(&self, state: AssetState) {
        self.lock().upsert_state(state);
    }

    /// 移除属性状态
    pub fn retract_state(&self, attribute: &AttributeRef) {
        self.lock().retract_state(attribute);
    }

    /// 插入在 `expires_in` 后过期的资产事件，引擎未运行时丢弃
    ///
    /// 事件观察者在释放引擎锁之后调用。
    pub fn insert_event(&self, expires_in: Duration, state: AssetState) {
        let inserted = self.lock().insert_event(expires_in, state);
        if let Some((observer, event)) = inserted {
            observer(&event);
        }
    }

    pub fn set_event_observer<F>(&self, observer: F)
    where
        F: Fn(&AssetEvent) + Send + Sync + 'static,
    {
        self.lock().event_observer = Some(Arc::new(observer));
    }

    pub fn clear_event_observer(&self) {
        self.lock().event_observer = None;
    }

    /// 设置错误监听器，替换上下文提供的默认监听器
    ///
    /// 监听器在引擎锁内调用，不能再访问同一引擎。
    pub fn set_error_listener<F>(&self, listener: F)
    where
        F: Fn(&RulesetScope, &RuleError) + Send + Sync + 'static,
    {
        self.lock().error_listener = Some(Arc::new(listener));
    }

    pub fn clear_error_listener(&self) {
        self.lock().error_listener = None;
    }

    /// 设置规则触发监听器，运行中的会话立即生效
    ///
    /// 监听器在触发线程上、规则动作执行成功之后调用。
    pub fn set_fire_listener<F>(&self, listener: F)
    where
        F: Fn(&RuleFiring) + Send + Sync + 'static,
    {
        let listener: FireListener = Arc::new(listener);
        let mut inner = self.lock();
        if let Some(session) = &inner.session {
            session.set_fire_listener(Some(listener.clone()));
        }
        inner.fire_listener = Some(listener);
    }

    pub fn clear_fire_listener(&self) {
        let mut inner = self.lock();
        if let Some(session) = &inner.session {
            session.set_fire_listener(None);
        }
        inner.fire_listener = None;
    }

    // ==================== 查询 ====================

    pub fn status(&self) -> EngineStatus {
        let inner = self.lock();
        EngineStatus {
            scope: self.scope.clone(),
            running: inner.running,
            error: inner.error.clone(),
            rulesets: inner.summaries(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_error(&self) -> bool {
        self.lock().error.is_some()
    }

    pub fn error(&self) -> Option<RuleError> {
        self.lock().error.clone()
    }

    /// 是否没有任何规则集
    pub fn is_empty(&self) -> bool {
        self.lock().rulesets.is_empty()
    }

    pub fn rulesets(&self) -> Vec<RulesetSummary> {
        self.lock().summaries()
    }

    /// 当前会话的时钟，引擎未运行时为空
    pub fn session_clock(&self) -> Option<SessionClock> {
        self.lock().session.as_ref().map(|session| session.clock())
    }

    /// 推进当前会话的逻辑时钟，到期作业在调用线程中执行
    ///
    /// 推进时不持有引擎锁，返回推进后的会话时间；引擎未运行或使用实时时钟时返回空。
    pub fn advance_session_clock(&self, by: Duration) -> Option<i64> {
        let clock = self.session_clock()?;
        if !clock.is_pseudo() {
            return None;
        }
        clock.advance_time(by).ok()
    }

    pub fn fact_stats(&self) -> FactStats {
        self.lock()
            .session
            .as_ref()
            .map(|session| session.stats())
            .unwrap_or_default()
    }

    /// 引擎跟踪的属性状态
    pub fn facts(&self) -> Vec<FactSnapshot> {
        self.lock()
            .facts
            .values()
            .map(|tracked| FactSnapshot {
                state: tracked.state.clone(),
                synchronized: tracked.handle.is_some(),
            })
            .collect()
    }

    /// 会话工作内存中的全部事实
    pub fn working_memory(&self) -> Vec<Fact> {
        self.lock()
            .session
            .as_ref()
            .map(|session| session.facts().into_iter().map(|(_, fact)| fact).collect())
            .unwrap_or_default()
    }

    /// 累计插入会话的属性状态次数
    pub fn state_insert_count(&self) -> u64 {
        self.lock().state_inserts
    }
}

impl fmt::Display for RulesEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner.lock(), f)
    }
}

impl fmt::Debug for RulesEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Drop for RulesEngine {
    fn drop(&mut self) {
        self.inner.get_mut().stop();
    }
}
