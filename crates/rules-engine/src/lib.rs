//! 作用域规则引擎
//!
//! 为全局、租户和资产三类作用域分别维护规则引擎：
//! - JSON 规则集的编译、部署、撤回以及部署状态跟踪
//! - 专用线程上持续触发规则的会话
//! - 属性状态的原子同步与带有效期的资产事件
//! - 实时或逻辑会话时钟

pub mod compiler;
pub mod document;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod facade;
pub mod models;
pub mod runtime;
pub mod service;
pub mod stats;
pub mod template;
pub mod timer;

pub use engine::{EngineContext, ErrorListener, EventObserver, RulesEngine};
pub use error::{Result, RuleError};
pub use facade::{AssetsFacade, AttributeWriteRequest, Facades, UsersFacade};
pub use models::{
    AssetEvent, AssetState, AttributeRef, DeploymentStatus, EngineStatus, Fact, FactHandle,
    FactSnapshot, FactStats, Ruleset, RulesetScope, RulesetSummary,
};
pub use runtime::{
    FireListener, JsonRulesRuntime, KnowledgeBase, RuleFiring, RuleSession, RulesRuntime,
    SessionClock, WorkUnit,
};
pub use service::RulesService;
pub use stats::{LogStatsSink, StatsSink};
pub use template::{InMemoryTemplateSource, TemplateAsset, TemplateSource};
pub use timer::TimerService;
