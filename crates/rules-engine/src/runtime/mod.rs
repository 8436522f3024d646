//! 规则运行时能力接口
//!
//! 引擎只通过这些 trait 使用运行时：知识库负责编译和保存规则集产物，
//! 会话持有工作内存并在专用线程上持续触发规则。`JsonRulesRuntime` 是基于
//! JSON 规则文档的参考实现。

pub mod clock;
pub mod memory;
pub mod session;

pub use clock::{Job, SessionClock};
pub use memory::WorkingMemory;
pub use session::JsonRuleSession;

use crate::compiler::{CompiledRuleset, RulesetCompiler};
use crate::error::{Result, RuleError};
use crate::facade::GlobalValue;
use crate::models::{Fact, FactHandle, FactStats};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// 提交给会话原子执行的工作单元
#[derive(Debug, Clone)]
pub enum WorkUnit {
    /// 删除旧事实（如果有）并以指定句柄插入新事实，两步之间不会触发规则
    Replace {
        old: Option<FactHandle>,
        handle: FactHandle,
        fact: Fact,
    },
}

/// 一次成功的规则触发
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFiring {
    pub ruleset_id: i64,
    pub rule: String,
    pub handle: FactHandle,
    /// 匹配事实的 JSON 投影
    pub fact: Value,
}

/// 规则触发监听器
pub type FireListener = Arc<dyn Fn(&RuleFiring) + Send + Sync>;

/// 规则运行时
pub trait RulesRuntime: Send + Sync {
    fn new_knowledge_base(&self) -> Arc<dyn KnowledgeBase>;
}

/// 知识库：已编译规则集产物的集合
pub trait KnowledgeBase: Send + Sync {
    fn release_id(&self) -> u64;

    /// 编译并保存规则集产物，同一 ID 的旧产物被替换
    fn add(&self, ruleset_id: i64, rules: &str) -> Result<()>;

    /// 删除规则集产物，返回是否存在
    fn remove(&self, ruleset_id: i64) -> bool;

    fn contains(&self, ruleset_id: i64) -> bool;

    /// 按给定顺序组合规则集产物创建会话
    fn new_session(&self, order: &[i64], clock: SessionClock) -> Result<Arc<dyn RuleSession>>;
}

/// 规则会话
pub trait RuleSession: Send + Sync {
    fn clock(&self) -> SessionClock;

    /// 在会话时钟上调度作业
    fn schedule(&self, at: i64, job: Job) {
        self.clock().schedule(at, job);
    }

    /// 绑定全局变量，未声明的变量返回 `RuleError::UnknownGlobal`
    fn set_global(&self, name: &str, value: GlobalValue) -> Result<()>;

    /// 设置规则触发监听器，`None` 表示移除
    fn set_fire_listener(&self, listener: Option<FireListener>);

    fn insert(&self, fact: Fact) -> Result<FactHandle>;

    fn delete(&self, handle: FactHandle) -> Result<()>;

    /// 分配一个新的事实句柄，供 `submit` 使用
    fn next_handle(&self) -> FactHandle;

    /// 提交工作单元，在下一次触发前原子执行
    fn submit(&self, unit: WorkUnit) -> Result<()>;

    /// 持续触发规则直到 halt，规则动作失败时返回 `RuleError::Execution`
    fn fire_until_halt(&self) -> Result<()>;

    fn halt(&self);

    fn dispose(&self);

    fn is_halted(&self) -> bool;

    fn stats(&self) -> FactStats;

    fn facts(&self) -> Vec<(FactHandle, Fact)>;
}

/// 知识库发布 ID
static NEXT_RELEASE_ID: AtomicU64 = AtomicU64::new(1);

/// JSON 规则文档运行时
#[derive(Debug, Default)]
pub struct JsonRulesRuntime;

impl JsonRulesRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl RulesRuntime for JsonRulesRuntime {
    fn new_knowledge_base(&self) -> Arc<dyn KnowledgeBase> {
        Arc::new(JsonKnowledgeBase::new())
    }
}

/// JSON 规则文档知识库
pub struct JsonKnowledgeBase {
    release_id: u64,
    compiler: Mutex<RulesetCompiler>,
    artifacts: Mutex<IndexMap<i64, Arc<CompiledRuleset>>>,
}

impl JsonKnowledgeBase {
    pub fn new() -> Self {
        Self {
            release_id: NEXT_RELEASE_ID.fetch_add(1, Ordering::SeqCst),
            compiler: Mutex::new(RulesetCompiler::new()),
            artifacts: Mutex::new(IndexMap::new()),
        }
    }
}

impl Default for JsonKnowledgeBase {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeBase for JsonKnowledgeBase {
    fn release_id(&self) -> u64 {
        self.release_id
    }

    fn add(&self, ruleset_id: i64, rules: &str) -> Result<()> {
        let compiled = self.compiler.lock().compile(ruleset_id, rules)?;
        debug!(
            release_id = self.release_id,
            ruleset_id,
            rules = compiled.rules.len(),
            compile_version = compiled.compile_version,
            "规则集产物已编译"
        );
        self.artifacts.lock().insert(ruleset_id, Arc::new(compiled));
        Ok(())
    }

    fn remove(&self, ruleset_id: i64) -> bool {
        self.artifacts.lock().shift_remove(&ruleset_id).is_some()
    }

    fn contains(&self, ruleset_id: i64) -> bool {
        self.artifacts.lock().contains_key(&ruleset_id)
    }

    fn new_session(&self, order: &[i64], clock: SessionClock) -> Result<Arc<dyn RuleSession>> {
        let artifacts = self.artifacts.lock();
        let rulesets = order
            .iter()
            .map(|id| {
                artifacts.get(id).cloned().ok_or_else(|| {
                    RuleError::Session(format!("知识库中不存在规则集 {} 的产物", id))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Arc::new(JsonRuleSession::new(rulesets, clock)))
    }
}
