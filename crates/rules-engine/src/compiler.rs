//! 规则集编译器
//!
//! 将规则集 JSON 文档解析并编译成内存中的执行结构：校验条件树和动作，
//! 预编译正则表达式，并按优先级排列规则。

use crate::document::{
    Condition, FactSelector, Operator, RuleAction, RuleDefinition, RuleDocument, RuleNode,
};
use crate::error::{Result, RuleError};
use crate::facade::KNOWN_GLOBALS;
use regex::Regex;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

/// 预编译的正则表达式缓存
#[derive(Debug, Clone, Default)]
pub struct PatternCache {
    patterns: HashMap<String, Regex>,
}

impl PatternCache {
    pub fn get(&self, pattern: &str) -> Option<&Regex> {
        self.patterns.get(pattern)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn insert(&mut self, pattern: &str, regex: Regex) {
        self.patterns.insert(pattern.to_string(), regex);
    }
}

/// 编译后的规则
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub salience: i32,
    pub selector: FactSelector,
    pub when: Option<RuleNode>,
    pub actions: Vec<RuleAction>,
}

/// 编译后的规则集
#[derive(Debug, Clone)]
pub struct CompiledRuleset {
    pub ruleset_id: i64,
    /// 声明的全局变量
    pub globals: HashSet<String>,
    /// 按 salience 降序、声明顺序排列
    pub rules: Vec<CompiledRule>,
    pub patterns: PatternCache,
    /// 编译版本号
    pub compile_version: u64,
}

/// 规则集编译器
pub struct RulesetCompiler {
    compile_version: u64,
}

impl RulesetCompiler {
    pub fn new() -> Self {
        Self { compile_version: 0 }
    }

    /// 编译规则集文本，失败时返回 `RuleError::Compile`
    pub fn compile(&mut self, ruleset_id: i64, text: &str) -> Result<CompiledRuleset> {
        self.compile_document(ruleset_id, text)
            .map_err(|e| match e {
                RuleError::Compile { .. } => e,
                other => RuleError::Compile {
                    ruleset_id,
                    reason: other.to_string(),
                },
            })
    }

    fn compile_document(&mut self, ruleset_id: i64, text: &str) -> Result<CompiledRuleset> {
        let document: RuleDocument = serde_json::from_str(text)?;

        let globals = self.validate_globals(&document.globals)?;

        let mut patterns = PatternCache::default();
        let mut names = HashSet::new();
        let mut rules = Vec::with_capacity(document.rules.len());

        for (i, rule) in document.rules.into_iter().enumerate() {
            self.validate_rule(&rule, i, &mut names, &globals, &mut patterns)?;

            rules.push(CompiledRule {
                name: rule.name,
                salience: rule.salience,
                selector: rule.fact,
                when: rule.when,
                actions: rule.then,
            });
        }

        // 稳定排序，同优先级保持声明顺序
        rules.sort_by_key(|r| Reverse(r.salience));

        self.compile_version += 1;

        Ok(CompiledRuleset {
            ruleset_id,
            globals,
            rules,
            patterns,
            compile_version: self.compile_version,
        })
    }

    /// 验证声明的全局变量
    fn validate_globals(&self, globals: &[String]) -> Result<HashSet<String>> {
        let mut declared = HashSet::new();
        for name in globals {
            if !KNOWN_GLOBALS.contains(&name.as_str()) {
                return Err(RuleError::Parse(format!("未知的全局变量声明: '{}'", name)));
            }
            declared.insert(name.clone());
        }
        Ok(declared)
    }

    /// 验证单条规则
    fn validate_rule(
        &self,
        rule: &RuleDefinition,
        index: usize,
        names: &mut HashSet<String>,
        globals: &HashSet<String>,
        patterns: &mut PatternCache,
    ) -> Result<()> {
        if rule.name.trim().is_empty() {
            return Err(RuleError::Parse(format!("rules[{}] 的规则名称不能为空", index)));
        }

        if !names.insert(rule.name.clone()) {
            return Err(RuleError::Parse(format!("规则名称重复: '{}'", rule.name)));
        }

        if let Some(when) = &rule.when {
            self.validate_node(when, &format!("{}.when", rule.name), patterns)?;
        }

        for (i, action) in rule.then.iter().enumerate() {
            let path = format!("{}.then[{}]", rule.name, i);
            self.validate_action(action, &path, globals)?;
        }

        Ok(())
    }

    /// 验证规则节点
    fn validate_node(&self, node: &RuleNode, path: &str, patterns: &mut PatternCache) -> Result<()> {
        match node {
            RuleNode::Condition(cond) => {
                self.validate_condition(cond, path, patterns)?;
            }
            RuleNode::Group(group) => {
                if group.children.is_empty() {
                    return Err(RuleError::Parse(format!("逻辑组 '{}' 不能为空", path)));
                }

                for (i, child) in group.children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    self.validate_node(child, &child_path, patterns)?;
                }
            }
        }

        Ok(())
    }

    /// 验证条件及操作符和值的兼容性
    fn validate_condition(
        &self,
        cond: &Condition,
        path: &str,
        patterns: &mut PatternCache,
    ) -> Result<()> {
        if cond.field.is_empty() {
            return Err(RuleError::Parse(format!("条件 '{}' 的字段不能为空", path)));
        }

        match cond.operator {
            Operator::Between => match &cond.value {
                Value::Array(arr) if arr.len() == 2 => {}
                Value::Array(arr) => {
                    return Err(RuleError::Parse(format!(
                        "条件 '{}' 的 between 操作符需要 [min, max] 数组，当前有 {} 个元素",
                        path,
                        arr.len()
                    )));
                }
                _ => {
                    return Err(RuleError::Parse(format!(
                        "条件 '{}' 的 between 操作符需要 [min, max] 数组",
                        path
                    )));
                }
            },
            op if op.expects_array() => {
                if !cond.value.is_array() {
                    return Err(RuleError::Parse(format!(
                        "条件 '{}' 的 {} 操作符需要数组值",
                        path, cond.operator
                    )));
                }
            }
            Operator::Regex => {
                let Some(pattern) = cond.value.as_str() else {
                    return Err(RuleError::Parse(format!(
                        "条件 '{}' 的 regex 操作符需要字符串值",
                        path
                    )));
                };
                let regex = Regex::new(pattern).map_err(|e| {
                    RuleError::Parse(format!("条件 '{}' 的正则表达式无效: {}", path, e))
                })?;
                patterns.insert(pattern, regex);
            }
            _ => {}
        }

        Ok(())
    }

    /// 验证动作参数及其依赖的全局变量
    fn validate_action(
        &self,
        action: &RuleAction,
        path: &str,
        globals: &HashSet<String>,
    ) -> Result<()> {
        if let Some(global) = action.required_global()
            && !globals.contains(global)
        {
            return Err(RuleError::Parse(format!(
                "动作 '{}' ({}) 需要声明全局变量 '{}'",
                path,
                action.name(),
                global
            )));
        }

        match action {
            RuleAction::Log { message } if message.is_empty() => Err(RuleError::Parse(format!(
                "动作 '{}' 的日志消息不能为空",
                path
            ))),
            RuleAction::Insert { fact } | RuleAction::RetractCustom { fact } if fact.is_null() => {
                Err(RuleError::Parse(format!("动作 '{}' 的事实不能为 null", path)))
            }
            RuleAction::WriteAttribute {
                attribute_name,
                value,
                value_from,
                ..
            } => {
                if attribute_name.is_empty() {
                    return Err(RuleError::Parse(format!("动作 '{}' 的属性名不能为空", path)));
                }
                if value.is_some() == value_from.is_some() {
                    return Err(RuleError::Parse(format!(
                        "动作 '{}' 必须且只能指定 value 或 valueFrom 之一",
                        path
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Default for RulesetCompiler {
    fn default() -> Self {
        Self::new()
    }
}
