//! 规则集部署与撤回

use super::EngineInner;
use crate::error::{Result, RuleError};
use crate::models::{DeploymentStatus, Ruleset};
use crate::runtime::KnowledgeBase;
use rules_shared::observability::metrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

impl EngineInner {
    /// 知识库在第一次部署时创建
    fn knowledge_base(&mut self) -> Arc<dyn KnowledgeBase> {
        let runtime = &self.ctx.runtime;
        let label = &self.label;
        self.knowledge_base
            .get_or_insert_with(|| {
                let knowledge_base = runtime.new_knowledge_base();
                debug!(engine = %label, release_id = knowledge_base.release_id(), "创建知识库");
                knowledge_base
            })
            .clone()
    }

    pub(super) fn deploy(&mut self, mut ruleset: Ruleset, force_update: bool) {
        let Some(rules) = ruleset.rules.take().filter(|rules| !rules.trim().is_empty()) else {
            debug!(engine = %self.label, ruleset_id = ruleset.id, "规则集没有规则文本，忽略");
            return;
        };

        let knowledge_base = self.knowledge_base();

        if let Some(existing) = self.rulesets.get(&ruleset.id)
            && existing.version == ruleset.version
            && !force_update
        {
            debug!(
                engine = %self.label,
                ruleset_id = ruleset.id,
                version = ruleset.version,
                "规则集版本未变化，忽略"
            );
            return;
        }

        info!(
            engine = %self.label,
            ruleset_id = ruleset.id,
            name = %ruleset.name,
            version = ruleset.version,
            "部署规则集"
        );

        self.stop();
        knowledge_base.remove(ruleset.id);
        self.failures.shift_remove(&ruleset.id);
        self.error = None;

        let started = Instant::now();
        let result = self
            .render_rules(&ruleset, rules)
            .and_then(|text| knowledge_base.add(ruleset.id, &text));
        metrics::record_compilation(&self.label, result.is_ok(), started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                if let Some((failed_id, failure)) = self.failures.first() {
                    warn!(
                        engine = %self.label,
                        ruleset_id = ruleset.id,
                        failed_ruleset_id = *failed_id,
                        "其他规则集编译失败，引擎保持错误状态"
                    );
                    let failure = failure.clone();
                    self.set_error(failure);
                    ruleset.status = DeploymentStatus::Ready;
                    self.rulesets.insert(ruleset.id, ruleset);
                } else {
                    ruleset.status = DeploymentStatus::Deployed;
                    self.rulesets.insert(ruleset.id, ruleset);
                    self.promote_ready();
                }
            }
            Err(err) => {
                error!(
                    engine = %self.label,
                    ruleset_id = ruleset.id,
                    name = %ruleset.name,
                    error = %err,
                    "规则集编译失败"
                );
                self.demote_deployed();
                ruleset.status = DeploymentStatus::Failed;
                self.failures.insert(ruleset.id, err.clone());
                self.rulesets.insert(ruleset.id, ruleset);
                self.set_error(err);
            }
        }

        if self.error.is_none() {
            self.start();
        }
    }

    pub(super) fn retract(&mut self, ruleset_id: i64) {
        if !self.rulesets.contains_key(&ruleset_id) {
            debug!(engine = %self.label, ruleset_id, "规则集未部署，忽略撤回");
            return;
        }

        info!(engine = %self.label, ruleset_id, "撤回规则集");
        self.stop();

        if let Some(knowledge_base) = &self.knowledge_base {
            knowledge_base.remove(ruleset_id);
        }
        self.rulesets.shift_remove(&ruleset_id);
        self.failures.shift_remove(&ruleset_id);

        match self.failures.first() {
            Some((_, failure)) => {
                let failure = failure.clone();
                self.set_error(failure);
            }
            None => {
                self.error = None;
                self.promote_ready();
            }
        }

        if self.error.is_none() && !self.rulesets.is_empty() {
            self.start();
        }
    }

    /// 引用模板的规则集先用模板参数渲染规则文本
    fn render_rules(&self, ruleset: &Ruleset, rules: String) -> Result<String> {
        let Some(template_id) = ruleset.template_asset_id.as_deref() else {
            return Ok(rules);
        };

        let source = self.ctx.template_source.as_ref().ok_or_else(|| {
            RuleError::Template(format!(
                "规则集 {} 引用了模板 {}，但没有配置模板来源",
                ruleset.id, template_id
            ))
        })?;
        let template = source
            .find_template(template_id)
            .map_err(|e| RuleError::Template(e.to_string()))?
            .ok_or_else(|| RuleError::Template(format!("模板资产不存在: {}", template_id)))?;

        debug!(engine = %self.label, ruleset_id = ruleset.id, template = %template_id, "渲染规则模板");
        Ok(self.templates.render(&template, &rules)?)
    }

    fn promote_ready(&mut self) {
        for ruleset in self.rulesets.values_mut() {
            if ruleset.status == DeploymentStatus::Ready {
                ruleset.status = DeploymentStatus::Deployed;
            }
        }
    }

    fn demote_deployed(&mut self) {
        for ruleset in self.rulesets.values_mut() {
            if ruleset.status == DeploymentStatus::Deployed {
                ruleset.status = DeploymentStatus::Ready;
            }
        }
    }

    /// 当前可组成会话的规则集，按部署顺序
    pub(super) fn deployed_ids(&self) -> Vec<i64> {
        self.rulesets
            .values()
            .filter(|ruleset| ruleset.status == DeploymentStatus::Deployed)
            .map(|ruleset| ruleset.id)
            .collect()
    }
}
