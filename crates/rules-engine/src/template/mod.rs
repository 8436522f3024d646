//! 规则模板模块
//!
//! 规则集可以引用一个模板资产，部署时用模板资产的参数值替换规则文本中的
//! `${param}` 占位符后再编译。

pub mod compiler;

pub use compiler::{TemplateCompiler, TemplateError};

use crate::error::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// 模板资产：提供占位符参数值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateAsset {
    pub asset_id: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

impl TemplateAsset {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// 模板资产来源
#[cfg_attr(test, mockall::automock)]
pub trait TemplateSource: Send + Sync {
    /// 按资产 ID 查找模板，不存在时返回 None
    fn find_template(&self, asset_id: &str) -> Result<Option<TemplateAsset>>;
}

/// 内存模板来源
#[derive(Default)]
pub struct InMemoryTemplateSource {
    templates: DashMap<String, TemplateAsset>,
}

impl InMemoryTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, template: TemplateAsset) {
        self.templates.insert(template.asset_id.clone(), template);
    }

    pub fn remove(&self, asset_id: &str) -> Option<TemplateAsset> {
        self.templates.remove(asset_id).map(|(_, t)| t)
    }
}

impl TemplateSource for InMemoryTemplateSource {
    fn find_template(&self, asset_id: &str) -> Result<Option<TemplateAsset>> {
        Ok(self.templates.get(asset_id).map(|t| t.value().clone()))
    }
}
