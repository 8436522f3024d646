//! 模板编译器
//!
//! 替换规则文本中的 `${param}` 占位符，同时保留参数的原始类型。

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use super::TemplateAsset;
use crate::error::RuleError;

/// 模板渲染错误
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("模板 {template} 缺少参数: {name}")]
    MissingParameter { template: String, name: String },

    #[error("无效的模板规则文本: {0}")]
    InvalidTemplate(String),
}

impl From<TemplateError> for RuleError {
    fn from(err: TemplateError) -> Self {
        RuleError::Template(err.to_string())
    }
}

/// 模板编译器
pub struct TemplateCompiler {
    /// 匹配 ${paramName} 格式的占位符
    placeholder_regex: Regex,
}

impl TemplateCompiler {
    pub fn new() -> Self {
        Self {
            placeholder_regex: Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)\}").unwrap(),
        }
    }

    /// 用模板参数渲染规则文本
    pub fn render(&self, template: &TemplateAsset, rules: &str) -> Result<String, TemplateError> {
        let document: Value = serde_json::from_str(rules)
            .map_err(|e| TemplateError::InvalidTemplate(e.to_string()))?;

        let rendered = self.replace_placeholders(&document, template)?;
        Ok(rendered.to_string())
    }

    /// 递归替换占位符
    ///
    /// 纯占位符字符串（如 "${threshold}"）直接替换为参数值以保留原始类型，
    /// 混合字符串中的占位符按字符串替换，未提供的参数保持原样
    fn replace_placeholders(
        &self,
        node: &Value,
        template: &TemplateAsset,
    ) -> Result<Value, TemplateError> {
        let params: &HashMap<String, Value> = &template.parameters;

        match node {
            Value::String(s) => {
                if let Some(caps) = self.placeholder_regex.captures(s)
                    && caps.get(0).map(|m| m.as_str()) == Some(s.as_str())
                {
                    let name = &caps[1];
                    return params.get(name).cloned().ok_or_else(|| {
                        TemplateError::MissingParameter {
                            template: template.asset_id.clone(),
                            name: name.to_string(),
                        }
                    });
                }

                let replaced = self
                    .placeholder_regex
                    .replace_all(s, |caps: &regex::Captures| match params.get(&caps[1]) {
                        Some(Value::String(v)) => v.clone(),
                        Some(v) => v.to_string(),
                        None => caps[0].to_string(),
                    });
                Ok(Value::String(replaced.into_owned()))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.replace_placeholders(v, template))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut rendered = serde_json::Map::with_capacity(obj.len());
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.replace_placeholders(v, template)?);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(node.clone()),
        }
    }
}

impl Default for TemplateCompiler {
    fn default() -> Self {
        Self::new()
    }
}
