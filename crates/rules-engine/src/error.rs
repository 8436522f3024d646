//! 规则引擎错误类型

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("规则集 {ruleset_id} 编译失败: {reason}")]
    Compile { ruleset_id: i64, reason: String },

    #[error("规则解析失败: {0}")]
    Parse(String),

    #[error("模板渲染失败: {0}")]
    Template(String),

    #[error("会话错误: {0}")]
    Session(String),

    #[error("规则 '{rule}' 执行失败: {reason}")]
    Execution { rule: String, reason: String },

    #[error("事实操作失败: {0}")]
    FactOperation(String),

    #[error("未知的全局变量: {0}")]
    UnknownGlobal(String),

    #[error("无效的输入: {0}")]
    InvalidInput(String),

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },
}

impl RuleError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "COMPILE_ERROR",
            Self::Parse(_) => "PARSE_ERROR",
            Self::Template(_) => "TEMPLATE_ERROR",
            Self::Session(_) => "SESSION_ERROR",
            Self::Execution { .. } => "EXECUTION_ERROR",
            Self::FactOperation(_) => "FACT_OPERATION_ERROR",
            Self::UnknownGlobal(_) => "UNKNOWN_GLOBAL",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
        }
    }

    /// 是否为规则集编译类错误（编译失败或模板渲染失败）
    pub fn is_compile_failure(&self) -> bool {
        matches!(self, Self::Compile { .. } | Self::Template(_))
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;
