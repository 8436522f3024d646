//! 共享错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    #[error("日志初始化失败: {0}")]
    Tracing(String),

    #[error("指标导出器初始化失败: {0}")]
    Metrics(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl SharedError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Tracing(_) => "TRACING_ERROR",
            Self::Metrics(_) => "METRICS_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, SharedError>;
