//! 共享库
//!
//! 包含规则引擎服务共用的配置加载、错误类型和可观测性初始化代码。

pub mod config;
pub mod error;
pub mod observability;

pub use config::{AppConfig, ClockMode, EngineConfig, ObservabilityConfig};
pub use error::{Result, SharedError};
