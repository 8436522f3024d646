//! 规则引擎端到端测试
//!
//! 通过 `RulesService` 覆盖完整的业务流程，包括：
//! - 多作用域规则集部署与故障隔离
//! - 资产层级的状态路由
//! - 逻辑时钟下的事件过期
//! - 规则对资产属性的写回

pub mod helpers;
pub mod suites;
