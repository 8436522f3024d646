//! 测试套件模块
//!
//! 按业务功能组织的测试用例集合。

pub mod event_expiry;
pub mod ruleset_lifecycle;
pub mod scope_routing;
