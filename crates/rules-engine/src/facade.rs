//! 规则全局变量与外部门面
//!
//! 规则通过会话全局变量访问外部系统：`assets` 写资产属性，`users` 查询租户用户，
//! `LOG` 输出规则日志。

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub const GLOBAL_ASSETS: &str = "assets";
pub const GLOBAL_USERS: &str = "users";
pub const GLOBAL_LOG: &str = "LOG";

/// 引擎启动时尝试注册的全局变量
pub const KNOWN_GLOBALS: [&str; 3] = [GLOBAL_ASSETS, GLOBAL_USERS, GLOBAL_LOG];

/// 规则发出的属性写请求
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeWriteRequest {
    pub asset_id: String,
    pub attribute_name: String,
    pub value: Value,
    /// 发出请求的规则名
    pub source_rule: String,
}

/// 资产门面
#[cfg_attr(test, mockall::automock)]
pub trait AssetsFacade: Send + Sync {
    fn dispatch(&self, request: AttributeWriteRequest) -> Result<()>;
}

/// 用户门面
#[cfg_attr(test, mockall::automock)]
pub trait UsersFacade: Send + Sync {
    fn user_ids(&self, realm: &str) -> Vec<String>;
}

/// 只记录日志的资产门面
#[derive(Debug, Default)]
pub struct LoggingAssetsFacade;

impl AssetsFacade for LoggingAssetsFacade {
    fn dispatch(&self, request: AttributeWriteRequest) -> Result<()> {
        info!(
            asset_id = %request.asset_id,
            attribute = %request.attribute_name,
            value = %request.value,
            rule = %request.source_rule,
            "规则写属性"
        );
        Ok(())
    }
}

/// 没有任何用户的用户门面
#[derive(Debug, Default)]
pub struct EmptyUsersFacade;

impl UsersFacade for EmptyUsersFacade {
    fn user_ids(&self, _realm: &str) -> Vec<String> {
        Vec::new()
    }
}

/// 引擎注入会话的门面集合
#[derive(Clone)]
pub struct Facades {
    pub assets: Arc<dyn AssetsFacade>,
    pub users: Arc<dyn UsersFacade>,
}

impl Facades {
    pub fn new(assets: Arc<dyn AssetsFacade>, users: Arc<dyn UsersFacade>) -> Self {
        Self { assets, users }
    }
}

impl Default for Facades {
    fn default() -> Self {
        Self {
            assets: Arc::new(LoggingAssetsFacade),
            users: Arc::new(EmptyUsersFacade),
        }
    }
}

/// 规则日志，输出到 `rules` target
#[derive(Debug, Clone)]
pub struct RulesLog {
    scope: String,
}

impl RulesLog {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    pub fn info(&self, rule: &str, message: &str) {
        info!(target: "rules", scope = %self.scope, rule = %rule, "{}", message);
    }
}

/// 会话全局变量值
#[derive(Clone)]
pub enum GlobalValue {
    Assets(Arc<dyn AssetsFacade>),
    Users(Arc<dyn UsersFacade>),
    Logger(RulesLog),
}

impl GlobalValue {
    /// 该值可以绑定的全局变量名
    pub fn binding_name(&self) -> &'static str {
        match self {
            Self::Assets(_) => GLOBAL_ASSETS,
            Self::Users(_) => GLOBAL_USERS,
            Self::Logger(_) => GLOBAL_LOG,
        }
    }
}

impl fmt::Debug for GlobalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalValue({})", self.binding_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binding_names() {
        let facades = Facades::default();
        assert_eq!(GlobalValue::Assets(facades.assets).binding_name(), "assets");
        assert_eq!(GlobalValue::Users(facades.users).binding_name(), "users");
        assert_eq!(GlobalValue::Logger(RulesLog::new("global")).binding_name(), "LOG");
    }

    #[test]
    fn test_default_facades() {
        let facades = Facades::default();
        let request = AttributeWriteRequest {
            asset_id: "a1".to_string(),
            attribute_name: "fan".to_string(),
            value: json!(true),
            source_rule: "r".to_string(),
        };
        assert!(facades.assets.dispatch(request).is_ok());
        assert!(facades.users.user_ids("master").is_empty());
    }

    #[test]
    fn test_mock_assets_facade() {
        let mut mock = MockAssetsFacade::new();
        mock.expect_dispatch()
            .withf(|r| r.asset_id == "a1" && r.value == json!(1))
            .times(1)
            .returning(|_| Ok(()));

        let request = AttributeWriteRequest {
            asset_id: "a1".to_string(),
            attribute_name: "level".to_string(),
            value: json!(1),
            source_rule: "r".to_string(),
        };
        assert!(mock.dispatch(request).is_ok());
    }
}
