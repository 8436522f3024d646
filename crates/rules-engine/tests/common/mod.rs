//! 集成测试共用的引擎构造和等待工具

#![allow(dead_code)]

use parking_lot::Mutex;
use rules_engine::{
    AssetsFacade, AttributeWriteRequest, EngineContext, Facades, Result, RuleError, TimerService,
    UsersFacade,
};
use rules_shared::EngineConfig;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 记录所有写请求的资产门面，写入 `fail_asset` 时返回错误
#[derive(Default)]
pub struct RecordingAssets {
    pub writes: Mutex<Vec<AttributeWriteRequest>>,
    pub fail_asset: Option<String>,
}

impl RecordingAssets {
    pub fn failing_on(asset_id: &str) -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            fail_asset: Some(asset_id.to_string()),
        }
    }

    pub fn written_values(&self, attribute: &str) -> Vec<serde_json::Value> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.attribute_name == attribute)
            .map(|w| w.value.clone())
            .collect()
    }
}

impl AssetsFacade for RecordingAssets {
    fn dispatch(&self, request: AttributeWriteRequest) -> Result<()> {
        if self.fail_asset.as_deref() == Some(request.asset_id.as_str()) {
            return Err(RuleError::InvalidInput(format!(
                "资产 {} 拒绝写入",
                request.asset_id
            )));
        }
        self.writes.lock().push(request);
        Ok(())
    }
}

/// 每个租户固定返回两个用户
pub struct StaticUsers;

impl UsersFacade for StaticUsers {
    fn user_ids(&self, realm: &str) -> Vec<String> {
        vec![format!("{}-admin", realm), format!("{}-operator", realm)]
    }
}

/// 逻辑时钟从 0 开始的测试上下文
pub fn pseudo_context() -> EngineContext {
    EngineContext::new(EngineConfig::pseudo()).with_timer(TimerService::pseudo(0))
}

pub fn context_with_assets(assets: Arc<RecordingAssets>) -> EngineContext {
    pseudo_context().with_facades(Facades::new(assets, Arc::new(StaticUsers)))
}

/// 轮询直到条件成立或超时
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

pub const NOOP_RULES: &str = r#"{"rules": [{"name": "noop"}]}"#;

pub const BROKEN_RULES: &str = r#"{"rules": [{"name": "broken", "then": ["#;

/// 温度超过阈值时把风扇打开
pub const FAN_RULES: &str = r#"{
    "globals": ["assets"],
    "rules": [{
        "name": "fan-on",
        "fact": "state",
        "when": {
            "type": "group",
            "operator": "AND",
            "children": [
                {"type": "condition", "field": "attributeName", "operator": "eq", "value": "temperature"},
                {"type": "condition", "field": "value", "operator": "gt", "value": 30}
            ]
        },
        "then": [{"action": "write_attribute", "attributeName": "fan", "valueFrom": "value"}]
    }]
}"#;
