//! 端到端测试辅助工具

pub mod fixtures;

use parking_lot::Mutex;
use rules_engine::{
    AssetsFacade, AttributeWriteRequest, EngineContext, Facades, RulesService, TimerService,
};
use rules_shared::EngineConfig;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 记录规则写回的资产门面
#[derive(Default)]
pub struct AssetWrites {
    writes: Mutex<Vec<AttributeWriteRequest>>,
}

impl AssetWrites {
    pub fn all(&self) -> Vec<AttributeWriteRequest> {
        self.writes.lock().clone()
    }

    pub fn for_asset(&self, asset_id: &str) -> Vec<AttributeWriteRequest> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.asset_id == asset_id)
            .cloned()
            .collect()
    }
}

impl AssetsFacade for AssetWrites {
    fn dispatch(&self, request: AttributeWriteRequest) -> rules_engine::Result<()> {
        self.writes.lock().push(request);
        Ok(())
    }
}

/// 使用逻辑时钟的测试环境
pub struct TestEnvironment {
    pub service: RulesService,
    pub writes: Arc<AssetWrites>,
}

impl TestEnvironment {
    pub fn setup() -> Self {
        let writes = Arc::new(AssetWrites::default());
        let facades = Facades::new(writes.clone(), Arc::new(rules_engine::facade::EmptyUsersFacade));
        let context = EngineContext::new(EngineConfig::pseudo())
            .with_timer(TimerService::pseudo(0))
            .with_facades(facades);

        Self {
            service: RulesService::new(context),
            writes,
        }
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        self.service.shutdown();
    }
}

/// 轮询直到条件成立或超时
pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
