//! 工作内存统计输出

use crate::models::{Fact, FactHandle, FactStats};
use rules_shared::observability::metrics;
use tracing::{Level, info, trace};

/// 周期性统计的接收方，只在引擎运行且启用统计时被调用
#[cfg_attr(test, mockall::automock)]
pub trait StatsSink: Send + Sync {
    fn report(&self, scope: &str, stats: &FactStats);
}

/// 输出日志并更新指标的默认统计接收方
#[derive(Debug, Default)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn report(&self, scope: &str, stats: &FactStats) {
        info!(
            target: "rules_engine::stats",
            scope,
            total = stats.total,
            asset_states = stats.states,
            asset_events = stats.events,
            custom = stats.custom,
            "工作内存统计"
        );
        metrics::set_fact_gauges(scope, stats.total, stats.states, stats.events, stats.custom);
    }
}

/// TRACE 级别下逐条输出工作内存中的事实
pub(crate) fn dump_facts(scope: &str, facts: impl FnOnce() -> Vec<(FactHandle, Fact)>) {
    if !tracing::enabled!(target: "rules_engine::stats", Level::TRACE) {
        return;
    }

    for (handle, fact) in facts() {
        trace!(
            target: "rules_engine::stats",
            scope,
            %handle,
            kind = fact.kind().as_str(),
            fact = %fact.to_json(),
            "工作内存事实"
        );
    }
}
