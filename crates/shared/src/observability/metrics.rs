//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::config::ObservabilityConfig;
use crate::error::{Result, SharedError};

/// 初始化 Prometheus 指标导出
///
/// 在指定端口启动 `/metrics` HTTP 监听并安装全局 recorder。
pub fn init(config: &ObservabilityConfig, service_name: &str) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| SharedError::Metrics(e.to_string()))?;

    register_common_metrics(service_name);
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// 注册规则引擎指标的描述信息
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("rules_engine_starts_total", "Total number of engine starts");
    metrics::describe_counter!(
        "rules_engine_stops_total",
        "Total number of engine stops"
    );
    metrics::describe_counter!(
        "ruleset_compilations_total",
        "Total number of ruleset compilations"
    );
    metrics::describe_histogram!(
        "ruleset_compilation_duration_seconds",
        "Ruleset compilation duration in seconds"
    );
    metrics::describe_counter!(
        "rules_fire_faults_total",
        "Total number of rule execution faults raised by the firing loop"
    );
    metrics::describe_counter!("rules_fired_total", "Total number of rule activations fired");
    metrics::describe_counter!(
        "asset_events_expired_total",
        "Total number of asset events retracted on expiry"
    );
    metrics::describe_gauge!("rules_facts", "Facts currently held in working memory");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录引擎启动
#[inline]
pub fn record_engine_start(scope: &str) {
    metrics::counter!("rules_engine_starts_total", "scope" => scope.to_string()).increment(1);
}

/// 记录引擎停止
#[inline]
pub fn record_engine_stop(scope: &str) {
    metrics::counter!("rules_engine_stops_total", "scope" => scope.to_string()).increment(1);
}

/// 记录规则集编译
#[inline]
pub fn record_compilation(scope: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "failure" };
    metrics::counter!(
        "ruleset_compilations_total",
        "scope" => scope.to_string(),
        "status" => status
    )
    .increment(1);

    metrics::histogram!(
        "ruleset_compilation_duration_seconds",
        "scope" => scope.to_string()
    )
    .record(duration_secs);
}

/// 记录触发线程捕获的规则执行异常
#[inline]
pub fn record_fire_fault(scope: &str) {
    metrics::counter!("rules_fire_faults_total", "scope" => scope.to_string()).increment(1);
}

/// 记录规则触发
#[inline]
pub fn record_rule_fired(rule: &str) {
    metrics::counter!("rules_fired_total", "rule" => rule.to_string()).increment(1);
}

/// 记录事件过期撤回
#[inline]
pub fn record_event_expired() {
    metrics::counter!("asset_events_expired_total").increment(1);
}

/// 更新工作内存事实数量
#[inline]
pub fn set_fact_gauges(scope: &str, total: usize, states: usize, events: usize, custom: usize) {
    for (kind, value) in [
        ("total", total),
        ("asset_state", states),
        ("asset_event", events),
        ("custom", custom),
    ] {
        metrics::gauge!(
            "rules_facts",
            "scope" => scope.to_string(),
            "kind" => kind
        )
        .set(value as f64);
    }
}
