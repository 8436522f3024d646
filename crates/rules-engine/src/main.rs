//! 规则引擎服务
//!
//! 加载配置和规则集目录中的规则集，然后运行到收到关闭信号。

use anyhow::Result;
use rules_engine::{EngineContext, Ruleset, RulesService};
use rules_shared::AppConfig;
use rules_shared::observability;
use std::path::Path;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("rules-engine").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    let _guard = observability::init(&config.observability, &config.service_name)?;

    info!(
        service = %config.service_name,
        environment = %config.environment,
        clock = ?config.engine.clock,
        "Starting rules engine service..."
    );

    let service = RulesService::new(EngineContext::new(config.engine.clone()));

    if let Some(dir) = &config.engine.rulesets_dir {
        match load_rulesets(Path::new(dir), &service) {
            Ok(count) => info!(dir = %dir, count, "规则集已加载"),
            Err(e) => warn!(dir = %dir, error = %e, "加载规则集目录失败"),
        }
    }

    for status in service.statuses() {
        info!(
            engine = %status.scope,
            running = status.running,
            error = ?status.error.as_ref().map(|e| e.to_string()),
            rulesets = status.rulesets.len(),
            "引擎状态"
        );
    }

    shutdown_signal().await;
    service.shutdown();

    info!("Service shutdown complete");
    Ok(())
}

/// 按文件名顺序部署目录中的 `*.json` 规则集
fn load_rulesets(dir: &Path, service: &RulesService) -> Result<usize> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut deployed = 0;
    for path in paths {
        let ruleset = match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| Ruleset::from_json(&text).map_err(anyhow::Error::from))
        {
            Ok(ruleset) => ruleset,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "无法读取规则集文件");
                continue;
            }
        };

        match service.deploy(ruleset, false) {
            Ok(status) if status.error.is_none() => deployed += 1,
            Ok(status) => warn!(
                path = %path.display(),
                engine = %status.scope,
                error = ?status.error.map(|e| e.to_string()),
                "规则集部署后引擎处于错误状态"
            ),
            Err(e) => warn!(path = %path.display(), error = %e, "规则集部署失败"),
        }
    }
    Ok(deployed)
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
