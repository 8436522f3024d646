//! 引擎启动与停止
//!
//! 启动时创建会话、绑定全局变量、启动触发线程并回放已缓存的属性状态；
//! 停止时按相反顺序拆除，之后引擎可以再次启动。

use super::{EngineInner, FaultSlot};
use crate::error::{Result, RuleError};
use crate::facade::{GLOBAL_ASSETS, GLOBAL_LOG, GLOBAL_USERS, GlobalValue, RulesLog};
use crate::models::Fact;
use crate::runtime::{RuleSession, SessionClock};
use crate::stats::{self, StatsSink};
use parking_lot::{Condvar, Mutex};
use rules_shared::observability::metrics;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

impl EngineInner {
    pub(super) fn start(&mut self) {
        if self.running {
            return;
        }
        if self.error.is_some() {
            debug!(engine = %self.label, "引擎处于错误状态，不启动");
            return;
        }
        if self.rulesets.is_empty() {
            debug!(engine = %self.label, "没有规则集，不启动");
            return;
        }

        info!(engine = %self, "启动规则引擎");
        if let Err(err) = self.try_start() {
            error!(engine = %self.label, error = %err, "规则引擎启动失败");
            self.stop();
            self.set_error(err);
        }
    }

    fn try_start(&mut self) -> Result<()> {
        let deployed = self.deployed_ids();
        let Some(knowledge_base) = self.knowledge_base.clone() else {
            return Err(RuleError::Session("知识库尚未创建".to_string()));
        };
        if deployed.is_empty() {
            return Err(RuleError::Session("没有已部署的规则集".to_string()));
        }

        let clock = if self.ctx.timer.is_pseudo() {
            SessionClock::pseudo(self.ctx.timer.current_time_millis())
        } else {
            SessionClock::realtime()
        };
        let session = knowledge_base.new_session(&deployed, clock)?;

        // 先登记会话，后续任何一步失败时 stop 都能完整拆除
        self.session = Some(session.clone());
        self.running = true;

        self.register_globals(&session)?;
        if let Some(listener) = &self.fire_listener {
            session.set_fire_listener(Some(listener.clone()));
        }
        self.worker = Some(FiringWorker::spawn(
            &self.label,
            &session,
            self.ctx.config.max_fire_restarts,
            self.fault.clone(),
        )?);
        self.replay_facts(&session)?;

        if self.ctx.config.stats_enabled {
            self.stats_timer = Some(StatsTimer::spawn(
                &self.label,
                &session,
                self.ctx.stats_sink.clone(),
                self.ctx.config.stats_initial_delay(),
                self.ctx.config.stats_interval(),
            )?);
        }

        metrics::record_engine_start(&self.label);
        info!(
            engine = %self.label,
            rulesets = deployed.len(),
            facts = self.facts.len(),
            "规则引擎已启动"
        );
        Ok(())
    }

    /// 绑定会话全局变量，规则集没有声明的变量跳过
    fn register_globals(&self, session: &Arc<dyn RuleSession>) -> Result<()> {
        let globals = [
            (GLOBAL_ASSETS, GlobalValue::Assets(self.ctx.facades.assets.clone())),
            (GLOBAL_USERS, GlobalValue::Users(self.ctx.facades.users.clone())),
            (GLOBAL_LOG, GlobalValue::Logger(RulesLog::new(self.label.clone()))),
        ];

        for (name, value) in globals {
            match session.set_global(name, value) {
                Ok(()) => trace!(engine = %self.label, global = name, "全局变量已绑定"),
                Err(RuleError::UnknownGlobal(_)) => {
                    trace!(engine = %self.label, global = name, "规则集未声明全局变量")
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// 把缓存的属性状态插入新会话
    fn replay_facts(&mut self, session: &Arc<dyn RuleSession>) -> Result<()> {
        for tracked in self.facts.values_mut() {
            let handle = session
                .insert(Fact::State(tracked.state.clone()))
                .map_err(|e| RuleError::Session(format!("回放属性状态失败: {}", e)))?;
            tracked.handle = Some(handle);
            self.state_inserts += 1;
        }
        debug!(engine = %self.label, facts = self.facts.len(), "属性状态已回放");
        Ok(())
    }

    pub(super) fn stop(&mut self) {
        if !self.running {
            return;
        }

        info!(engine = %self, "停止规则引擎");
        self.running = false;
        for tracked in self.facts.values_mut() {
            tracked.handle = None;
        }

        if let Some(timer) = self.stats_timer.take() {
            timer.cancel();
        }

        let session = self.session.take();
        if let Some(session) = &session {
            session.halt();
        }
        if let Some(worker) = self.worker.take() {
            worker.join(&self.label);
        }
        if let Some(session) = session {
            session.dispose();
        }

        // 已停止的会话留下的故障不再有意义
        self.fault.lock().take();
        metrics::record_engine_stop(&self.label);
    }
}

// ==================== 触发线程 ====================

/// 在专用线程上运行会话的触发循环
pub(super) struct FiringWorker {
    handle: JoinHandle<()>,
}

impl FiringWorker {
    fn spawn(
        label: &str,
        session: &Arc<dyn RuleSession>,
        max_restarts: Option<u32>,
        fault: FaultSlot,
    ) -> Result<Self> {
        let session = Arc::downgrade(session);
        let scope = label.to_string();
        let handle = thread::Builder::new()
            .name(format!("rules-fire-{}", label))
            .spawn(move || run_firing_loop(&scope, session, max_restarts, fault))
            .map_err(|e| RuleError::Session(format!("无法启动规则触发线程: {}", e)))?;
        Ok(Self { handle })
    }

    fn join(self, label: &str) {
        if self.handle.thread().id() == thread::current().id() {
            warn!(engine = %label, "在触发线程中停止引擎，跳过等待");
            return;
        }
        if self.handle.join().is_err() {
            error!(engine = %label, "规则触发线程异常退出");
        }
    }
}

fn run_firing_loop(
    scope: &str,
    session: Weak<dyn RuleSession>,
    max_restarts: Option<u32>,
    fault: FaultSlot,
) {
    let mut restarts: u32 = 0;
    loop {
        let Some(session) = session.upgrade() else {
            error!(engine = %scope, "规则会话已不存在，触发线程退出");
            return;
        };
        if session.is_halted() {
            return;
        }

        debug!(engine = %scope, restarts, "规则触发循环开始");
        match session.fire_until_halt() {
            Ok(()) => {
                debug!(engine = %scope, "规则触发循环结束");
                return;
            }
            Err(err) => {
                if session.is_halted() {
                    return;
                }
                error!(engine = %scope, error = %err, "规则执行失败，重新进入触发循环");
                metrics::record_fire_fault(scope);
                restarts += 1;

                if let Some(max) = max_restarts
                    && restarts > max
                {
                    error!(engine = %scope, restarts, "触发循环重启次数超过上限");
                    *fault.lock() = Some(err);
                    return;
                }
            }
        }
    }
}

// ==================== 统计定时器 ====================

/// 周期性输出工作内存统计
pub(super) struct StatsTimer {
    cancelled: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl StatsTimer {
    fn spawn(
        label: &str,
        session: &Arc<dyn RuleSession>,
        sink: Arc<dyn StatsSink>,
        initial_delay: Duration,
        interval: Duration,
    ) -> Result<Self> {
        let cancelled = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = cancelled.clone();
        let session = Arc::downgrade(session);
        let scope = label.to_string();

        let handle = thread::Builder::new()
            .name(format!("rules-stats-{}", label))
            .spawn(move || {
                let mut delay = initial_delay;
                loop {
                    if wait_cancelled(&signal, delay) {
                        return;
                    }
                    let Some(session) = session.upgrade() else {
                        return;
                    };
                    if session.is_halted() {
                        return;
                    }
                    sink.report(&scope, &session.stats());
                    stats::dump_facts(&scope, || session.facts());
                    delay = interval;
                }
            })
            .map_err(|e| RuleError::Session(format!("无法启动统计线程: {}", e)))?;

        Ok(Self { cancelled, handle })
    }

    fn cancel(self) {
        {
            let (lock, condvar) = &*self.cancelled;
            *lock.lock() = true;
            condvar.notify_all();
        }
        if self.handle.join().is_err() {
            error!("统计线程异常退出");
        }
    }
}

/// 等待指定时长，期间被取消则返回 true
fn wait_cancelled(signal: &(Mutex<bool>, Condvar), timeout: Duration) -> bool {
    let (lock, condvar) = signal;
    let deadline = Instant::now() + timeout;
    let mut cancelled = lock.lock();
    while !*cancelled {
        if condvar.wait_until(&mut cancelled, deadline).timed_out() {
            break;
        }
    }
    *cancelled
}
