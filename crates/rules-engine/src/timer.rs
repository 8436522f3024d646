//! 宿主计时服务
//!
//! 实时模式读取系统时间；逻辑时钟模式下时间只在显式推进时前进，
//! 引擎启动会话时以当前逻辑时间作为会话时钟的起点。

use crate::error::{Result, RuleError};
use chrono::Utc;
use rules_shared::ClockMode;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TimerService {
    mode: ClockMode,
    pseudo_now: Arc<AtomicI64>,
}

impl TimerService {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            pseudo_now: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        }
    }

    pub fn realtime() -> Self {
        Self::new(ClockMode::Realtime)
    }

    /// 逻辑时钟，从给定毫秒时间开始
    pub fn pseudo(start_millis: i64) -> Self {
        Self {
            mode: ClockMode::Pseudo,
            pseudo_now: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn is_pseudo(&self) -> bool {
        self.mode == ClockMode::Pseudo
    }

    /// 当前毫秒时间
    pub fn current_time_millis(&self) -> i64 {
        match self.mode {
            ClockMode::Realtime => Utc::now().timestamp_millis(),
            ClockMode::Pseudo => self.pseudo_now.load(Ordering::SeqCst),
        }
    }

    /// 推进逻辑时钟，返回推进后的时间
    pub fn advance_time(&self, by: Duration) -> Result<i64> {
        if !self.is_pseudo() {
            return Err(RuleError::InvalidInput(
                "实时模式下不能推进时钟".to_string(),
            ));
        }
        Ok(advance_millis(&self.pseudo_now, by))
    }
}

/// 时长的毫秒数，超出 i64 范围时取 `i64::MAX`
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// 饱和地推进毫秒时间，返回推进后的时间
pub(crate) fn advance_millis(now: &AtomicI64, by: Duration) -> i64 {
    let delta = duration_millis(by);
    let previous = now
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| Some(t.saturating_add(delta)))
        .unwrap_or_else(|t| t);
    previous.saturating_add(delta)
}

impl Default for TimerService {
    fn default() -> Self {
        Self::realtime()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pseudo_timer_advances() {
        let timer = TimerService::pseudo(0);
        assert_eq!(timer.current_time_millis(), 0);
        assert_eq!(timer.advance_time(Duration::from_millis(1500)).unwrap(), 1500);

        // 克隆共享同一时间
        let cloned = timer.clone();
        cloned.advance_time(Duration::from_secs(1)).unwrap();
        assert_eq!(timer.current_time_millis(), 2500);
    }

    #[test]
    fn test_realtime_timer_rejects_advance() {
        let timer = TimerService::realtime();
        assert!(!timer.is_pseudo());
        let err = timer.advance_time(Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert!(timer.current_time_millis() > 0);
    }

    #[test]
    fn test_huge_durations_saturate() {
        assert_eq!(duration_millis(Duration::from_millis(u64::MAX)), i64::MAX);
        assert_eq!(duration_millis(Duration::MAX), i64::MAX);

        let timer = TimerService::pseudo(1_000);
        assert_eq!(timer.advance_time(Duration::MAX).unwrap(), i64::MAX);
        assert_eq!(timer.advance_time(Duration::from_secs(1)).unwrap(), i64::MAX);
        assert_eq!(timer.current_time_millis(), i64::MAX);
    }
}
