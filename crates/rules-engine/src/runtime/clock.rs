//! 会话时钟与作业调度
//!
//! 每个会话拥有一个时钟：实时时钟读取系统时间，逻辑时钟只在 `advance_time`
//! 时前进。到期作业按 (到期时间, 序号) 排序，执行时不持有任何锁。

use crate::error::{Result, RuleError};
use crate::timer::advance_millis;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::trace;

/// 调度作业
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockKind {
    Realtime,
    Pseudo,
}

#[derive(Default)]
struct JobQueue {
    jobs: BTreeMap<(i64, u64), Job>,
    next_seq: u64,
}

struct ClockInner {
    kind: ClockKind,
    pseudo_now: AtomicI64,
    queue: Mutex<JobQueue>,
}

/// 会话时钟，克隆共享同一时钟
#[derive(Clone)]
pub struct SessionClock {
    inner: Arc<ClockInner>,
}

impl SessionClock {
    pub fn realtime() -> Self {
        Self::with_kind(ClockKind::Realtime, 0)
    }

    /// 逻辑时钟，起点为给定毫秒时间
    pub fn pseudo(start_millis: i64) -> Self {
        Self::with_kind(ClockKind::Pseudo, start_millis)
    }

    fn with_kind(kind: ClockKind, start: i64) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                kind,
                pseudo_now: AtomicI64::new(start),
                queue: Mutex::new(JobQueue::default()),
            }),
        }
    }

    pub fn is_pseudo(&self) -> bool {
        self.inner.kind == ClockKind::Pseudo
    }

    /// 当前毫秒时间
    pub fn current_time(&self) -> i64 {
        match self.inner.kind {
            ClockKind::Realtime => Utc::now().timestamp_millis(),
            ClockKind::Pseudo => self.inner.pseudo_now.load(Ordering::SeqCst),
        }
    }

    /// 推进逻辑时钟并在调用线程中执行所有到期作业
    pub fn advance_time(&self, by: Duration) -> Result<i64> {
        if !self.is_pseudo() {
            return Err(RuleError::Session("实时时钟不支持手动推进".to_string()));
        }

        let now = advance_millis(&self.inner.pseudo_now, by);
        let fired = self.run_due_jobs();
        trace!(now, fired, "逻辑时钟已推进");
        Ok(now)
    }

    /// 在指定毫秒时间调度作业
    pub fn schedule(&self, at: i64, job: Job) {
        let mut queue = self.inner.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.jobs.insert((at, seq), job);
    }

    /// 最早到期作业的时间
    pub fn next_due(&self) -> Option<i64> {
        self.inner.queue.lock().jobs.keys().next().map(|(at, _)| *at)
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.queue.lock().jobs.len()
    }

    /// 执行所有到期作业，返回执行数量
    pub fn run_due_jobs(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.current_time();
            let job = {
                let mut queue = self.inner.queue.lock();
                let due = matches!(queue.jobs.first_key_value(), Some((&(at, _), _)) if at <= now);
                if due {
                    queue.jobs.pop_first().map(|(_, job)| job)
                } else {
                    None
                }
            };

            match job {
                Some(job) => {
                    job();
                    fired += 1;
                }
                None => return fired,
            }
        }
    }

    /// 空闲等待时长：实时时钟等到下一个作业到期，最长不超过 `max`
    pub fn idle_wait(&self, max: Duration) -> Duration {
        if self.is_pseudo() {
            return max;
        }
        match self.next_due() {
            Some(at) => {
                let until = (at - self.current_time()).max(1) as u64;
                Duration::from_millis(until).min(max)
            }
            None => max,
        }
    }

    /// 丢弃所有未执行的作业
    pub fn clear_jobs(&self) {
        let jobs = std::mem::take(&mut self.inner.queue.lock().jobs);
        drop(jobs);
    }
}

impl fmt::Debug for SessionClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClock")
            .field("kind", &self.inner.kind)
            .field("now", &self.current_time())
            .finish()
    }
}
