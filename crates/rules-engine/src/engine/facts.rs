//! 属性状态同步与资产事件插入

use super::expiration::schedule_expiration;
use super::{EngineInner, EventObserver, TrackedFact};
use crate::models::{AssetEvent, AssetState, AttributeRef, Fact};
use crate::runtime::WorkUnit;
use crate::timer::duration_millis;
use std::time::Duration;
use tracing::{debug, trace, warn};

impl EngineInner {
    /// 记录属性状态，引擎运行时原子替换会话中的旧事实
    ///
    /// 与已记录状态完全相同的更新被忽略。会话操作失败只影响会话，
    /// 状态仍然被记录，下次启动时回放。
    pub(super) fn upsert_state(&mut self, state: AssetState) {
        let attribute = state.attribute_ref();

        if let Some(tracked) = self.facts.get(&attribute)
            && tracked.state == state
        {
            trace!(engine = %self.label, %attribute, "属性状态未变化，忽略");
            return;
        }

        // 先移除再插入，使更新后的状态排在插入顺序末尾
        let old = self
            .facts
            .shift_remove(&attribute)
            .and_then(|tracked| tracked.handle);

        let handle = match (&self.session, self.running) {
            (Some(session), true) => {
                let handle = session.next_handle();
                let unit = WorkUnit::Replace {
                    old,
                    handle,
                    fact: Fact::State(state.clone()),
                };
                match session.submit(unit) {
                    Ok(()) => {
                        self.state_inserts += 1;
                        Some(handle)
                    }
                    Err(err) => {
                        warn!(engine = %self.label, %attribute, error = %err, "提交属性状态失败");
                        if let Some(old) = old
                            && let Err(err) = session.delete(old)
                        {
                            warn!(engine = %self.label, %attribute, error = %err, "移除旧属性状态失败");
                        }
                        None
                    }
                }
            }
            _ => None,
        };

        trace!(engine = %self.label, %attribute, synchronized = handle.is_some(), "属性状态已记录");
        self.facts.insert(attribute, TrackedFact { state, handle });
    }

    pub(super) fn retract_state(&mut self, attribute: &AttributeRef) {
        let Some(tracked) = self.facts.shift_remove(attribute) else {
            trace!(engine = %self.label, %attribute, "属性状态未记录，忽略移除");
            return;
        };

        if let (Some(session), Some(handle)) = (&self.session, tracked.handle)
            && self.running
            && let Err(err) = session.delete(handle)
        {
            warn!(engine = %self.label, %attribute, error = %err, "从会话中移除属性状态失败");
        }
    }

    /// 插入资产事件并在会话时钟上安排过期，返回需要通知的观察者
    pub(super) fn insert_event(
        &mut self,
        expires_in: Duration,
        state: AssetState,
    ) -> Option<(EventObserver, AssetEvent)> {
        let session = match (&self.session, self.running) {
            (Some(session), true) => session.clone(),
            _ => {
                debug!(engine = %self.label, attribute = %state.attribute_ref(), "引擎未运行，丢弃资产事件");
                return None;
            }
        };

        let clock = session.clock();
        let now = clock.current_time();
        let event = AssetEvent::new(state, now);

        let handle = match session.insert(Fact::Event(event.clone())) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(engine = %self.label, event_id = %event.id, error = %err, "插入资产事件失败");
                return None;
            }
        };

        let expires_at = now.saturating_add(duration_millis(expires_in));
        schedule_expiration(&session, handle, expires_at, &self.label);
        debug!(
            engine = %self.label,
            event_id = %event.id,
            %handle,
            expires_at,
            "资产事件已插入"
        );

        self.event_observer
            .clone()
            .map(|observer| (observer, event))
    }
}
