//! 资产事件过期

use crate::models::FactHandle;
use crate::runtime::RuleSession;
use rules_shared::observability::metrics;
use std::sync::Arc;
use tracing::{trace, warn};

/// 在会话时钟上安排事件过期，到期时从工作内存中删除
///
/// 作业只持有会话的弱引用；会话已停止时什么也不做。
pub(super) fn schedule_expiration(
    session: &Arc<dyn RuleSession>,
    handle: FactHandle,
    expires_at: i64,
    label: &str,
) {
    let weak = Arc::downgrade(session);
    let scope = label.to_string();

    session.schedule(
        expires_at,
        Box::new(move || {
            let Some(session) = weak.upgrade() else {
                return;
            };
            if session.is_halted() {
                return;
            }
            match session.delete(handle) {
                Ok(()) => {
                    trace!(engine = %scope, %handle, expires_at, "资产事件已过期");
                    metrics::record_event_expired();
                }
                Err(err) => warn!(engine = %scope, %handle, error = %err, "删除过期资产事件失败"),
            }
        }),
    );
}
