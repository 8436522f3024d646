//! 工作内存

use crate::models::{Fact, FactHandle, FactStats};
use indexmap::IndexMap;
use serde_json::Value;

/// 按插入顺序保存事实
#[derive(Debug, Default)]
pub struct WorkingMemory {
    facts: IndexMap<FactHandle, Fact>,
}

impl WorkingMemory {
    pub fn insert(&mut self, handle: FactHandle, fact: Fact) {
        self.facts.insert(handle, fact);
    }

    pub fn remove(&mut self, handle: FactHandle) -> Option<Fact> {
        self.facts.shift_remove(&handle)
    }

    pub fn get(&self, handle: FactHandle) -> Option<&Fact> {
        self.facts.get(&handle)
    }

    pub fn contains(&self, handle: FactHandle) -> bool {
        self.facts.contains_key(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FactHandle, &Fact)> {
        self.facts.iter()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn clear(&mut self) {
        self.facts.clear();
    }

    /// 与给定值相等的自定义事实句柄
    pub fn find_custom(&self, value: &Value) -> Vec<FactHandle> {
        self.facts
            .iter()
            .filter(|(_, fact)| matches!(fact, Fact::Custom(v) if v == value))
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn stats(&self) -> FactStats {
        let mut stats = FactStats::default();
        for fact in self.facts.values() {
            stats.record(fact.kind());
        }
        stats
    }

    pub fn snapshot(&self) -> Vec<(FactHandle, Fact)> {
        self.facts.iter().map(|(h, f)| (*h, f.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetState;
    use serde_json::json;

    #[test]
    fn test_insert_remove_and_stats() {
        let mut memory = WorkingMemory::default();
        memory.insert(FactHandle(1), Fact::State(AssetState::new("a1", "t", 1, 0)));
        memory.insert(FactHandle(2), Fact::Custom(json!({"alarm": true})));
        memory.insert(FactHandle(3), Fact::Custom(json!({"alarm": true})));

        assert_eq!(memory.len(), 3);
        assert_eq!(memory.find_custom(&json!({"alarm": true})), vec![FactHandle(2), FactHandle(3)]);
        assert_eq!(memory.stats().custom, 2);

        assert!(memory.remove(FactHandle(2)).is_some());
        assert!(memory.remove(FactHandle(2)).is_none());
        assert_eq!(memory.stats().total, 2);

        // 删除后保持插入顺序
        let handles: Vec<_> = memory.snapshot().into_iter().map(|(h, _)| h).collect();
        assert_eq!(handles, vec![FactHandle(1), FactHandle(3)]);
    }
}
