use std::collections::HashMap;
use std::sync::Mutex;

use crate::broker::OffsetMark;

/// Shared table of per-partition marked offsets.
///
/// Partition processors publish marks as they close batches; the container
/// reads the table on each auto-mark tick and commits only the marks that
/// changed since the last successful broker commit.
#[derive(Debug, Default)]
pub(crate) struct OffsetRegistry {
    inner: Mutex<OffsetState>,
}

#[derive(Debug, Default)]
struct OffsetState {
    marked: HashMap<(String, i32), i64>,
    committed: HashMap<(String, i32), i64>,
}

impl OffsetRegistry {
    pub(crate) fn mark(&self, mark: OffsetMark) {
        let mut state = self.inner.lock().expect("offset registry mutex poisoned");
        state
            .marked
            .insert((mark.topic, mark.partition), mark.offset);
    }

    /// Marks that have not yet been committed, in a stable order.
    pub(crate) fn changed(&self) -> Vec<OffsetMark> {
        let state = self.inner.lock().expect("offset registry mutex poisoned");
        let mut marks: Vec<OffsetMark> = state
            .marked
            .iter()
            .filter(|entry| {
                let (key, offset) = *entry;
                state.committed.get(key) != Some(offset)
            })
            .map(|((topic, partition), offset)| OffsetMark {
                topic: topic.clone(),
                partition: *partition,
                offset: *offset,
            })
            .collect();
        marks.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        marks
    }

    pub(crate) fn record_committed(&self, marks: &[OffsetMark]) {
        let mut state = self.inner.lock().expect("offset registry mutex poisoned");
        for mark in marks {
            state
                .committed
                .insert((mark.topic.clone(), mark.partition), mark.offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(topic: &str, partition: i32, offset: i64) -> OffsetMark {
        OffsetMark {
            topic: topic.to_string(),
            partition,
            offset,
        }
    }

    #[test]
    fn fresh_marks_are_reported_as_changed() {
        let registry = OffsetRegistry::default();
        registry.mark(mark("words", 0, 4));
        registry.mark(mark("words", 1, 9));

        let changed = registry.changed();
        assert_eq!(changed, vec![mark("words", 0, 4), mark("words", 1, 9)]);
    }

    #[test]
    fn committed_marks_are_not_reported_again() {
        let registry = OffsetRegistry::default();
        registry.mark(mark("words", 0, 4));

        let changed = registry.changed();
        registry.record_committed(&changed);
        assert!(registry.changed().is_empty());

        // A newer mark for the same partition shows up again.
        registry.mark(mark("words", 0, 7));
        assert_eq!(registry.changed(), vec![mark("words", 0, 7)]);
    }

    #[test]
    fn remarking_the_same_offset_keeps_a_single_entry() {
        let registry = OffsetRegistry::default();
        registry.mark(mark("words", 0, 4));
        registry.mark(mark("words", 0, 4));
        assert_eq!(registry.changed().len(), 1);
    }
}
