use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use worldstate_common::{StateCategory, WorldStateChange};

/// Which changes count as significant.
///
/// Significant categories trigger an automatic snapshot of the written
/// region. During summarization a change is kept as a key change if its
/// category is significant or its numeric delta exceeds the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignificancePolicy {
    pub categories: BTreeSet<StateCategory>,
    pub numeric_delta_threshold: f64,
    pub auto_snapshot: bool,
}

impl Default for SignificancePolicy {
    fn default() -> Self {
        Self {
            categories: [
                StateCategory::Political,
                StateCategory::Military,
                StateCategory::Quest,
            ]
            .into_iter()
            .collect(),
            numeric_delta_threshold: 100.0,
            auto_snapshot: true,
        }
    }
}

impl SignificancePolicy {
    pub fn is_significant_category(&self, category: StateCategory) -> bool {
        self.categories.contains(&category)
    }

    /// Whether committing `change` should snapshot its region.
    pub fn should_auto_snapshot(&self, change: &WorldStateChange) -> bool {
        self.auto_snapshot && !change.is_rollback() && self.is_significant_category(change.category)
    }

    /// Whether `change` survives compaction into a summary.
    pub fn is_key_change(&self, change: &WorldStateChange) -> bool {
        if self.is_significant_category(change.category) {
            return true;
        }
        change
            .new_value
            .numeric_delta(&change.old_value)
            .is_some_and(|d| d.abs() > self.numeric_delta_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use worldstate_common::{ChangeId, ChangeType, RegionId, StateValue};

    fn change(category: StateCategory, old: StateValue, new: StateValue) -> WorldStateChange {
        WorldStateChange {
            id: ChangeId::new(),
            seq: 1,
            timestamp: Utc::now(),
            change_type: ChangeType::Updated,
            state_key: "k".into(),
            old_value: old,
            new_value: new,
            region: RegionId::new("r1").unwrap(),
            category,
            entity_id: None,
            reason: None,
        }
    }

    #[test]
    fn default_categories_are_significant() {
        let p = SignificancePolicy::default();
        let c = change(StateCategory::Military, 1.into(), 2.into());
        assert!(p.should_auto_snapshot(&c));
        assert!(p.is_key_change(&c));
        let c = change(StateCategory::Economic, 1.into(), 2.into());
        assert!(!p.should_auto_snapshot(&c));
        assert!(!p.is_key_change(&c));
    }

    #[test]
    fn large_numeric_delta_is_key() {
        let p = SignificancePolicy::default();
        assert!(p.is_key_change(&change(StateCategory::Economic, 0.into(), 101.into())));
        assert!(!p.is_key_change(&change(StateCategory::Economic, 0.into(), 100.into())));
        assert!(p.is_key_change(&change(StateCategory::Economic, 500.into(), 0.5.into())));
        assert!(!p.is_key_change(&change(StateCategory::Economic, "a".into(), 500.into())));
    }

    #[test]
    fn disabled_auto_snapshot() {
        let p = SignificancePolicy {
            auto_snapshot: false,
            ..SignificancePolicy::default()
        };
        assert!(!p.should_auto_snapshot(&change(StateCategory::Quest, 1.into(), 2.into())));
    }
}
