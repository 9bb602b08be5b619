use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use worldstate_common::{RegionId, WorldStateChange};

/// Append-only change history.
///
/// Records are appended in commit order and never modified. Each one gets a
/// strictly increasing `seq`; timestamps are non-decreasing because the store
/// stamps writes monotonically. Pruning only ever removes a prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeLog {
    changes: Vec<WorldStateChange>,
    last_seq: u64,
    /// Set once a prefix has been pruned; replays that need anything older
    /// than this cannot be answered from the log.
    pruned_before: Option<DateTime<Utc>>,
}

impl ChangeLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence number and append. Returns the stored record.
    pub(crate) fn append(&mut self, mut change: WorldStateChange) -> WorldStateChange {
        self.last_seq += 1;
        change.seq = self.last_seq;
        debug_assert!(
            self.changes
                .last()
                .is_none_or(|prev| prev.timestamp <= change.timestamp),
            "change timestamps must be non-decreasing"
        );
        self.changes.push(change.clone());
        change
    }

    /// Make sure future records sort after `seq`.
    pub(crate) fn reserve_through(&mut self, seq: u64) {
        self.last_seq = self.last_seq.max(seq);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Read-only access to all retained records.
    pub fn changes(&self) -> &[WorldStateChange] {
        &self.changes
    }

    /// Sequence number of the newest record ever appended.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.changes.first().map(|c| c.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.changes.last().map(|c| c.timestamp)
    }

    pub fn pruned_before(&self) -> Option<DateTime<Utc>> {
        self.pruned_before
    }

    /// History of one key in one scope, oldest first.
    pub fn for_key<'a>(
        &'a self,
        key: &'a str,
        region: &'a RegionId,
    ) -> impl Iterator<Item = &'a WorldStateChange> {
        self.changes
            .iter()
            .filter(move |c| c.state_key == key && &c.region == region)
    }

    /// Records with `start <= timestamp <= end`.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[WorldStateChange] {
        if start > end {
            return &[];
        }
        let lo = self.changes.partition_point(|c| c.timestamp < start);
        let hi = self.changes.partition_point(|c| c.timestamp <= end);
        &self.changes[lo..hi]
    }

    /// Records for `region` committed after `after_seq` and no later than
    /// `until`, in commit order.
    pub fn replay_after<'a>(
        &'a self,
        region: &'a RegionId,
        after_seq: u64,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a WorldStateChange> {
        let start = self.changes.partition_point(|c| c.seq <= after_seq);
        self.changes[start..]
            .iter()
            .take_while(move |c| c.timestamp <= until)
            .filter(move |c| &c.region == region)
    }

    /// Drop every record strictly older than `cutoff`. Returns how many went.
    pub(crate) fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let n = self.changes.partition_point(|c| c.timestamp < cutoff);
        if n > 0 {
            self.changes.drain(..n);
        }
        self.pruned_before = Some(self.pruned_before.map_or(cutoff, |p| p.max(cutoff)));
        n
    }
}
