//! History: point-in-time reconstruction and tiered summarization.
//!
//! # Invariants
//! - Neither component mutates live values; the only write is pruning of
//!   change detail, and only after a covering summary has been saved.
//! - Reconstruction replays from the newest snapshot at or before the
//!   requested instant, never from the start of history.

pub mod reconstruct;
pub mod schedule;
pub mod summarize;

pub use reconstruct::{HistoricalState, HistoryReconstructor};
pub use schedule::{MAX_TIER_DAYS, RetentionSchedule, ScheduleError, TierPolicy};
pub use summarize::{SummarizationScheduler, create_period_summary};
