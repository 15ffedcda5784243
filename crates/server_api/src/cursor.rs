//! Sync-mode decision. The forward/backfill choice is a pure predicate over
//! the derived cursor, evaluated before any external call, so it is
//! idempotent, crash-safe, and testable without a network.

use shared::domain::{ChannelCursor, ExternalId, SyncMode};

/// What the puller should do this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPlan {
    /// Pull items strictly newer than `after` (everything, when `None`).
    Forward { after: Option<ExternalId> },
    /// Pull items strictly older than `before` to close the gap below it.
    Backfill { before: ExternalId },
}

impl SyncPlan {
    pub fn mode(&self) -> SyncMode {
        match self {
            SyncPlan::Forward { .. } => SyncMode::Forward,
            SyncPlan::Backfill { .. } => SyncMode::Backfill,
        }
    }
}

/// An empty channel and a contiguous channel both sync forward; backfill is
/// entered exactly when known history has a hole with room below `earliest`.
/// An idle-but-fully-synced channel therefore never flips to backfill.
pub fn decide_plan(cursor: Option<&ChannelCursor>) -> SyncPlan {
    match cursor {
        None => SyncPlan::Forward { after: None },
        Some(cursor) if cursor.has_gap_below() => SyncPlan::Backfill {
            before: cursor.earliest.clone(),
        },
        Some(cursor) => SyncPlan::Forward {
            after: Some(cursor.latest.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(earliest: u64, latest: u64, count: u64) -> ChannelCursor {
        ChannelCursor {
            earliest: ExternalId::from_u64(earliest),
            latest: ExternalId::from_u64(latest),
            count,
        }
    }

    #[test]
    fn empty_store_syncs_forward_from_the_beginning() {
        assert_eq!(decide_plan(None), SyncPlan::Forward { after: None });
    }

    #[test]
    fn contiguous_channel_syncs_forward_past_latest() {
        let plan = decide_plan(Some(&cursor(10, 14, 5)));
        assert_eq!(
            plan,
            SyncPlan::Forward {
                after: Some(ExternalId::from_u64(14))
            }
        );
    }

    #[test]
    fn idle_but_complete_channel_never_backfills() {
        // Contiguity holds, so repeated syncs with zero new messages stay in
        // forward mode instead of spuriously walking into history.
        let plan = decide_plan(Some(&cursor(1, 100, 100)));
        assert_eq!(plan.mode(), SyncMode::Forward);
    }

    #[test]
    fn gap_below_earliest_triggers_backfill() {
        let plan = decide_plan(Some(&cursor(50, 60, 5)));
        assert_eq!(
            plan,
            SyncPlan::Backfill {
                before: ExternalId::from_u64(50)
            }
        );
    }

    #[test]
    fn gap_with_earliest_at_one_has_nothing_below_to_fill() {
        // Holes above id 1 (e.g. provider-deleted messages) are not
        // backfillable; forward mode keeps the cursor moving.
        let plan = decide_plan(Some(&cursor(1, 60, 5)));
        assert_eq!(plan.mode(), SyncMode::Forward);
    }
}
