//! Merge decisions for an incoming live event.
//!
//! Everything here is pure: the actor gathers the pending record, the link and
//! the timer state, and acts on the returned [`MergeDecision`].

use super::types::{Link, MessageRecord, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Attach the incoming platform to the pending record and finalize it as merged.
    Merge,
    /// Open a new record and arm the wait timer for the other platform.
    AwaitCorrelation,
    /// Open a new record and notify for this platform on its own.
    Independent,
}

/// Inputs for [`decide`].
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    /// Record still open for correlation, if any.
    pub pending: Option<&'a MessageRecord>,
    pub incoming: Platform,
    pub link: Option<&'a Link>,
    /// True while the wait timer for `pending` is armed.
    pub window_open: bool,
    /// True when the other platform is already live on some record for this key.
    pub other_live: bool,
}

pub fn decide(ctx: MergeContext<'_>) -> MergeDecision {
    let Some(link) = ctx.link else {
        return MergeDecision::Independent;
    };

    if let Some(pending) = ctx.pending {
        if can_join(pending, ctx.incoming, link) {
            if ctx.window_open || link.late_merge {
                return MergeDecision::Merge;
            }
            return MergeDecision::Independent;
        }
    }

    if ctx.other_live {
        // The other side already finalized on its own record; nothing left to wait for.
        MergeDecision::Independent
    } else {
        MergeDecision::AwaitCorrelation
    }
}

/// A pending record accepts the incoming platform only if it belongs to the
/// same link, is still open, still has its first side live, and has not seen
/// the incoming platform yet.
fn can_join(pending: &MessageRecord, incoming: Platform, link: &Link) -> bool {
    !pending.closed
        && pending.link_id.as_deref() == Some(link.id.as_str())
        && pending.any_live()
        && !pending.side(incoming).participated()
}

/// Platform whose metadata is authoritative for `record`'s rendered text.
///
/// With both sides live the record's priority wins; otherwise the single
/// live side is used. A record with nothing live falls back to its priority.
pub fn authoritative_platform(record: &MessageRecord) -> Platform {
    let priority = record.priority;
    if record.side(priority).live || !record.side(priority.other()).live {
        priority
    } else {
        priority.other()
    }
}

/// Priority stored on a new record: the link's priority, or the only platform
/// involved when unlinked.
pub fn record_priority(link: Option<&Link>, incoming: Platform) -> Platform {
    link.map_or(incoming, |l| l.priority)
}
