//! Per-correlation-key notification coordinator.
//!
//! Each [`CorrelationKey`] is served by one logical actor. The [`Coordinator`]
//! routes events and timer fires to that actor under a per-key lock, so every
//! transition for a key observes the fully committed result of the previous
//! one, including the store, timer and transport I/O performed in between.

mod actor;
pub mod policy;
mod router;
pub mod snapshot;
mod types;

pub use router::{Coordinator, CoordinatorDeps, CoordinatorSettings, RecoveryReport};
pub use snapshot::{ActorSnapshot, SnapshotStore, SqliteSnapshotStore};
pub use types::{
    CorrelationKey, Link, MessageRecord, MessageRecordPatch, NewMessageRecord, Outcome, Platform,
    PlatformSide, StreamEvent, StreamMetadata, StreamPayload, StreamStatus, Subscription,
};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid correlation key: {0:?}")]
    InvalidKey(String),

    #[error("unknown platform: {0:?}")]
    UnknownPlatform(String),

    /// The task running the transition panicked or was cancelled at shutdown.
    #[error("actor transition aborted: {0}")]
    TransitionAborted(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
