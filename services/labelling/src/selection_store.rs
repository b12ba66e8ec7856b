//! Durable storage contract for rank→frame selections.

use crate::selection::{Rank, RankMapping, SelectionKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors raised by selection store backends
#[derive(Error, Debug)]
pub enum StoreError {
    /// A concurrent writer touched the same key; the whole unit was rolled back
    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Stored rank {0} is outside 1..=3")]
    CorruptRank(i64),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Failures that may succeed when the whole unit is replayed: write
    /// races, pool exhaustion and dropped connections.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Conflict(_) => true,
            StoreError::CorruptRank(_) => false,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::WorkerCrashed
            ),
        }
    }
}

/// A single mutation inside an atomic store write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Remove the record at this rank if present
    Clear(Rank),
    /// Create or replace the record at this rank
    Upsert { rank: Rank, frame: String },
}

/// One persisted selection, flattened for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatSelection {
    pub actor: String,
    pub category: String,
    pub video: String,
    pub rank: Rank,
    pub frame: String,
}

/// Optional filters for [`SelectionStore::list_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SelectionFilter {
    pub actor: Option<String>,
    pub category: Option<String>,
}

impl SelectionFilter {
    pub fn matches(&self, key: &SelectionKey) -> bool {
        self.actor.as_deref().map_or(true, |a| a == key.actor)
            && self.category.as_deref().map_or(true, |c| c == key.category)
    }
}

/// Keyed storage for selection records.
///
/// Backends guarantee at most one record per (key, rank) and at most one per
/// (key, frame). Each call to [`SelectionStore::apply`] is a single atomic
/// unit: either every op lands or none do, and readers never observe a
/// partially applied batch. A batch that would break frame uniqueness, or
/// that lost a race with another writer, fails with [`StoreError::Conflict`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SelectionStore: Send + Sync {
    /// Apply `ops` in order as one transaction
    async fn apply(&self, key: &SelectionKey, ops: &[StoreOp]) -> Result<(), StoreError>;

    /// Current rank→frame mapping for a key
    async fn get(&self, key: &SelectionKey) -> Result<RankMapping, StoreError>;

    /// Videos with at least one record for this actor and category
    async fn list_videos_with_any_selection(
        &self,
        actor: &str,
        category: &str,
    ) -> Result<BTreeSet<String>, StoreError>;

    /// Every record matching `filter`, in no particular order
    async fn list_all(&self, filter: &SelectionFilter) -> Result<Vec<FlatSelection>, StoreError>;

    /// Check the backend is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Write or replace the record at (key, rank)
    async fn upsert(&self, key: &SelectionKey, rank: Rank, frame: &str) -> Result<(), StoreError> {
        self.apply(
            key,
            &[StoreOp::Upsert {
                rank,
                frame: frame.to_string(),
            }],
        )
        .await
    }

    /// Remove the record at (key, rank); absent records are not an error
    async fn clear(&self, key: &SelectionKey, rank: Rank) -> Result<(), StoreError> {
        self.apply(key, &[StoreOp::Clear(rank)]).await
    }
}
