//! Process-local selection store used for tests and `memory://` development runs.

use crate::selection::{RankMapping, SelectionKey};
use crate::selection_store::{FlatSelection, SelectionFilter, SelectionStore, StoreError, StoreOp};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

/// In-memory [`SelectionStore`] with the same uniqueness rules as the
/// PostgreSQL schema. A batch is staged on a copy of the key's mapping and
/// only swapped in once every op has passed the constraint checks.
#[derive(Default)]
pub struct MemorySelectionStore {
    selections: RwLock<BTreeMap<SelectionKey, RankMapping>>,
}

impl MemorySelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all keys
    pub fn record_count(&self) -> usize {
        self.selections.read().values().map(RankMapping::len).sum()
    }
}

#[async_trait]
impl SelectionStore for MemorySelectionStore {
    #[instrument(skip_all, fields(key = %key, ops = ops.len()))]
    async fn apply(&self, key: &SelectionKey, ops: &[StoreOp]) -> Result<(), StoreError> {
        let mut selections = self.selections.write();
        let mut staged = selections.get(key).cloned().unwrap_or_default();

        for op in ops {
            match op {
                StoreOp::Clear(rank) => {
                    staged.remove(*rank);
                }
                StoreOp::Upsert { rank, frame } => {
                    if let Some(held_by) = staged.rank_of(frame).filter(|r| r != rank) {
                        return Err(StoreError::Conflict(format!(
                            "frame {} already holds rank {} for {}",
                            frame, held_by, key
                        )));
                    }
                    staged.insert(*rank, frame.clone());
                }
            }
        }

        if staged.is_empty() {
            selections.remove(key);
        } else {
            selections.insert(key.clone(), staged);
        }

        debug!("Applied selection batch");
        Ok(())
    }

    async fn get(&self, key: &SelectionKey) -> Result<RankMapping, StoreError> {
        Ok(self
            .selections
            .read()
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_videos_with_any_selection(
        &self,
        actor: &str,
        category: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .selections
            .read()
            .keys()
            .filter(|key| key.actor == actor && key.category == category)
            .map(|key| key.video.clone())
            .collect())
    }

    async fn list_all(&self, filter: &SelectionFilter) -> Result<Vec<FlatSelection>, StoreError> {
        let selections = self.selections.read();
        let rows = selections
            .iter()
            .filter(|(key, _)| filter.matches(key))
            .flat_map(|(key, mapping)| {
                mapping.iter().map(move |(rank, frame)| FlatSelection {
                    actor: key.actor.clone(),
                    category: key.category.clone(),
                    video: key.video.clone(),
                    rank,
                    frame: frame.to_string(),
                })
            })
            .collect();

        Ok(rows)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::Rank;

    fn key() -> SelectionKey {
        SelectionKey::new("bob", "catX", "vidY")
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemorySelectionStore::new();

        store.upsert(&key(), Rank::FIRST, "a.jpg").await.unwrap();
        store.upsert(&key(), Rank::FIRST, "a.jpg").await.unwrap();

        let mapping = store.get(&key()).await.unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get(Rank::FIRST), Some("a.jpg"));
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let store = MemorySelectionStore::new();

        store.upsert(&key(), Rank::SECOND, "a.jpg").await.unwrap();
        store.upsert(&key(), Rank::SECOND, "b.jpg").await.unwrap();

        let mapping = store.get(&key()).await.unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get(Rank::SECOND), Some("b.jpg"));
    }

    #[tokio::test]
    async fn test_clear_absent_rank_is_noop() {
        let store = MemorySelectionStore::new();

        store.clear(&key(), Rank::THIRD).await.unwrap();
        assert!(store.get(&key()).await.unwrap().is_empty());
        assert!(store
            .list_videos_with_any_selection("bob", "catX")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_frame_uniqueness_rejects_whole_batch() {
        let store = MemorySelectionStore::new();
        store.upsert(&key(), Rank::FIRST, "a.jpg").await.unwrap();

        let result = store
            .apply(
                &key(),
                &[
                    StoreOp::Upsert {
                        rank: Rank::THIRD,
                        frame: "c.jpg".to_string(),
                    },
                    StoreOp::Upsert {
                        rank: Rank::SECOND,
                        frame: "a.jpg".to_string(),
                    },
                ],
            )
            .await;

        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // Nothing from the rejected batch is visible
        let mapping = store.get(&key()).await.unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get(Rank::FIRST), Some("a.jpg"));
    }

    #[tokio::test]
    async fn test_clear_then_upsert_moves_frame() {
        let store = MemorySelectionStore::new();
        store.upsert(&key(), Rank::FIRST, "a.jpg").await.unwrap();

        store
            .apply(
                &key(),
                &[
                    StoreOp::Clear(Rank::FIRST),
                    StoreOp::Upsert {
                        rank: Rank::SECOND,
                        frame: "a.jpg".to_string(),
                    },
                ],
            )
            .await
            .unwrap();

        let mapping = store.get(&key()).await.unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get(Rank::SECOND), Some("a.jpg"));
    }

    #[tokio::test]
    async fn test_list_videos_scoped_by_actor_and_category() {
        let store = MemorySelectionStore::new();
        store
            .upsert(&SelectionKey::new("alice", "catA", "vid1"), Rank::FIRST, "a.jpg")
            .await
            .unwrap();
        store
            .upsert(&SelectionKey::new("alice", "catB", "vid2"), Rank::FIRST, "a.jpg")
            .await
            .unwrap();
        store
            .upsert(&SelectionKey::new("bob", "catA", "vid3"), Rank::FIRST, "a.jpg")
            .await
            .unwrap();

        let videos = store
            .list_videos_with_any_selection("alice", "catA")
            .await
            .unwrap();
        assert_eq!(videos.into_iter().collect::<Vec<_>>(), vec!["vid1"]);
    }

    #[tokio::test]
    async fn test_list_all_applies_filters() {
        let store = MemorySelectionStore::new();
        store
            .upsert(&SelectionKey::new("alice", "catA", "vid1"), Rank::FIRST, "a.jpg")
            .await
            .unwrap();
        store
            .upsert(&SelectionKey::new("bob", "catA", "vid1"), Rank::SECOND, "b.jpg")
            .await
            .unwrap();

        let all = store.list_all(&SelectionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let bob = store
            .list_all(&SelectionFilter {
                actor: Some("bob".to_string()),
                category: None,
            })
            .await
            .unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].rank, Rank::SECOND);
        assert_eq!(bob[0].frame, "b.jpg");
    }
}
