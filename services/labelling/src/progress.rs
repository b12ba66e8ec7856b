use crate::selection_store::{SelectionStore, StoreError};
use std::sync::Arc;
use tracing::debug;

/// Tracks which videos a labeller still has to work on.
///
/// A video counts as labeled as soon as it holds any persisted selection,
/// even with fewer than three ranks filled.
pub struct ProgressTracker {
    store: Arc<dyn SelectionStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn SelectionStore>) -> Self {
        Self { store }
    }

    /// `all_videos` minus the ones this actor already touched, order preserved
    pub async fn unlabeled_videos(
        &self,
        actor: &str,
        category: &str,
        all_videos: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let labeled = self
            .store
            .list_videos_with_any_selection(actor, category)
            .await?;

        let remaining: Vec<String> = all_videos
            .iter()
            .filter(|video| !labeled.contains(video.as_str()))
            .cloned()
            .collect();

        debug!(
            actor = %actor,
            category = %category,
            total = all_videos.len(),
            remaining = remaining.len(),
            "Computed labelling progress"
        );

        Ok(remaining)
    }
}
