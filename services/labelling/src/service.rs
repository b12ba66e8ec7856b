use crate::assignment::RankAssignmentService;
use crate::config::SelectionConfig;
use crate::export::{ExportRow, ExportService};
use crate::media_catalog::{CatalogError, MediaCatalog};
use crate::progress::ProgressTracker;
use crate::selection::{RankMapping, SelectionError, SelectionKey};
use crate::selection_store::{SelectionFilter, SelectionStore, StoreError};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced to the request layer
#[derive(Error, Debug)]
pub enum LabellingError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Entry point for the application layer.
///
/// Callers pass the authenticated actor and the full target on every call;
/// nothing here keeps per-labeller state between requests.
pub struct LabellingService {
    catalog: Arc<dyn MediaCatalog>,
    store: Arc<dyn SelectionStore>,
    assignments: RankAssignmentService,
    progress: ProgressTracker,
    exports: ExportService,
}

impl LabellingService {
    pub fn new(
        store: Arc<dyn SelectionStore>,
        catalog: Arc<dyn MediaCatalog>,
        config: &SelectionConfig,
    ) -> Self {
        Self {
            assignments: RankAssignmentService::new(store.clone(), config),
            progress: ProgressTracker::new(store.clone()),
            exports: ExportService::new(store.clone()),
            catalog,
            store,
        }
    }

    pub fn catalog(&self) -> &dyn MediaCatalog {
        self.catalog.as_ref()
    }

    pub async fn assign_selection(
        &self,
        actor: &str,
        category: &str,
        video: &str,
        rank: i64,
        frame: &str,
    ) -> Result<RankMapping, LabellingError> {
        let key = SelectionKey::new(actor, category, video);
        Ok(self.assignments.assign(&key, rank, frame).await?)
    }

    pub async fn unassign_selection(
        &self,
        actor: &str,
        category: &str,
        video: &str,
        rank: i64,
    ) -> Result<RankMapping, LabellingError> {
        let key = SelectionKey::new(actor, category, video);
        Ok(self.assignments.unassign(&key, rank).await?)
    }

    pub async fn get_selections(
        &self,
        actor: &str,
        category: &str,
        video: &str,
    ) -> Result<RankMapping, LabellingError> {
        let key = SelectionKey::new(actor, category, video);
        Ok(self.assignments.get(&key).await?)
    }

    /// Catalog videos for `category` this actor has not started, in catalog order
    pub async fn get_unlabeled_videos(
        &self,
        actor: &str,
        category: &str,
    ) -> Result<Vec<String>, LabellingError> {
        let all_videos = self.catalog.list_videos(category).await?;
        Ok(self
            .progress
            .unlabeled_videos(actor, category, &all_videos)
            .await?)
    }

    pub async fn export_selections(
        &self,
        filter: &SelectionFilter,
    ) -> Result<Vec<ExportRow>, LabellingError> {
        Ok(self.exports.export(filter).await?)
    }

    /// Check the backing store is reachable
    pub async fn ping(&self) -> Result<(), LabellingError> {
        Ok(self.store.ping().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_catalog::FsMediaCatalog;
    use crate::memory_store::MemorySelectionStore;
    use crate::selection::Rank;
    use std::fs;

    fn service_over(root: &std::path::Path) -> LabellingService {
        let catalog = FsMediaCatalog::new(root, &["jpg".to_string()]);
        LabellingService::new(
            Arc::new(MemorySelectionStore::new()),
            Arc::new(catalog),
            &SelectionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_unlabeled_videos_follow_catalog_order() {
        let dir = tempfile::tempdir().unwrap();
        for video in ["vid3", "vid1", "vid2"] {
            fs::create_dir_all(dir.path().join("catA").join(video)).unwrap();
        }
        let service = service_over(dir.path());

        service
            .assign_selection("actorA", "catA", "vid2", 1, "a.jpg")
            .await
            .unwrap();

        assert_eq!(
            service.get_unlabeled_videos("actorA", "catA").await.unwrap(),
            vec!["vid1", "vid3"]
        );
        assert_eq!(
            service.get_unlabeled_videos("actorB", "catA").await.unwrap(),
            vec!["vid1", "vid2", "vid3"]
        );
    }

    #[tokio::test]
    async fn test_unknown_category_is_catalog_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_over(dir.path());

        assert!(matches!(
            service.get_unlabeled_videos("actorA", "missing").await,
            Err(LabellingError::Catalog(CatalogError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_round_trip_through_facade() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_over(dir.path());

        service
            .assign_selection("bob", "catX", "vidY", 1, "a.jpg")
            .await
            .unwrap();
        service
            .assign_selection("bob", "catX", "vidY", 2, "b.jpg")
            .await
            .unwrap();
        service
            .unassign_selection("bob", "catX", "vidY", 1)
            .await
            .unwrap();

        let mapping = service.get_selections("bob", "catX", "vidY").await.unwrap();
        assert_eq!(mapping.iter().collect::<Vec<_>>(), vec![(Rank::SECOND, "b.jpg")]);

        let rows = service
            .export_selections(&SelectionFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        assert!(matches!(
            service.assign_selection("bob", "catX", "vidY", 9, "a.jpg").await,
            Err(LabellingError::Selection(SelectionError::InvalidRank(9)))
        ));
    }
}
