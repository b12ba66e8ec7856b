use crate::selection::Rank;
use crate::selection_store::{FlatSelection, SelectionFilter, SelectionStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

/// Column order of the exported artifact; downstream analysis depends on it
pub const EXPORT_COLUMNS: [&str; 5] = ["actor", "category", "video", "frame", "rank"];

/// One exported pick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub actor: String,
    pub category: String,
    pub video: String,
    pub frame: String,
    pub rank: Rank,
}

impl From<FlatSelection> for ExportRow {
    fn from(s: FlatSelection) -> Self {
        Self {
            actor: s.actor,
            category: s.category,
            video: s.video,
            frame: s.frame,
            rank: s.rank,
        }
    }
}

/// Flattened report over every persisted selection
pub struct ExportService {
    store: Arc<dyn SelectionStore>,
}

impl ExportService {
    pub fn new(store: Arc<dyn SelectionStore>) -> Self {
        Self { store }
    }

    /// Rows matching `filter`, sorted by (actor, category, video, rank)
    #[instrument(skip(self))]
    pub async fn export(&self, filter: &SelectionFilter) -> Result<Vec<ExportRow>, StoreError> {
        let mut rows: Vec<ExportRow> = self
            .store
            .list_all(filter)
            .await?
            .into_iter()
            .map(ExportRow::from)
            .collect();

        rows.sort_by(|a, b| {
            (&a.actor, &a.category, &a.video, a.rank).cmp(&(&b.actor, &b.category, &b.video, b.rank))
        });

        metrics::counter!("labelling.export.rows").increment(rows.len() as u64);
        info!(rows = rows.len(), "Exported selections");

        Ok(rows)
    }

    /// Render rows as CSV with a header line of [`EXPORT_COLUMNS`]
    pub fn to_csv(rows: &[ExportRow]) -> String {
        let mut csv = EXPORT_COLUMNS.join(",");
        csv.push('\n');

        for row in rows {
            csv.push_str(&format!(
                "{},{},{},{},{}\n",
                csv_field(&row.actor),
                csv_field(&row.category),
                csv_field(&row.video),
                csv_field(&row.frame),
                row.rank,
            ));
        }

        csv
    }
}

/// Quote a field when it contains a delimiter, quote or line break
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemorySelectionStore;
    use crate::selection::SelectionKey;

    async fn seeded_store() -> Arc<MemorySelectionStore> {
        let store = Arc::new(MemorySelectionStore::new());
        let picks = [
            ("bob", "catB", "vid1", Rank::SECOND, "b.jpg"),
            ("alice", "catB", "vid9", Rank::FIRST, "x.png"),
            ("alice", "catA", "vid2", Rank::THIRD, "c.jpg"),
            ("alice", "catA", "vid2", Rank::FIRST, "a.jpg"),
            ("bob", "catA", "vid1", Rank::FIRST, "z.jpg"),
        ];
        for (actor, category, video, rank, frame) in picks {
            store
                .upsert(&SelectionKey::new(actor, category, video), rank, frame)
                .await
                .unwrap();
        }
        store
    }

    fn summary(rows: &[ExportRow]) -> Vec<(String, String, String, u8)> {
        rows.iter()
            .map(|r| (r.actor.clone(), r.category.clone(), r.video.clone(), r.rank.get()))
            .collect()
    }

    #[tokio::test]
    async fn test_export_is_sorted_and_complete() {
        let service = ExportService::new(seeded_store().await);

        let rows = service.export(&SelectionFilter::default()).await.unwrap();

        let expected: Vec<(String, String, String, u8)> = [
            ("alice", "catA", "vid2", 1),
            ("alice", "catA", "vid2", 3),
            ("alice", "catB", "vid9", 1),
            ("bob", "catA", "vid1", 1),
            ("bob", "catB", "vid1", 2),
        ]
        .into_iter()
        .map(|(a, c, v, r)| (a.to_string(), c.to_string(), v.to_string(), r))
        .collect();
        assert_eq!(summary(&rows), expected);
    }

    #[tokio::test]
    async fn test_export_filters_by_actor() {
        let service = ExportService::new(seeded_store().await);

        let rows = service
            .export(&SelectionFilter {
                actor: Some("alice".to_string()),
                category: None,
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.actor == "alice"));
    }

    #[tokio::test]
    async fn test_export_filters_by_actor_and_category() {
        let service = ExportService::new(seeded_store().await);

        let rows = service
            .export(&SelectionFilter {
                actor: Some("bob".to_string()),
                category: Some("catB".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].frame, "b.jpg");
    }

    #[test]
    fn test_csv_header_and_columns() {
        let rows = vec![ExportRow {
            actor: "alice".to_string(),
            category: "catA".to_string(),
            video: "vid2".to_string(),
            frame: "a.jpg".to_string(),
            rank: Rank::FIRST,
        }];

        assert_eq!(
            ExportService::to_csv(&rows),
            "actor,category,video,frame,rank\nalice,catA,vid2,a.jpg,1\n"
        );
    }

    #[test]
    fn test_csv_quotes_special_characters() {
        let rows = vec![ExportRow {
            actor: "o\"brien".to_string(),
            category: "cats, dogs".to_string(),
            video: "vid".to_string(),
            frame: "a.jpg".to_string(),
            rank: Rank::THIRD,
        }];

        assert_eq!(
            ExportService::to_csv(&rows),
            "actor,category,video,frame,rank\n\"o\"\"brien\",\"cats, dogs\",vid,a.jpg,3\n"
        );
    }

    #[test]
    fn test_empty_export_still_has_header() {
        assert_eq!(ExportService::to_csv(&[]), "actor,category,video,frame,rank\n");
    }
}
