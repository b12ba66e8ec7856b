use crate::config::DatabaseConfig;
use crate::selection::{Rank, RankMapping, SelectionKey};
use crate::selection_store::{FlatSelection, SelectionFilter, SelectionStore, StoreError, StoreOp};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// PostgreSQL unique_violation
const UNIQUE_VIOLATION: &str = "23505";
/// PostgreSQL serialization_failure
const SERIALIZATION_FAILURE: &str = "40001";
/// PostgreSQL deadlock_detected
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, FromRow)]
struct RankFrameRow {
    rank: i16,
    frame: String,
}

#[derive(Debug, FromRow)]
struct FlatRow {
    actor: String,
    category: String,
    video: String,
    rank: i16,
    frame: String,
}

/// Selection store backed by the `selections` table
pub struct PgSelectionStore {
    pool: PgPool,
    media_root: PathBuf,
}

impl PgSelectionStore {
    /// Connect a pool sized by `config`
    pub async fn new(config: &DatabaseConfig, media_root: PathBuf) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect selection store to PostgreSQL")?;

        info!(max_connections = config.max_connections, "Selection store connected");

        Ok(Self::with_pool(pool, media_root))
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: PgPool, media_root: PathBuf) -> Self {
        Self { pool, media_root }
    }

    /// Apply pending migrations from `migrations/`
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to migrate selections schema")?;

        info!("Selections schema up to date");
        Ok(())
    }

    fn image_path(&self, key: &SelectionKey, frame: &str) -> String {
        self.media_root
            .join(&key.category)
            .join(&key.video)
            .join(frame)
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl SelectionStore for PgSelectionStore {
    #[instrument(skip_all, fields(key = %key, ops = ops.len()))]
    async fn apply(&self, key: &SelectionKey, ops: &[StoreOp]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        for op in ops {
            match op {
                StoreOp::Clear(rank) => {
                    sqlx::query(
                        r#"
                        DELETE FROM selections
                        WHERE actor = $1 AND category = $2 AND video = $3 AND rank = $4
                        "#,
                    )
                    .bind(&key.actor)
                    .bind(&key.category)
                    .bind(&key.video)
                    .bind(rank.get() as i16)
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
                }
                StoreOp::Upsert { rank, frame } => {
                    sqlx::query(
                        r#"
                        INSERT INTO selections (
                            id, actor, category, video, rank,
                            frame, image_path, created_at, updated_at
                        ) VALUES (
                            $1, $2, $3, $4, $5,
                            $6, $7, NOW(), NOW()
                        )
                        ON CONFLICT ON CONSTRAINT uq_selections_key_rank
                        DO UPDATE SET
                            frame = EXCLUDED.frame,
                            image_path = EXCLUDED.image_path,
                            updated_at = CASE
                                WHEN selections.frame = EXCLUDED.frame THEN selections.updated_at
                                ELSE NOW()
                            END
                        "#,
                    )
                    .bind(Uuid::new_v4())
                    .bind(&key.actor)
                    .bind(&key.category)
                    .bind(&key.video)
                    .bind(rank.get() as i16)
                    .bind(frame)
                    .bind(self.image_path(key, frame))
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
                }
            }
        }

        // Dropping an uncommitted transaction rolls it back, so any early
        // return above leaves the key untouched.
        tx.commit().await.map_err(classify)?;

        debug!("Selection batch committed");
        Ok(())
    }

    async fn get(&self, key: &SelectionKey) -> Result<RankMapping, StoreError> {
        let rows = sqlx::query_as::<_, RankFrameRow>(
            r#"
            SELECT rank, frame
            FROM selections
            WHERE actor = $1 AND category = $2 AND video = $3
            ORDER BY rank ASC
            "#,
        )
        .bind(&key.actor)
        .bind(&key.category)
        .bind(&key.video)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter()
            .map(|row| Ok((to_rank(row.rank)?, row.frame)))
            .collect()
    }

    async fn list_videos_with_any_selection(
        &self,
        actor: &str,
        category: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        let videos: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT video
            FROM selections
            WHERE actor = $1 AND category = $2
            "#,
        )
        .bind(actor)
        .bind(category)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(videos.into_iter().map(|(video,)| video).collect())
    }

    #[instrument(skip(self))]
    async fn list_all(&self, filter: &SelectionFilter) -> Result<Vec<FlatSelection>, StoreError> {
        let rows = sqlx::query_as::<_, FlatRow>(
            r#"
            SELECT actor, category, video, rank, frame
            FROM selections
            WHERE ($1::text IS NULL OR actor = $1)
              AND ($2::text IS NULL OR category = $2)
            "#,
        )
        .bind(filter.actor.as_deref())
        .bind(filter.category.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter()
            .map(|row| {
                Ok(FlatSelection {
                    rank: to_rank(row.rank)?,
                    actor: row.actor,
                    category: row.category,
                    video: row.video,
                    frame: row.frame,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn to_rank(value: i16) -> Result<Rank, StoreError> {
    Rank::new(value as i64).map_err(|_| StoreError::CorruptRank(value as i64))
}

/// Map races on the same key to [`StoreError::Conflict`] so callers can retry.
fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some(UNIQUE_VIOLATION) => {
                let constraint = db_err.constraint().unwrap_or("unknown");
                return StoreError::Conflict(format!(
                    "unique constraint {} violated",
                    constraint
                ));
            }
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                return StoreError::Conflict(db_err.message().to_string());
            }
            _ => {}
        }
    }
    StoreError::Database(err)
}
