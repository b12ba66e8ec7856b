use crate::config::SelectionConfig;
use crate::selection::{Rank, RankMapping, SelectionError, SelectionKey};
use crate::selection_store::{SelectionStore, StoreError, StoreOp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Turns rank requests into conflict-free store writes.
///
/// Every mutation for a key runs as read → plan → atomic apply while holding
/// that key's lock, so two requests for the same (actor, category, video)
/// never interleave. Different keys proceed in parallel.
///
/// After any sequence of [`assign`](Self::assign) and
/// [`unassign`](Self::unassign) calls the stored mapping for a key is an
/// injective partial function from ranks to frames.
pub struct RankAssignmentService {
    store: Arc<dyn SelectionStore>,
    /// Per-key write locks, dropped once no request holds them
    key_locks: KeyLocks,
    max_conflict_retries: u32,
}

impl RankAssignmentService {
    pub fn new(store: Arc<dyn SelectionStore>, config: &SelectionConfig) -> Self {
        Self {
            store,
            key_locks: Mutex::new(HashMap::new()),
            max_conflict_retries: config.max_conflict_retries,
        }
    }

    /// Put `frame` at `rank`, moving it off any other rank it held.
    ///
    /// Returns the mapping as persisted after the write.
    #[instrument(skip_all, fields(key = %key, rank = rank, frame = %frame))]
    pub async fn assign(
        &self,
        key: &SelectionKey,
        rank: i64,
        frame: &str,
    ) -> Result<RankMapping, SelectionError> {
        let rank = Rank::new(rank)?;
        let started = Instant::now();

        let (mapping, ops) = self
            .with_key_lock(key, |current| plan_assign(current, rank, frame))
            .await?;

        if ops.iter().any(|op| matches!(op, StoreOp::Clear(_))) {
            metrics::counter!("labelling.selections.moved").increment(1);
        }
        metrics::counter!("labelling.selections.assigned").increment(1);
        metrics::histogram!("labelling.assign.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(filled = mapping.len(), "Rank assigned");
        Ok(mapping)
    }

    /// Clear `rank`; clearing an empty rank is a no-op.
    #[instrument(skip_all, fields(key = %key, rank = rank))]
    pub async fn unassign(&self, key: &SelectionKey, rank: i64) -> Result<RankMapping, SelectionError> {
        let rank = Rank::new(rank)?;

        let (mapping, ops) = self
            .with_key_lock(key, |current| {
                if current.get(rank).is_some() {
                    vec![StoreOp::Clear(rank)]
                } else {
                    Vec::new()
                }
            })
            .await?;

        if ops.is_empty() {
            debug!("Rank already empty");
        } else {
            metrics::counter!("labelling.selections.unassigned").increment(1);
            info!(filled = mapping.len(), "Rank cleared");
        }

        Ok(mapping)
    }

    /// Current picks for a key; an untouched key yields an empty mapping
    pub async fn get(&self, key: &SelectionKey) -> Result<RankMapping, SelectionError> {
        Ok(self.store.get(key).await?)
    }

    /// Run a read-modify-write for `key` under its lock, retrying transient
    /// store failures.
    ///
    /// Yields the resulting mapping and the ops that were committed.
    async fn with_key_lock<F>(
        &self,
        key: &SelectionKey,
        plan: F,
    ) -> Result<(RankMapping, Vec<StoreOp>), SelectionError>
    where
        F: Fn(&RankMapping) -> Vec<StoreOp>,
    {
        // Declared first so it drops last, after `lock` and the guard, even
        // when this future is cancelled mid-flight.
        let _release = KeyLockRelease {
            locks: &self.key_locks,
            key,
        };
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let written = self.read_modify_write(key, &plan).await?;
        Ok(written)
    }

    async fn read_modify_write<F>(
        &self,
        key: &SelectionKey,
        plan: &F,
    ) -> Result<(RankMapping, Vec<StoreOp>), SelectionError>
    where
        F: Fn(&RankMapping) -> Vec<StoreOp>,
    {
        let attempts = self.max_conflict_retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_write(key, plan).await {
                Ok(written) => return Ok(written),
                Err(e) if e.is_transient() => {
                    if matches!(e, StoreError::Conflict(_)) {
                        metrics::counter!("labelling.store.conflicts").increment(1);
                    } else {
                        metrics::counter!("labelling.store.transient_errors").increment(1);
                    }
                    warn!(attempt, attempts, error = %e, "Selection write failed, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_error {
            Some(StoreError::Conflict(_)) | None => Err(SelectionError::StorageConflict {
                key: key.clone(),
                attempts,
            }),
            Some(e) => Err(e.into()),
        }
    }

    /// One read → plan → apply pass
    async fn try_write<F>(
        &self,
        key: &SelectionKey,
        plan: &F,
    ) -> Result<(RankMapping, Vec<StoreOp>), StoreError>
    where
        F: Fn(&RankMapping) -> Vec<StoreOp>,
    {
        let mut mapping = self.store.get(key).await?;
        let ops = plan(&mapping);

        if ops.is_empty() {
            debug!("Nothing to write");
            return Ok((mapping, ops));
        }

        self.store.apply(key, &ops).await?;
        apply_ops(&mut mapping, &ops);
        Ok((mapping, ops))
    }

    fn lock_for(&self, key: &SelectionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.key_locks.lock().len()
    }
}

type KeyLocks = Mutex<HashMap<SelectionKey, Arc<tokio::sync::Mutex<()>>>>;

/// Drops a key's lock entry once no request holds it
struct KeyLockRelease<'a> {
    locks: &'a KeyLocks,
    key: &'a SelectionKey,
}

impl Drop for KeyLockRelease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        if locks
            .get(self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(self.key);
        }
    }
}

/// Ops that put `frame` at `rank` given the current mapping
fn plan_assign(current: &RankMapping, rank: Rank, frame: &str) -> Vec<StoreOp> {
    if current.get(rank) == Some(frame) {
        return Vec::new();
    }

    let mut ops = Vec::with_capacity(2);
    if let Some(previous) = current.rank_of(frame) {
        // previous != rank, otherwise the early return above fired
        debug!(from = %previous, to = %rank, "Moving frame to new rank");
        ops.push(StoreOp::Clear(previous));
    }
    ops.push(StoreOp::Upsert {
        rank,
        frame: frame.to_string(),
    });
    ops
}

fn apply_ops(mapping: &mut RankMapping, ops: &[StoreOp]) {
    for op in ops {
        match op {
            StoreOp::Clear(rank) => {
                mapping.remove(*rank);
            }
            StoreOp::Upsert { rank, frame } => {
                mapping.insert(*rank, frame.clone());
            }
        }
    }
}
