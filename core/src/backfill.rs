/// Backfill reconciliation: resolve forward references after the fact.
///
/// Messages arrive with reply/reaction references to platform log ids that
/// may not be persisted yet (out-of-order delivery across rooms). A periodic
/// pass scans unresolved references and widens the search: exact match by
/// foreign id first, then the nearest preceding message in the same room as
/// a temporal-adjacency heuristic. The heuristic is approximate, so every
/// resolution is logged with both ids to stay inspectable.
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::StoredMessage;

/// Persistence collaborator. The backing schema is opaque to this core;
/// these four queries are the whole contract.
pub trait MessageRepository: Send + Sync {
    /// Look up a message by its platform-assigned log id within a room
    fn find_by_foreign_reference(&self, room: &str, reference: i64)
        -> Result<Option<StoredMessage>>;

    /// Messages whose reference is set but whose resolved local id is still
    /// empty, optionally restricted to one room
    fn find_unresolved_references(
        &self,
        room: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>>;

    /// Most recent message in the room strictly before `before` that is not
    /// itself an unresolved reply
    fn find_latest_resolved_before(
        &self,
        room: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<StoredMessage>>;

    /// Record the resolved local target for a message
    fn update_resolved_link(&self, message_id: u64, target_id: u64) -> Result<()>;
}

pub const DEFAULT_BATCH_LIMIT: usize = 100;

pub struct BackfillReconciler {
    repo: Arc<dyn MessageRepository>,
    batch_limit: usize,
    running: AtomicBool,
}

impl BackfillReconciler {
    pub fn new(repo: Arc<dyn MessageRepository>) -> Self {
        Self::with_batch_limit(repo, DEFAULT_BATCH_LIMIT)
    }

    pub fn with_batch_limit(repo: Arc<dyn MessageRepository>, batch_limit: usize) -> Self {
        Self {
            repo,
            batch_limit,
            running: AtomicBool::new(false),
        }
    }

    /// Run one reconciliation pass and return the number of newly-resolved
    /// links. Idempotent: nothing is marked resolved until a target is
    /// found, so a re-run sees the same unresolved set. Overlapping passes
    /// are refused — a second caller gets 0 while a pass is in flight.
    pub fn reconcile_once(&self) -> Result<usize> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("backfill pass already in flight, skipping");
            return Ok(0);
        }
        let outcome = self.run_pass();
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    fn run_pass(&self) -> Result<usize> {
        let pending = self
            .repo
            .find_unresolved_references(None, self.batch_limit)?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(count = pending.len(), "scanning unresolved references");

        let mut resolved = 0;
        for message in &pending {
            let Some(reference) = message.reply_reference else {
                continue;
            };

            let exact = self.repo.find_by_foreign_reference(&message.room, reference)?;
            let (target, strategy) = match exact {
                Some(target) => (Some(target), "exact"),
                None => (
                    self.repo
                        .find_latest_resolved_before(&message.room, message.timestamp)?,
                    "nearest-preceding",
                ),
            };

            match target {
                Some(target) if target.id != message.id => {
                    self.repo.update_resolved_link(message.id, target.id)?;
                    info!(
                        message_id = message.id,
                        reference,
                        target_id = target.id,
                        strategy,
                        "resolved reply link"
                    );
                    resolved += 1;
                }
                Some(_) => {
                    debug!(message_id = message.id, "only candidate is the message itself");
                }
                None => {
                    debug!(
                        message_id = message.id,
                        reference, "no candidate target yet, leaving unresolved"
                    );
                }
            }
        }
        Ok(resolved)
    }

    /// Recurring, non-overlapping job loop. Each pass commits resolutions
    /// independently, so interrupting between iterations is always safe.
    pub async fn run(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.reconcile_once() {
                Ok(0) => {}
                Ok(resolved) => info!(resolved, "backfill pass complete"),
                Err(e) => warn!(error = %e, "backfill pass aborted"),
            }
        }
    }
}
