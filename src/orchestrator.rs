use anyhow::Result;
use chrono::Utc;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::SessionConfig;
use crate::dedup::{Deduplicator, RegisterOutcome};
use crate::driver::{DriverFactory, InteractionPacing};
use crate::ledger::Ledger;
use crate::models::{ApplicationState, CandidateProfile};
use crate::ratelimit::RateLimiter;
use crate::report::{self, SessionReport};
use crate::score::MatchScorer;
use crate::source::SourceAdapter;
use crate::worker::{AttemptOutcome, SubmissionWorker, WorkItem};

/// Shared between the discovery loop and the worker pool. `pending` counts
/// queued-or-in-flight items; the pool drains until discovery has finished
/// and pending hits zero.
struct Shared {
    queue: Mutex<BinaryHeap<WorkItem>>,
    pending: AtomicUsize,
    discovery_done: AtomicBool,
    /// Records that have been granted one of the session's application slots.
    /// Requeues of an admitted record never consume a second slot.
    admitted: Mutex<HashSet<i64>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            pending: AtomicUsize::new(0),
            discovery_done: AtomicBool::new(false),
            admitted: Mutex::new(HashSet::new()),
        }
    }

    /// Pushes a whole batch under one lock so a racing worker sees the full
    /// batch and pops the best-scored item first.
    fn enqueue_batch(&self, items: Vec<WorkItem>) {
        if items.is_empty() {
            return;
        }
        self.pending.fetch_add(items.len(), Ordering::AcqRel);
        let mut queue = self.queue.lock().unwrap();
        for item in items {
            queue.push(item);
        }
    }

    fn admit(&self, record_id: i64, max: usize) -> bool {
        let mut admitted = self.admitted.lock().unwrap();
        if admitted.contains(&record_id) {
            return true;
        }
        if admitted.len() >= max {
            return false;
        }
        admitted.insert(record_id);
        true
    }

    fn settle(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    fn drained(&self) -> bool {
        self.discovery_done.load(Ordering::Acquire) && self.pending.load(Ordering::Acquire) == 0
    }
}

/// Runs one full session: discovery, scoring, dedup, queueing, the bounded
/// submission pool, and the closing report. Restart-safe: stale in-progress
/// records from a crashed run are requeued before anything else happens.
pub struct Orchestrator {
    config: SessionConfig,
    profile: Arc<CandidateProfile>,
    ledger: Arc<Ledger>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    drivers: Arc<dyn DriverFactory>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: SessionConfig,
        profile: CandidateProfile,
        ledger: Arc<Ledger>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        drivers: Arc<dyn DriverFactory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            profile: Arc::new(profile),
            ledger,
            adapters,
            drivers,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<SessionReport> {
        let started_at = Utc::now();
        let session_id = format!("session_{}", started_at.format("%Y%m%d_%H%M%S"));
        info!(session = %session_id, profile = %self.profile.id, "session starting");

        let stale = self.ledger.reconcile_in_progress(&self.profile.id)?;
        if !stale.is_empty() {
            info!(count = stale.len(), "requeued records left in progress by a prior run");
        }

        let limiter = Arc::new(
            RateLimiter::new(
                &self.config.rate,
                self.config.rate.daily_caps(&self.config.sources),
            )
            .with_ledger(Arc::clone(&self.ledger)),
        );
        let breaker = Arc::new(CircuitBreaker::new(&self.config.breaker));
        let shared = Arc::new(Shared::new());

        // Carry-over from earlier sessions, deferred or never attempted.
        let leftovers: Vec<WorkItem> = self
            .ledger
            .records_in_state(&self.profile.id, ApplicationState::Queued)?
            .into_iter()
            .map(|rec| WorkItem {
                record_id: rec.id,
                source_id: rec.source_id,
                url: rec.url,
                score: rec.score,
            })
            .collect();
        shared.enqueue_batch(leftovers);

        let pacing = InteractionPacing::new(&self.config.pacing);
        let mut pool = Vec::with_capacity(self.config.worker_pool_size);
        for _ in 0..self.config.worker_pool_size {
            let worker = SubmissionWorker {
                ledger: Arc::clone(&self.ledger),
                limiter: Arc::clone(&limiter),
                breaker: Arc::clone(&breaker),
                drivers: Arc::clone(&self.drivers),
                profile: Arc::clone(&self.profile),
                retry: self.config.retry,
                cancel: self.cancel.clone(),
            };
            pool.push(tokio::spawn(worker_loop(
                worker,
                Arc::clone(&shared),
                pacing,
                self.config.max_applications_per_session,
            )));
        }

        // Discovery runs on this task, concurrent with the pool. Its result
        // is settled after the pool has drained so workers never wait on a
        // done flag that will not come.
        let discovery = self.discover(&shared, &breaker).await;
        shared.discovery_done.store(true, Ordering::Release);
        for handle in pool {
            let _ = handle.await;
        }
        discovery?;

        let finished_at = Utc::now();
        let session_report = report::build(
            &self.ledger,
            &self.profile.id,
            &session_id,
            started_at,
            finished_at,
        )?;
        let exported = session_report.export(&self.ledger, &self.config.output_dir)?;
        info!(
            session = %session_id,
            submitted = session_report.counts.submitted,
            failed = session_report.counts.failed,
            report = %exported.display(),
            "session complete"
        );
        Ok(session_report)
    }

    /// Pulls every configured source once. Per-source fetch failures are
    /// contained and feed the breaker; only ledger failures abort.
    async fn discover(&self, shared: &Shared, breaker: &CircuitBreaker) -> Result<()> {
        let scorer = MatchScorer::new(self.config.scoring.clone());
        let dedup = Deduplicator::new(Arc::clone(&self.ledger));

        for adapter in &self.adapters {
            if self.cancel.is_cancelled() {
                break;
            }
            let postings = match adapter.fetch(&self.config.search).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(source = adapter.id(), error = %e, "discovery fetch failed");
                    breaker.record_outcome(adapter.id(), false);
                    continue;
                }
            };
            info!(source = adapter.id(), count = postings.len(), "fetched postings");

            let direct_apply = adapter.capabilities().supports_direct_apply;
            let mut batch = Vec::new();
            for posting in postings {
                if dedup.register(&posting)? == RegisterOutcome::Duplicate {
                    debug!(source = adapter.id(), title = %posting.title, "duplicate posting");
                    continue;
                }
                let result = scorer.score(&self.profile, &posting);
                let Some(id) = self.ledger.create_record(
                    &self.profile.id,
                    &result.fingerprint,
                    &posting.source_id,
                    &posting.url,
                    &posting.title,
                    &posting.organization,
                    result.score,
                    result.tier,
                )?
                else {
                    continue;
                };
                self.ledger.transition(id, ApplicationState::Scored, None, None)?;

                if result.score < self.config.score_floor {
                    self.ledger.transition(
                        id,
                        ApplicationState::Skipped,
                        None,
                        Some("below score floor"),
                    )?;
                    debug!(record = id, score = result.score, "skipped below floor");
                } else if !direct_apply {
                    self.ledger.transition(
                        id,
                        ApplicationState::NeedsReview,
                        None,
                        Some("manual application required"),
                    )?;
                } else {
                    self.ledger.transition(id, ApplicationState::Queued, None, None)?;
                    batch.push(WorkItem {
                        record_id: id,
                        source_id: posting.source_id.clone(),
                        url: posting.url.clone(),
                        score: result.score,
                    });
                }
            }
            shared.enqueue_batch(batch);
        }
        Ok(())
    }
}

/// One pool worker. Exits on cancellation or once the queue is drained and
/// discovery is over.
async fn worker_loop(
    worker: SubmissionWorker,
    shared: Arc<Shared>,
    pacing: InteractionPacing,
    session_cap: usize,
) {
    loop {
        if worker.cancel.is_cancelled() {
            break;
        }
        let item = shared.queue.lock().unwrap().pop();
        let Some(item) = item else {
            if shared.drained() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        };

        if !shared.admit(item.record_id, session_cap) {
            debug!(record = item.record_id, "session application cap reached, deferring");
            shared.settle();
            continue;
        }

        match worker.process(&item).await {
            Ok(AttemptOutcome::Requeue { delay }) => {
                // The item keeps its pending slot while it waits.
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.queue.lock().unwrap().push(item);
                });
            }
            Ok(AttemptOutcome::Submitted) | Ok(AttemptOutcome::Terminal(_)) => {
                shared.settle();
                pacing.pause().await;
            }
            Ok(AttemptOutcome::Deferred) => {
                shared.settle();
            }
            Err(e) => {
                warn!(record = item.record_id, error = %e, "attempt aborted on ledger failure");
                shared.settle();
            }
        }
    }
}
