use anyhow::Result;
use rand::Rng;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::driver::{AutomationDriver, Confirmation, DriveError, DriverFactory};
use crate::ledger::Ledger;
use crate::models::{ApplicationState, CandidateProfile, ErrorKind};
use crate::ratelimit::RateLimiter;

/// One queued application, ordered by descending score so the shared heap
/// serves the best fit first.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub record_id: i64,
    pub source_id: String,
    pub url: String,
    pub score: f64,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.record_id == other.record_id
    }
}
impl Eq for WorkItem {}
impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher score wins; ties go to the older record.
        self.score
            .total_cmp(&other.score)
            .then(other.record_id.cmp(&self.record_id))
    }
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Submitted,
    /// Put the item back on the queue after the delay.
    Requeue { delay: Duration },
    /// Leave the record queued for a later session: its source is circuit-
    /// open or out of daily cap, and waiting that out would stall the run.
    Deferred,
    Terminal(ApplicationState),
}

/// Drives one application attempt at a time through the state machine. Holds
/// no per-attempt state of its own; everything durable goes through the
/// ledger so a crash mid-attempt is recoverable.
pub struct SubmissionWorker {
    pub ledger: Arc<Ledger>,
    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub drivers: Arc<dyn DriverFactory>,
    pub profile: Arc<CandidateProfile>,
    pub retry: RetryConfig,
    pub cancel: CancellationToken,
}

impl SubmissionWorker {
    /// Processes one queued item. Gate denials requeue without touching the
    /// record; everything past the gates writes exactly one ledger row per
    /// state transition.
    pub async fn process(&self, item: &WorkItem) -> Result<AttemptOutcome> {
        // Per-source gates. Denial consumes no attempt and no transition.
        match self.limiter.acquire(&item.source_id) {
            crate::ratelimit::Acquire::Granted => {}
            crate::ratelimit::Acquire::Throttled => {
                debug!(record = item.record_id, source = %item.source_id, "rate limiter throttled");
                return Ok(AttemptOutcome::Requeue {
                    delay: self.backoff(1),
                });
            }
            crate::ratelimit::Acquire::CapExhausted => {
                debug!(record = item.record_id, source = %item.source_id, "daily cap exhausted");
                return Ok(AttemptOutcome::Deferred);
            }
        }
        if !self.breaker.allow(&item.source_id) {
            debug!(record = item.record_id, source = %item.source_id, "circuit open");
            return Ok(AttemptOutcome::Deferred);
        }

        self.ledger
            .transition(item.record_id, ApplicationState::InProgress, None, None)?;

        match self.drive(item).await {
            Ok(confirmation) => {
                let attempts = self.ledger.increment_attempts(item.record_id)?;
                self.ledger.set_submission_artifacts(
                    item.record_id,
                    &confirmation.confirmation_id,
                    confirmation.screenshot.as_deref(),
                )?;
                self.ledger
                    .transition(item.record_id, ApplicationState::Submitted, None, None)?;
                self.breaker.record_outcome(&item.source_id, true);
                info!(
                    record = item.record_id,
                    source = %item.source_id,
                    attempts,
                    confirmation = %confirmation.confirmation_id,
                    "application submitted"
                );
                Ok(AttemptOutcome::Submitted)
            }
            Err(e) => self.settle_failure(item, e),
        }
    }

    fn settle_failure(&self, item: &WorkItem, err: DriveError) -> Result<AttemptOutcome> {
        let kind = err.kind();
        // Unreachable or degraded sources feed the breaker; errors where the
        // platform answered coherently count as source-healthy.
        match kind {
            ErrorKind::SourceUnavailable
            | ErrorKind::TransientNetwork
            | ErrorKind::ChallengeRequired => self.breaker.record_outcome(&item.source_id, false),
            ErrorKind::Cancelled => {}
            _ => self.breaker.record_outcome(&item.source_id, true),
        }

        match kind {
            ErrorKind::RateLimited => {
                // Requeue with no attempt penalty.
                warn!(record = item.record_id, source = %item.source_id, %err, "rate limited mid-attempt");
                self.ledger.transition(
                    item.record_id,
                    ApplicationState::Queued,
                    Some(kind),
                    Some("requeued without penalty"),
                )?;
                Ok(AttemptOutcome::Requeue {
                    delay: self.backoff(1),
                })
            }
            ErrorKind::TransientNetwork => {
                let attempts = self.ledger.increment_attempts(item.record_id)?;
                self.ledger.transition(
                    item.record_id,
                    ApplicationState::Failed,
                    Some(kind),
                    Some(&err.to_string()),
                )?;
                if attempts < self.retry.max_attempts {
                    self.ledger.transition(
                        item.record_id,
                        ApplicationState::Queued,
                        Some(kind),
                        Some("retry"),
                    )?;
                    warn!(record = item.record_id, attempts, %err, "transient failure, retrying");
                    Ok(AttemptOutcome::Requeue {
                        delay: self.backoff(attempts),
                    })
                } else {
                    warn!(record = item.record_id, attempts, %err, "retries exhausted");
                    Ok(AttemptOutcome::Terminal(ApplicationState::Failed))
                }
            }
            ErrorKind::AuthFailure | ErrorKind::ChallengeRequired => {
                self.ledger.increment_attempts(item.record_id)?;
                self.ledger.transition(
                    item.record_id,
                    ApplicationState::NeedsReview,
                    Some(kind),
                    Some(&err.to_string()),
                )?;
                warn!(record = item.record_id, source = %item.source_id, %err, "escalated for review");
                Ok(AttemptOutcome::Terminal(ApplicationState::NeedsReview))
            }
            ErrorKind::FormSchemaMismatch | ErrorKind::SourceUnavailable => {
                self.ledger.increment_attempts(item.record_id)?;
                self.ledger.transition(
                    item.record_id,
                    ApplicationState::Failed,
                    Some(kind),
                    Some(&err.to_string()),
                )?;
                warn!(record = item.record_id, source = %item.source_id, %err, "attempt failed");
                Ok(AttemptOutcome::Terminal(ApplicationState::Failed))
            }
            ErrorKind::Cancelled => {
                self.ledger.transition(
                    item.record_id,
                    ApplicationState::Failed,
                    Some(kind),
                    Some("session cancelled"),
                )?;
                info!(record = item.record_id, "attempt abandoned on cancellation");
                Ok(AttemptOutcome::Terminal(ApplicationState::Failed))
            }
        }
    }

    /// Full submission sequence over one fresh driver session. The session
    /// is closed on every exit path, cancellation mid-drive included.
    async fn drive(&self, item: &WorkItem) -> Result<Confirmation, DriveError> {
        let mut session = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DriveError::Cancelled),
            s = self.drivers.session() => s?,
        };
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(DriveError::Cancelled),
            r = self.drive_attempt(session.as_mut(), item) => r,
        };
        session.close().await;
        outcome
    }

    async fn drive_attempt(
        &self,
        session: &mut dyn AutomationDriver,
        item: &WorkItem,
    ) -> Result<Confirmation, DriveError> {
        // A schema mismatch anywhere in the sequence gets one immediate
        // rerun within the same session; dynamic pages sometimes render
        // fields late.
        match self.drive_session(session, item).await {
            Err(DriveError::SchemaMismatch(m)) => {
                debug!(record = item.record_id, mismatch = %m, "schema mismatch, rerunning once");
                self.drive_session(session, item).await
            }
            other => other,
        }
    }

    async fn drive_session(
        &self,
        session: &mut dyn AutomationDriver,
        item: &WorkItem,
    ) -> Result<Confirmation, DriveError> {
        session.open(&item.url).await?;
        session.locate_apply_entry().await?;

        let profile = &self.profile;
        session.fill_field("input[name='name']", &profile.name).await?;
        session.fill_field("input[name='email']", &profile.email).await?;
        if let Some(phone) = &profile.phone {
            session.fill_field("input[name='phone']", phone).await?;
        }
        if let Some(resume) = &profile.resume_ref {
            session.upload_document("input[type='file']", resume).await?;
        }
        session.submit().await?;
        session.capture_confirmation().await
    }

    /// Exponential backoff with jitter, bounded.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry.base_backoff_ms.max(1);
        let exp = base.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(exp.saturating_add(jitter).min(self.retry.max_backoff_ms))
    }
}
