use anyhow::Result;
use std::sync::Arc;

use crate::ledger::Ledger;
use crate::models::Posting;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    New,
    Duplicate,
}

/// Content-addressed index over posting fingerprints. Registration is an
/// atomic insert-if-absent against the ledger, so concurrent adapters racing
/// on the same fingerprint see exactly one `New`.
pub struct Deduplicator {
    ledger: Arc<Ledger>,
}

impl Deduplicator {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Exact fingerprint match, across sessions. No side effects on a
    /// duplicate.
    pub fn register(&self, posting: &Posting) -> Result<RegisterOutcome> {
        let fingerprint = posting.fingerprint();
        if self.ledger.register_fingerprint(&fingerprint, &posting.source_id)? {
            Ok(RegisterOutcome::New)
        } else {
            Ok(RegisterOutcome::Duplicate)
        }
    }
}
