use chrono::{FixedOffset, NaiveDate, Utc};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::warn;

use crate::config::RateConfig;
use crate::ledger::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    /// Bucket empty; tokens are refilling.
    Throttled,
    /// Daily cap reached; nothing until the reset boundary.
    CapExhausted,
}

/// Per-source token bucket plus an independent daily submission cap.
///
/// Tokens refill continuously and smooth bursts; the daily counter is a hard
/// ceiling that resets at midnight at the configured UTC offset. `try_acquire`
/// never blocks; a denied caller requeues with backoff.
///
/// With a ledger attached, the daily counter is read back on first touch and
/// written on every grant, so a restart mid-day cannot exceed the cap.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    daily_caps: HashMap<String, u32>,
    default_daily_cap: u32,
    reset_offset: FixedOffset,
    buckets: Mutex<HashMap<String, Bucket>>,
    ledger: Option<Arc<Ledger>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    daily_used: u32,
    day: NaiveDate,
}

impl RateLimiter {
    pub fn new(cfg: &RateConfig, daily_caps: HashMap<String, u32>) -> Self {
        let offset = FixedOffset::east_opt(cfg.daily_reset_utc_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
        Self {
            capacity: cfg.bucket_capacity.max(1.0),
            refill_per_sec: cfg.refill_per_sec.max(0.0),
            daily_caps,
            default_daily_cap: cfg.default_daily_cap,
            reset_offset: offset,
            buckets: Mutex::new(HashMap::new()),
            ledger: None,
        }
    }

    /// Backs the daily counters with the ledger.
    pub fn with_ledger(mut self, ledger: Arc<Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Non-blocking. Consumes one token iff both the bucket and the daily cap
    /// allow it.
    pub fn try_acquire(&self, source_id: &str) -> bool {
        self.acquire(source_id) == Acquire::Granted
    }

    /// Like `try_acquire`, but tells the caller which gate said no: a
    /// throttled source is worth a short requeue, an exhausted daily cap is
    /// not coming back until the reset boundary.
    pub fn acquire(&self, source_id: &str) -> Acquire {
        let today = Utc::now().with_timezone(&self.reset_offset).date_naive();
        self.acquire_at(source_id, Instant::now(), today)
    }

    fn daily_cap(&self, source_id: &str) -> u32 {
        self.daily_caps
            .get(source_id)
            .copied()
            .unwrap_or(self.default_daily_cap)
    }

    pub(crate) fn try_acquire_at(&self, source_id: &str, now: Instant, today: NaiveDate) -> bool {
        self.acquire_at(source_id, now, today) == Acquire::Granted
    }

    pub(crate) fn acquire_at(&self, source_id: &str, now: Instant, today: NaiveDate) -> Acquire {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = match buckets.entry(source_id.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => v.insert(Bucket {
                tokens: self.capacity,
                last_refill: now,
                daily_used: self.load_daily(source_id, today),
                day: today,
            }),
        };

        if bucket.day != today {
            bucket.day = today;
            bucket.daily_used = self.load_daily(source_id, today);
        }

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.daily_used >= self.daily_cap(source_id) {
            return Acquire::CapExhausted;
        }
        if bucket.tokens < 1.0 {
            return Acquire::Throttled;
        }
        bucket.tokens -= 1.0;
        bucket.daily_used += 1;
        let used = bucket.daily_used;
        self.persist_daily(source_id, today, used);
        Acquire::Granted
    }

    fn load_daily(&self, source_id: &str, day: NaiveDate) -> u32 {
        match &self.ledger {
            Some(ledger) => ledger.daily_counter(source_id, day).unwrap_or_else(|e| {
                warn!(source = source_id, error = %e, "failed to load daily counter");
                0
            }),
            None => 0,
        }
    }

    fn persist_daily(&self, source_id: &str, day: NaiveDate, used: u32) {
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.set_daily_counter(source_id, day, used) {
                warn!(source = source_id, error = %e, "failed to persist daily counter");
            }
        }
    }

    /// Remaining daily headroom, for reporting.
    pub fn daily_remaining(&self, source_id: &str) -> u32 {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let used = buckets.get(source_id).map(|b| b.daily_used).unwrap_or(0);
        self.daily_cap(source_id).saturating_sub(used)
    }
}
