use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::SearchCriteria;

/// Session input: everything one orchestration run needs, loaded from a JSON
/// file passed to `jobpilot run`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Structured candidate profile document.
    pub profile_path: PathBuf,
    /// Sources to pull postings from. At least one is required.
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub search: SearchCriteria,
    /// Records scoring below this are created as skipped and never queued.
    #[serde(default = "default_score_floor")]
    pub score_floor: f64,
    #[serde(default = "default_max_per_session")]
    pub max_applications_per_session: usize,
    #[serde(default = "default_workers")]
    pub worker_pool_size: usize,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    /// WebDriver endpoint for the live automation driver.
    #[serde(default)]
    pub webdriver_url: Option<String>,
    /// Where session reports and ledger exports land.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Overrides the default ledger location.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    /// JSON feed endpoint consumed by the HTTP adapter.
    pub feed_url: String,
    #[serde(default = "default_true")]
    pub supports_direct_apply: bool,
    /// Per-source daily submission cap; falls back to `rate.default_daily_cap`.
    #[serde(default)]
    pub daily_cap: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_skill_weight")]
    pub skill_weight: f64,
    #[serde(default = "default_location_weight")]
    pub location_weight: f64,
    #[serde(default = "default_compensation_weight")]
    pub compensation_weight: f64,
    /// Tier thresholds on the final [0, 100] score.
    #[serde(default = "default_strong")]
    pub strong_threshold: f64,
    #[serde(default = "default_consider")]
    pub consider_threshold: f64,
    #[serde(default = "default_weak")]
    pub weak_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            skill_weight: default_skill_weight(),
            location_weight: default_location_weight(),
            compensation_weight: default_compensation_weight(),
            strong_threshold: default_strong(),
            consider_threshold: default_consider(),
            weak_threshold: default_weak(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateConfig {
    /// Token bucket burst capacity per source.
    #[serde(default = "default_capacity")]
    pub bucket_capacity: f64,
    /// Continuous refill, tokens per second.
    #[serde(default = "default_refill")]
    pub refill_per_sec: f64,
    #[serde(default = "default_daily_cap")]
    pub default_daily_cap: u32,
    /// The daily cap resets at midnight at this fixed UTC offset.
    #[serde(default)]
    pub daily_reset_utc_offset_hours: i32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: default_capacity(),
            refill_per_sec: default_refill(),
            default_daily_cap: default_daily_cap(),
            daily_reset_utc_offset_hours: 0,
        }
    }
}

impl RateConfig {
    /// Per-source caps, with config-file overrides applied.
    pub fn daily_caps(&self, sources: &[SourceConfig]) -> HashMap<String, u32> {
        sources
            .iter()
            .map(|s| (s.id.clone(), s.daily_cap.unwrap_or(self.default_daily_cap)))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Upper bound on the doubled cool-down.
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Randomized delay between automation operations and between applications,
/// injected into the driver rather than hard-coded in the state machine.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_pacing_min_ms")]
    pub min_ms: u64,
    #[serde(default = "default_pacing_max_ms")]
    pub max_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_ms: default_pacing_min_ms(),
            max_ms: default_pacing_max_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_score_floor() -> f64 {
    50.0
}
fn default_max_per_session() -> usize {
    20
}
fn default_workers() -> usize {
    2
}
fn default_skill_weight() -> f64 {
    0.5
}
fn default_location_weight() -> f64 {
    0.3
}
fn default_compensation_weight() -> f64 {
    0.2
}
fn default_strong() -> f64 {
    75.0
}
fn default_consider() -> f64 {
    50.0
}
fn default_weak() -> f64 {
    25.0
}
fn default_capacity() -> f64 {
    5.0
}
fn default_refill() -> f64 {
    0.1
}
fn default_daily_cap() -> u32 {
    20
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_max_cooldown_secs() -> u64 {
    3600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_pacing_min_ms() -> u64 {
    500
}
fn default_pacing_max_ms() -> u64 {
    2000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("sessions")
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let cfg: SessionConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Configuration-level failures abort the session before it starts.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("No sources configured");
        }
        if self.worker_pool_size == 0 {
            bail!("worker_pool_size must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.pacing.min_ms > self.pacing.max_ms {
            bail!("pacing.min_ms must not exceed pacing.max_ms");
        }
        let mut seen = std::collections::HashSet::new();
        for s in &self.sources {
            if !seen.insert(s.id.as_str()) {
                bail!("Duplicate source id: {}", s.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        r#"{
            "profile_path": "profile.json",
            "sources": [
                {"id": "feedco", "feed_url": "https://feedco.example.com/jobs"}
            ]
        }"#
        .to_string()
    }

    #[test]
    fn defaults_fill_in_everything_optional() {
        let cfg: SessionConfig = serde_json::from_str(&minimal_json()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.score_floor, 50.0);
        assert_eq!(cfg.worker_pool_size, 2);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.rate.default_daily_cap, 20);
        assert!(cfg.sources[0].supports_direct_apply);
    }

    #[test]
    fn zero_sources_is_a_config_error() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"profile_path": "p.json", "sources": []}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_source_ids_rejected() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{
                "profile_path": "p.json",
                "sources": [
                    {"id": "a", "feed_url": "https://a.example.com"},
                    {"id": "a", "feed_url": "https://b.example.com"}
                ]
            }"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn per_source_daily_cap_overrides_default() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{
                "profile_path": "p.json",
                "sources": [
                    {"id": "a", "feed_url": "https://a.example.com", "daily_cap": 3},
                    {"id": "b", "feed_url": "https://b.example.com"}
                ]
            }"#,
        )
        .unwrap();
        let caps = cfg.rate.daily_caps(&cfg.sources);
        assert_eq!(caps["a"], 3);
        assert_eq!(caps["b"], 20);
    }
}
