use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// --- Candidate profile ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEntry {
    pub name: String,
    /// 1 (familiar) to 5 (expert).
    #[serde(default = "default_proficiency")]
    pub proficiency: u8,
}

fn default_proficiency() -> u8 {
    3
}

/// Immutable snapshot of one candidate, produced by the document-intelligence
/// collaborator once per session. Credential values are opaque handles, never
/// raw secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub skills: Vec<SkillEntry>,
    #[serde(default)]
    pub desired_titles: Vec<String>,
    #[serde(default)]
    pub desired_locations: Vec<String>,
    #[serde(default)]
    pub salary_floor: Option<i64>,
    #[serde(default)]
    pub remote_ok: bool,
    /// source id -> opaque credential handle
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    /// Handle to the resume document uploaded during submission.
    #[serde(default)]
    pub resume_ref: Option<String>,
}

// --- Postings ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompensationRange {
    pub min: i64,
    pub max: i64,
}

/// One discovered opportunity. Immutable once created; the fingerprint is the
/// dedup key across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub source_id: String,
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub organization: String,
    pub location: String,
    #[serde(default)]
    pub compensation: Option<CompensationRange>,
    pub description: String,
    pub discovered_at: DateTime<Utc>,
}

impl Posting {
    /// Stable content hash over title, organization, location and the
    /// normalized description. Deterministic across runs and sessions.
    pub fn fingerprint(&self) -> String {
        let key = format!(
            "{}|{}|{}|{}",
            normalize(&self.title),
            normalize(&self.organization),
            normalize(&self.location),
            normalize(&self.description),
        );
        format!("{:016x}", fnv1a64(key.as_bytes()))
    }
}

/// Lowercase, collapse runs of whitespace to a single space, trim.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            for lc in ch.to_lowercase() {
                out.push(lc);
            }
            last_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// --- Match results ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Strong,
    Consider,
    Weak,
    Reject,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Strong => "strong",
            Tier::Consider => "consider",
            Tier::Weak => "weak",
            Tier::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strong" => Some(Tier::Strong),
            "consider" => Some(Tier::Consider),
            "weak" => Some(Tier::Weak),
            "reject" => Some(Tier::Reject),
            _ => None,
        }
    }
}

/// Derived per (profile, posting) pair, recomputed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub fingerprint: String,
    /// Final score in [0, 100].
    pub score: f64,
    pub skill_overlap: f64,
    pub location_fit: f64,
    pub compensation_fit: f64,
    pub tier: Tier,
    pub matched_skills: Vec<String>,
}

// --- Application lifecycle ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    Discovered,
    Scored,
    Queued,
    InProgress,
    Submitted,
    Failed,
    Skipped,
    NeedsReview,
}

impl ApplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationState::Discovered => "discovered",
            ApplicationState::Scored => "scored",
            ApplicationState::Queued => "queued",
            ApplicationState::InProgress => "in_progress",
            ApplicationState::Submitted => "submitted",
            ApplicationState::Failed => "failed",
            ApplicationState::Skipped => "skipped",
            ApplicationState::NeedsReview => "needs_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(ApplicationState::Discovered),
            "scored" => Some(ApplicationState::Scored),
            "queued" => Some(ApplicationState::Queued),
            "in_progress" => Some(ApplicationState::InProgress),
            "submitted" => Some(ApplicationState::Submitted),
            "failed" => Some(ApplicationState::Failed),
            "skipped" => Some(ApplicationState::Skipped),
            "needs_review" => Some(ApplicationState::NeedsReview),
            _ => None,
        }
    }

    /// Legal edges of the application state graph. `Failed -> Queued` is the
    /// explicit retry-reset, `InProgress -> Queued` is the no-penalty requeue
    /// (gate denial mid-attempt, crash recovery), `Scored -> NeedsReview` is
    /// for sources with no direct-apply support; everything else is
    /// forward-only.
    pub fn allows(&self, next: ApplicationState) -> bool {
        use ApplicationState::*;
        matches!(
            (self, next),
            (Discovered, Scored)
                | (Scored, Queued)
                | (Scored, Skipped)
                | (Scored, NeedsReview)
                | (Queued, InProgress)
                | (InProgress, Submitted)
                | (InProgress, Failed)
                | (InProgress, NeedsReview)
                | (InProgress, Queued)
                | (Failed, Queued)
        )
    }

    /// States with no outgoing edges at all.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationState::Submitted
                | ApplicationState::Skipped
                | ApplicationState::NeedsReview
        )
    }
}

// --- Error taxonomy ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    AuthFailure,
    ChallengeRequired,
    FormSchemaMismatch,
    SourceUnavailable,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::ChallengeRequired => "challenge_required",
            ErrorKind::FormSchemaMismatch => "form_schema_mismatch",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient_network" => Some(ErrorKind::TransientNetwork),
            "rate_limited" => Some(ErrorKind::RateLimited),
            "auth_failure" => Some(ErrorKind::AuthFailure),
            "challenge_required" => Some(ErrorKind::ChallengeRequired),
            "form_schema_mismatch" => Some(ErrorKind::FormSchemaMismatch),
            "source_unavailable" => Some(ErrorKind::SourceUnavailable),
            "cancelled" => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }

    /// Only these kinds are ever retried automatically.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientNetwork | ErrorKind::RateLimited)
    }

    /// Failures that require human input and must never be retried.
    pub fn needs_review(&self) -> bool {
        matches!(self, ErrorKind::AuthFailure | ErrorKind::ChallengeRequired)
    }
}

// --- Application records ---

/// The mutable unit of work; one per (profile, posting) pair, keyed by
/// (profile id, posting fingerprint). Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: i64,
    pub profile_id: String,
    pub fingerprint: String,
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub organization: String,
    pub score: f64,
    pub tier: Tier,
    pub state: ApplicationState,
    pub attempts: u32,
    pub last_error: Option<ErrorKind>,
    pub confirmation_id: Option<String>,
    pub screenshot: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// --- Search criteria ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchCriteria {
    #[serde(default)]
    pub titles: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub salary_floor: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posting() -> Posting {
        Posting {
            source_id: "feedco".into(),
            external_id: "j-100".into(),
            url: "https://jobs.example.com/j-100".into(),
            title: "Platform Engineer".into(),
            organization: "Example Corp".into(),
            location: "Portland, OR".into(),
            compensation: None,
            description: "Build and run the platform.".into(),
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_is_stable_and_whitespace_insensitive() {
        let a = posting();
        let mut b = posting();
        b.title = "  Platform   Engineer ".into();
        b.description = "Build and  run the\nplatform.".into();
        // Different external id / url / timestamp do not affect the key.
        b.external_id = "other".into();
        b.url = "https://elsewhere.example.com".into();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = posting();
        c.organization = "Other Corp".into();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn state_graph_edges() {
        use ApplicationState::*;
        assert!(Discovered.allows(Scored));
        assert!(Scored.allows(Queued));
        assert!(Scored.allows(Skipped));
        assert!(Scored.allows(NeedsReview));
        assert!(Queued.allows(InProgress));
        assert!(InProgress.allows(Submitted));
        assert!(InProgress.allows(Failed));
        assert!(InProgress.allows(NeedsReview));
        assert!(InProgress.allows(Queued));
        assert!(Failed.allows(Queued));

        // No backward or skipping edges.
        assert!(!Scored.allows(Discovered));
        assert!(!Discovered.allows(Queued));
        assert!(!Queued.allows(Submitted));
        assert!(!Submitted.allows(Queued));
        assert!(!Skipped.allows(Queued));
        assert!(!NeedsReview.allows(Queued));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use ApplicationState::*;
        let all = [
            Discovered, Scored, Queued, InProgress, Submitted, Failed, Skipped, NeedsReview,
        ];
        for s in [Submitted, Skipped, NeedsReview] {
            assert!(s.is_terminal());
            for next in all {
                assert!(!s.allows(next), "{:?} -> {:?} should be illegal", s, next);
            }
        }
    }

    #[test]
    fn error_kind_policies() {
        assert!(ErrorKind::TransientNetwork.retryable());
        assert!(ErrorKind::RateLimited.retryable());
        assert!(!ErrorKind::ChallengeRequired.retryable());
        assert!(ErrorKind::ChallengeRequired.needs_review());
        assert!(ErrorKind::AuthFailure.needs_review());
        assert!(!ErrorKind::SourceUnavailable.needs_review());
    }

    #[test]
    fn state_round_trips_through_storage_form() {
        use ApplicationState::*;
        for s in [
            Discovered, Scored, Queued, InProgress, Submitted, Failed, Skipped, NeedsReview,
        ] {
            assert_eq!(ApplicationState::parse(s.as_str()), Some(s));
        }
        assert_eq!(ApplicationState::parse("bogus"), None);
    }
}
