use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::config::ScoringConfig;
use crate::models::{CandidateProfile, MatchResult, Posting, Tier, normalize};

/// Pure compatibility scorer. Weights and tier thresholds come from
/// configuration; identical inputs always produce identical results.
pub struct MatchScorer {
    cfg: ScoringConfig,
}

// Tokens that can appear in skill names: words plus c++/c#/.net style terms.
fn term_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9][a-z0-9+#.\-]*").unwrap())
}

impl MatchScorer {
    pub fn new(cfg: ScoringConfig) -> Self {
        Self { cfg }
    }

    pub fn score(&self, profile: &CandidateProfile, posting: &Posting) -> MatchResult {
        let (skill_overlap, matched_skills) = self.skill_overlap(profile, posting);
        let location_fit = self.location_fit(profile, posting);
        let compensation_fit = self.compensation_fit(profile, posting);

        let w = &self.cfg;
        let total_weight = w.skill_weight + w.location_weight + w.compensation_weight;
        let combined = if total_weight > 0.0 {
            (skill_overlap * w.skill_weight
                + location_fit * w.location_weight
                + compensation_fit * w.compensation_weight)
                / total_weight
        } else {
            0.0
        };
        let score = (combined * 100.0).clamp(0.0, 100.0);

        MatchResult {
            fingerprint: posting.fingerprint(),
            score,
            skill_overlap,
            location_fit,
            compensation_fit,
            tier: self.tier(score),
            matched_skills,
        }
    }

    pub fn tier(&self, score: f64) -> Tier {
        if score >= self.cfg.strong_threshold {
            Tier::Strong
        } else if score >= self.cfg.consider_threshold {
            Tier::Consider
        } else if score >= self.cfg.weak_threshold {
            Tier::Weak
        } else {
            Tier::Reject
        }
    }

    /// Proficiency-weighted overlap between profile skills and terms found in
    /// the posting description. Multi-word skills match as phrases; single
    /// tokens also match near-identical spellings (jaro-winkler).
    fn skill_overlap(&self, profile: &CandidateProfile, posting: &Posting) -> (f64, Vec<String>) {
        if profile.skills.is_empty() {
            return (0.0, Vec::new());
        }
        let haystack = normalize(&format!("{} {}", posting.title, posting.description));
        let terms: HashSet<&str> = term_regex()
            .find_iter(&haystack)
            .map(|m| m.as_str())
            .collect();

        let mut matched = Vec::new();
        let mut matched_weight = 0u32;
        let mut total_weight = 0u32;
        for skill in &profile.skills {
            let weight = u32::from(skill.proficiency.clamp(1, 5));
            total_weight += weight;
            let needle = normalize(&skill.name);
            let hit = if needle.contains(' ') {
                haystack.contains(&needle)
            } else {
                terms.contains(needle.as_str())
                    || terms
                        .iter()
                        .any(|t| strsim::jaro_winkler(t, &needle) >= 0.93)
            };
            if hit {
                matched_weight += weight;
                matched.push(skill.name.clone());
            }
        }
        (f64::from(matched_weight) / f64::from(total_weight), matched)
    }

    /// Exact city 1.0, same region 0.7, remote-compatible 1.0, otherwise 0.0.
    fn location_fit(&self, profile: &CandidateProfile, posting: &Posting) -> f64 {
        let loc = normalize(&posting.location);
        if profile.remote_ok && loc.contains("remote") {
            return 1.0;
        }
        let (post_city, post_region) = split_location(&loc);
        let mut best: f64 = 0.0;
        for desired in &profile.desired_locations {
            let want = normalize(desired);
            if want == loc {
                return 1.0;
            }
            let (want_city, want_region) = split_location(&want);
            if !want_city.is_empty() && want_city == post_city {
                return 1.0;
            }
            if !want_region.is_empty() && want_region == post_region {
                best = best.max(0.7);
            }
        }
        best
    }

    /// 1.0 when the stated range reaches the candidate's minimum, linear
    /// decay below it, 0.5 neutral when the posting states nothing.
    fn compensation_fit(&self, profile: &CandidateProfile, posting: &Posting) -> f64 {
        let Some(range) = posting.compensation else {
            return 0.5;
        };
        let Some(floor) = profile.salary_floor else {
            return 1.0;
        };
        if floor <= 0 || range.max >= floor {
            return 1.0;
        }
        (range.max as f64 / floor as f64).clamp(0.0, 1.0)
    }
}

/// "portland, or" -> ("portland", "or"); a bare name is all city.
fn split_location(loc: &str) -> (&str, &str) {
    match loc.rsplit_once(',') {
        Some((city, region)) => (city.trim(), region.trim()),
        None => (loc.trim(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompensationRange, SkillEntry};
    use chrono::Utc;

    fn profile() -> CandidateProfile {
        CandidateProfile {
            id: "profile-1".into(),
            name: "Sam Doe".into(),
            email: "sam@example.com".into(),
            phone: None,
            skills: vec![
                SkillEntry { name: "Rust".into(), proficiency: 5 },
                SkillEntry { name: "PostgreSQL".into(), proficiency: 3 },
                SkillEntry { name: "incident response".into(), proficiency: 2 },
            ],
            desired_titles: vec!["Platform Engineer".into()],
            desired_locations: vec!["Portland, OR".into()],
            salary_floor: Some(120_000),
            remote_ok: true,
            credentials: Default::default(),
            resume_ref: None,
        }
    }

    fn posting(location: &str, description: &str, comp: Option<CompensationRange>) -> Posting {
        Posting {
            source_id: "feedco".into(),
            external_id: "x".into(),
            url: "https://jobs.example.com/x".into(),
            title: "Platform Engineer".into(),
            organization: "Example Corp".into(),
            location: location.into(),
            compensation: comp,
            description: description.into(),
            discovered_at: Utc::now(),
        }
    }

    fn scorer() -> MatchScorer {
        MatchScorer::new(ScoringConfig::default())
    }

    #[test]
    fn identical_inputs_score_identically() {
        let p = profile();
        let j = posting("Remote", "Rust and PostgreSQL services", None);
        let a = scorer().score(&p, &j);
        let b = scorer().score(&p, &j);
        assert_eq!(a.score, b.score);
        assert_eq!(a.tier, b.tier);
        assert_eq!(a.matched_skills, b.matched_skills);
    }

    #[test]
    fn skill_overlap_weights_by_proficiency() {
        let p = profile();
        // Only rust (weight 5) out of total weight 10.
        let r = scorer().score(&p, &posting("Remote", "We use rust daily.", None));
        assert!((r.skill_overlap - 0.5).abs() < 1e-9);
        assert_eq!(r.matched_skills, vec!["Rust".to_string()]);

        // Multi-word skill matches as a phrase.
        let r = scorer().score(
            &p,
            &posting("Remote", "On-call incident response rotation.", None),
        );
        assert!((r.skill_overlap - 0.2).abs() < 1e-9);
    }

    #[test]
    fn location_tiers() {
        let p = profile();
        let s = scorer();
        assert_eq!(s.score(&p, &posting("Portland, OR", "", None)).location_fit, 1.0);
        assert_eq!(s.score(&p, &posting("Salem, OR", "", None)).location_fit, 0.7);
        assert_eq!(s.score(&p, &posting("Remote (US)", "", None)).location_fit, 1.0);
        assert_eq!(s.score(&p, &posting("Austin, TX", "", None)).location_fit, 0.0);

        let mut onsite = profile();
        onsite.remote_ok = false;
        assert_eq!(s.score(&onsite, &posting("Remote", "", None)).location_fit, 0.0);
    }

    #[test]
    fn compensation_fit_covers_decays_and_neutral() {
        let p = profile();
        let s = scorer();
        let covered = posting("Remote", "", Some(CompensationRange { min: 130_000, max: 170_000 }));
        assert_eq!(s.score(&p, &covered).compensation_fit, 1.0);

        let short = posting("Remote", "", Some(CompensationRange { min: 50_000, max: 60_000 }));
        assert!((s.score(&p, &short).compensation_fit - 0.5).abs() < 1e-9);

        let unstated = posting("Remote", "", None);
        assert_eq!(s.score(&p, &unstated).compensation_fit, 0.5);

        let mut no_floor = profile();
        no_floor.salary_floor = None;
        assert_eq!(s.score(&no_floor, &short).compensation_fit, 1.0);
    }

    #[test]
    fn tiers_follow_configured_thresholds() {
        let s = scorer();
        assert_eq!(s.tier(80.0), Tier::Strong);
        assert_eq!(s.tier(75.0), Tier::Strong);
        assert_eq!(s.tier(60.0), Tier::Consider);
        assert_eq!(s.tier(30.0), Tier::Weak);
        assert_eq!(s.tier(10.0), Tier::Reject);

        let strict = MatchScorer::new(ScoringConfig {
            strong_threshold: 90.0,
            ..ScoringConfig::default()
        });
        assert_eq!(strict.tier(80.0), Tier::Consider);
    }

    #[test]
    fn full_match_scores_high_and_empty_match_low() {
        let p = profile();
        let s = scorer();
        let great = posting(
            "Portland, OR",
            "rust postgresql incident response on a platform team",
            Some(CompensationRange { min: 140_000, max: 180_000 }),
        );
        let r = s.score(&p, &great);
        assert!(r.score > 95.0, "got {}", r.score);
        assert_eq!(r.tier, Tier::Strong);

        let poor = posting("Austin, TX", "enterprise java consulting", None);
        let r = s.score(&p, &poor);
        assert!(r.score < 25.0, "got {}", r.score);
        assert_eq!(r.tier, Tier::Reject);
    }
}
