use anyhow::{Context, Result, bail};
use std::path::Path;

use crate::models::CandidateProfile;

/// Document-intelligence seam: turns a candidate document into a structured
/// profile. Called exactly once, before orchestration begins.
pub trait ProfileSource {
    fn parse_profile(&self, document: &Path) -> Result<CandidateProfile>;
}

/// Reads a profile that the external document-intelligence service already
/// structured as JSON.
pub struct JsonProfileSource;

impl ProfileSource for JsonProfileSource {
    fn parse_profile(&self, document: &Path) -> Result<CandidateProfile> {
        let raw = std::fs::read_to_string(document)
            .with_context(|| format!("Failed to read profile: {}", document.display()))?;
        let profile: CandidateProfile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse profile: {}", document.display()))?;
        if profile.id.trim().is_empty() {
            bail!("Profile is missing an id");
        }
        if profile.skills.is_empty() {
            bail!("Profile '{}' has no skills", profile.id);
        }
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_a_minimal_profile() {
        let f = write_tmp(
            r#"{
                "id": "profile-1",
                "name": "Sam Doe",
                "email": "sam@example.com",
                "skills": [{"name": "Rust", "proficiency": 5}, {"name": "SQL"}]
            }"#,
        );
        let profile = JsonProfileSource.parse_profile(f.path()).unwrap();
        assert_eq!(profile.id, "profile-1");
        assert_eq!(profile.skills.len(), 2);
        // Unstated proficiency gets the middle of the scale.
        assert_eq!(profile.skills[1].proficiency, 3);
        assert!(!profile.remote_ok);
        assert!(profile.credentials.is_empty());
    }

    #[test]
    fn rejects_missing_id_or_empty_skills() {
        let no_id = write_tmp(
            r#"{"id": " ", "name": "x", "email": "x@x", "skills": [{"name": "Rust"}]}"#,
        );
        assert!(JsonProfileSource.parse_profile(no_id.path()).is_err());

        let no_skills = write_tmp(r#"{"id": "p", "name": "x", "email": "x@x", "skills": []}"#);
        assert!(JsonProfileSource.parse_profile(no_skills.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(
            JsonProfileSource
                .parse_profile(Path::new("/nonexistent/profile.json"))
                .is_err()
        );
    }
}
