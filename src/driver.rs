use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::PacingConfig;
use crate::models::ErrorKind;

// --- Classified driver errors ---

/// Every automation failure is classified before it reaches the state
/// machine; the core never inspects raw webdriver internals.
#[derive(Debug, Clone)]
pub enum DriveError {
    Transient(String),
    RateLimited(String),
    Auth(String),
    Challenge(String),
    SchemaMismatch(String),
    Unavailable(String),
    Cancelled,
}

impl DriveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriveError::Transient(_) => ErrorKind::TransientNetwork,
            DriveError::RateLimited(_) => ErrorKind::RateLimited,
            DriveError::Auth(_) => ErrorKind::AuthFailure,
            DriveError::Challenge(_) => ErrorKind::ChallengeRequired,
            DriveError::SchemaMismatch(_) => ErrorKind::FormSchemaMismatch,
            DriveError::Unavailable(_) => ErrorKind::SourceUnavailable,
            DriveError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for DriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveError::Transient(m) => write!(f, "transient: {m}"),
            DriveError::RateLimited(m) => write!(f, "rate limited: {m}"),
            DriveError::Auth(m) => write!(f, "auth failure: {m}"),
            DriveError::Challenge(m) => write!(f, "challenge required: {m}"),
            DriveError::SchemaMismatch(m) => write!(f, "form schema mismatch: {m}"),
            DriveError::Unavailable(m) => write!(f, "source unavailable: {m}"),
            DriveError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for DriveError {}

#[derive(Debug, Clone)]
pub struct Confirmation {
    pub confirmation_id: String,
    pub screenshot: Option<String>,
}

// --- Driver capability ---

/// Browser-session abstraction the submission worker drives. One session per
/// attempt; sessions are never shared across workers or attempts.
#[async_trait]
pub trait AutomationDriver: Send {
    async fn open(&mut self, url: &str) -> Result<(), DriveError>;
    async fn locate_apply_entry(&mut self) -> Result<(), DriveError>;
    async fn fill_field(&mut self, selector_hint: &str, value: &str) -> Result<(), DriveError>;
    async fn upload_document(&mut self, field_hint: &str, document_ref: &str)
    -> Result<(), DriveError>;
    async fn submit(&mut self) -> Result<(), DriveError>;
    async fn capture_confirmation(&mut self) -> Result<Confirmation, DriveError>;
    /// Releases the underlying session. Always called, success or failure.
    async fn close(self: Box<Self>);
}

/// Hands out a fresh driver session per attempt.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn session(&self) -> Result<Box<dyn AutomationDriver>, DriveError>;
}

// --- Interaction pacing ---

/// Randomized delay between operations, injected as policy rather than baked
/// into the state machine.
#[derive(Debug, Clone, Copy)]
pub struct InteractionPacing {
    min: Duration,
    max: Duration,
}

impl InteractionPacing {
    pub fn new(cfg: &PacingConfig) -> Self {
        Self {
            min: Duration::from_millis(cfg.min_ms),
            max: Duration::from_millis(cfg.max_ms.max(cfg.min_ms)),
        }
    }

    pub fn delay(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let span = (self.max - self.min).as_millis() as u64;
        self.min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
    }

    pub async fn pause(&self) {
        tokio::time::sleep(self.delay()).await;
    }
}

// --- WebDriver-backed implementation ---

pub struct WebDriverFactory {
    server_url: String,
    pacing: InteractionPacing,
    screenshot_dir: PathBuf,
}

impl WebDriverFactory {
    pub fn new(server_url: String, pacing: InteractionPacing, screenshot_dir: PathBuf) -> Self {
        Self {
            server_url,
            pacing,
            screenshot_dir,
        }
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn session(&self) -> Result<Box<dyn AutomationDriver>, DriveError> {
        use thirtyfour::prelude::*;
        let caps = DesiredCapabilities::chrome();
        let driver = WebDriver::new(&self.server_url, caps)
            .await
            .map_err(|e| DriveError::Unavailable(format!("webdriver session: {e}")))?;
        Ok(Box::new(WebDriverSession {
            driver,
            pacing: self.pacing,
            screenshot_dir: self.screenshot_dir.clone(),
        }))
    }
}

struct WebDriverSession {
    driver: thirtyfour::WebDriver,
    pacing: InteractionPacing,
    screenshot_dir: PathBuf,
}

const APPLY_ENTRY_SELECTORS: &[&str] = &[
    "button[data-test='apply-button']",
    "a[data-test='apply-button']",
    "button.jobs-apply-button",
    "a.apply-button",
    "button[aria-label*='Apply']",
    "a[href*='apply']",
];

const CHALLENGE_SELECTORS: &[&str] = &[
    "iframe[src*='captcha']",
    ".g-recaptcha",
    "#captcha",
    "[data-test='challenge']",
];

const CONFIRMATION_SELECTORS: &[&str] = &[
    "[data-test='application-confirmation']",
    ".application-confirmation",
    ".post-apply-confirmation",
    "h1.confirmation",
];

impl WebDriverSession {
    fn classify(err: thirtyfour::error::WebDriverError) -> DriveError {
        let text = err.to_string();
        let lower = text.to_lowercase();
        if lower.contains("no such element") || lower.contains("unable to locate") {
            DriveError::SchemaMismatch(text)
        } else if lower.contains("429") || lower.contains("too many requests") {
            DriveError::RateLimited(text)
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
        {
            DriveError::Auth(text)
        } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("connection") {
            DriveError::Transient(text)
        } else {
            DriveError::Unavailable(text)
        }
    }

    async fn find_first(
        &self,
        selectors: &[&str],
    ) -> Result<Option<thirtyfour::WebElement>, DriveError> {
        use thirtyfour::By;
        for selector in selectors {
            if let Ok(element) = self.driver.find(By::Css(*selector)).await {
                return Ok(Some(element));
            }
        }
        Ok(None)
    }

    async fn challenge_present(&self) -> bool {
        matches!(self.find_first(CHALLENGE_SELECTORS).await, Ok(Some(_)))
    }
}

#[async_trait]
impl AutomationDriver for WebDriverSession {
    async fn open(&mut self, url: &str) -> Result<(), DriveError> {
        self.driver.goto(url).await.map_err(Self::classify)?;
        self.pacing.pause().await;
        if self.challenge_present().await {
            return Err(DriveError::Challenge("challenge on landing page".into()));
        }
        Ok(())
    }

    async fn locate_apply_entry(&mut self) -> Result<(), DriveError> {
        let Some(entry) = self.find_first(APPLY_ENTRY_SELECTORS).await? else {
            return Err(DriveError::SchemaMismatch("no apply entry point".into()));
        };
        entry.click().await.map_err(Self::classify)?;
        self.pacing.pause().await;
        if self.challenge_present().await {
            return Err(DriveError::Challenge("challenge after apply click".into()));
        }
        Ok(())
    }

    async fn fill_field(&mut self, selector_hint: &str, value: &str) -> Result<(), DriveError> {
        use thirtyfour::By;
        let field = self
            .driver
            .find(By::Css(selector_hint))
            .await
            .map_err(Self::classify)?;
        field.clear().await.map_err(Self::classify)?;
        field.send_keys(value).await.map_err(Self::classify)?;
        self.pacing.pause().await;
        Ok(())
    }

    async fn upload_document(
        &mut self,
        field_hint: &str,
        document_ref: &str,
    ) -> Result<(), DriveError> {
        use thirtyfour::By;
        let input = self
            .driver
            .find(By::Css(field_hint))
            .await
            .map_err(Self::classify)?;
        // File inputs take the path as keys.
        input.send_keys(document_ref).await.map_err(Self::classify)?;
        self.pacing.pause().await;
        Ok(())
    }

    async fn submit(&mut self) -> Result<(), DriveError> {
        use thirtyfour::By;
        let button = self
            .driver
            .find(By::Css("button[type='submit'], input[type='submit']"))
            .await
            .map_err(Self::classify)?;
        button.click().await.map_err(Self::classify)?;
        self.pacing.pause().await;
        if self.challenge_present().await {
            return Err(DriveError::Challenge("challenge on submit".into()));
        }
        Ok(())
    }

    async fn capture_confirmation(&mut self) -> Result<Confirmation, DriveError> {
        let Some(element) = self.find_first(CONFIRMATION_SELECTORS).await? else {
            return Err(DriveError::SchemaMismatch("no confirmation element".into()));
        };
        let text = element.text().await.map_err(Self::classify)?;
        let confirmation_id = text.lines().next().unwrap_or("confirmed").trim().to_string();

        let screenshot = {
            let name = format!("confirmation-{}.png", chrono::Utc::now().timestamp_millis());
            let path = self.screenshot_dir.join(name);
            if std::fs::create_dir_all(&self.screenshot_dir).is_ok()
                && self.driver.screenshot(&path).await.is_ok()
            {
                Some(path.to_string_lossy().into_owned())
            } else {
                None
            }
        };

        Ok(Confirmation {
            confirmation_id,
            screenshot,
        })
    }

    async fn close(self: Box<Self>) {
        let _ = self.driver.quit().await;
    }
}

// --- Test doubles ---


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_errors_map_onto_the_taxonomy() {
        assert_eq!(
            DriveError::Transient("x".into()).kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(
            DriveError::RateLimited("x".into()).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(DriveError::Auth("x".into()).kind(), ErrorKind::AuthFailure);
        assert_eq!(
            DriveError::Challenge("x".into()).kind(),
            ErrorKind::ChallengeRequired
        );
        assert_eq!(
            DriveError::SchemaMismatch("x".into()).kind(),
            ErrorKind::FormSchemaMismatch
        );
        assert_eq!(
            DriveError::Unavailable("x".into()).kind(),
            ErrorKind::SourceUnavailable
        );
        assert_eq!(DriveError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn pacing_delay_stays_in_range() {
        let pacing = InteractionPacing::new(&PacingConfig {
            min_ms: 10,
            max_ms: 50,
        });
        for _ in 0..100 {
            let d = pacing.delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(50));
        }
    }

    #[test]
    fn degenerate_pacing_range_is_fixed() {
        let pacing = InteractionPacing::new(&PacingConfig {
            min_ms: 25,
            max_ms: 25,
        });
        assert_eq!(pacing.delay(), Duration::from_millis(25));
    }
}
