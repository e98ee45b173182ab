//! Browser driver interface and the HTTP-backed driver.
//!
//! A driver opens one context per job; the context is the worker's only
//! handle on the page. Every suspension point goes through [`guarded`], which
//! races the operation against its timeout and the job's cancel token.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::artifacts::ArtifactKind;
use super::state::TaskStep;
use crate::error::DriverError;

/// Opens browser contexts bound to a profile.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_context(&self, profile: &str) -> Result<Box<dyn BrowserContext>, DriverError>;
}

/// A single live browser context (one tab's worth of state).
#[async_trait]
pub trait BrowserContext: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

    /// Run a locator-bearing step against `locator`. Returns the extracted
    /// value for `Extract` steps.
    async fn perform(&mut self, step: &TaskStep, locator: &str) -> Result<Option<String>, DriverError>;

    fn current_url(&self) -> Option<String>;

    /// Name of a gate only a human can pass (challenge screen), if one is showing.
    async fn detect_gate(&mut self) -> Result<Option<String>, DriverError>;

    /// Dismiss known interstitials (cookie banners, modals). Returns what was dismissed.
    async fn dismiss_interstitials(&mut self) -> Result<Vec<String>, DriverError>;

    async fn reload(&mut self) -> Result<(), DriverError>;

    async fn capture(&mut self, kind: ArtifactKind) -> Result<String, DriverError>;

    async fn close(&mut self);
}

/// Deadlines applied to driver calls.
#[derive(Debug, Clone, Copy)]
pub struct StepLimits {
    pub step: Duration,
    pub navigation: Duration,
}

/// Race `fut` against `timeout` and `cancel`.
pub async fn guarded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    operation: &str,
    fut: F,
) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DriverError::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(r) => r,
            Err(_) => Err(DriverError::Timeout {
                operation: operation.to_string(),
                timeout,
            }),
        },
    }
}

/// Execute one plan step. `locator` overrides the step's primary locator.
pub async fn execute_step(
    ctx: &mut dyn BrowserContext,
    step: &TaskStep,
    locator: Option<&str>,
    limits: StepLimits,
    cancel: &CancellationToken,
) -> Result<Option<String>, DriverError> {
    match step {
        TaskStep::Navigate { url } => guarded(cancel, limits.navigation, "navigate", ctx.navigate(url))
            .await
            .map(|()| None),
        TaskStep::HumanGate { .. } => Ok(None),
        _ => {
            let Some(locator) = locator.or_else(|| step.locator().map(|l| l.primary.as_str())) else {
                return Err(DriverError::Other(format!("{} step has no locator", step.name())));
            };
            guarded(cancel, limits.step, step.name(), ctx.perform(step, locator)).await
        }
    }
}

// ── HTTP driver ─────────────────────────────────────────────────────

/// A named page pattern.
#[derive(Debug, Clone)]
struct NamedPattern {
    name: String,
    regex: Regex,
}

fn compile(name: &str, pattern: &str) -> Result<NamedPattern, DriverError> {
    Regex::new(pattern)
        .map(|regex| NamedPattern {
            name: name.to_string(),
            regex,
        })
        .map_err(|e| DriverError::Other(format!("bad {name} pattern: {e}")))
}

#[derive(Debug)]
struct PagePatterns {
    interstitials: Vec<NamedPattern>,
    challenges: Vec<NamedPattern>,
}

/// Driver that fetches pages over HTTP and treats locators as regexes over
/// the returned HTML. Suits extraction and link-following tasks; it cannot
/// render, so screenshots are unsupported.
pub struct HttpDriver {
    client: reqwest::Client,
    patterns: Arc<PagePatterns>,
}

impl HttpDriver {
    pub fn new() -> Result<Self, DriverError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("outreach-dispatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DriverError::Other(format!("http client: {e}")))?;

        let patterns = PagePatterns {
            interstitials: vec![
                compile(
                    "cookie_banner",
                    r#"(?is)<div[^>]*(?:cookie|consent)[^>]*>.*?</div>"#,
                )?,
                compile(
                    "newsletter_modal",
                    r#"(?is)<div[^>]*(?:newsletter|modal-overlay)[^>]*>.*?</div>"#,
                )?,
            ],
            challenges: vec![
                compile("captcha", r"(?i)g-recaptcha|h-captcha|cf-challenge")?,
                compile("human_verification", r"(?i)verify (?:that )?you are (?:a )?human")?,
            ],
        };

        Ok(Self {
            client,
            patterns: Arc::new(patterns),
        })
    }
}

#[async_trait]
impl BrowserDriver for HttpDriver {
    async fn open_context(&self, profile: &str) -> Result<Box<dyn BrowserContext>, DriverError> {
        Ok(Box::new(HttpContext::new(
            self.client.clone(),
            profile,
            Arc::clone(&self.patterns),
        )))
    }
}

struct HttpContext {
    client: reqwest::Client,
    profile: String,
    patterns: Arc<PagePatterns>,
    url: Option<reqwest::Url>,
    html: String,
    form: BTreeMap<String, String>,
    trace: Vec<String>,
    network: Vec<String>,
}

impl HttpContext {
    fn new(client: reqwest::Client, profile: &str, patterns: Arc<PagePatterns>) -> Self {
        Self {
            client,
            profile: profile.to_string(),
            patterns,
            url: None,
            html: String::new(),
            form: BTreeMap::new(),
            trace: Vec::new(),
            network: Vec::new(),
        }
    }

    async fn fetch(&mut self, url: reqwest::Url) -> Result<(), DriverError> {
        let nav_err = |reason: String| DriverError::Navigation {
            url: url.to_string(),
            reason,
        };

        let resp = self.client.get(url.clone()).send().await.map_err(|e| {
            self.network.push(format!("GET {url} -> error: {e}"));
            nav_err(e.to_string())
        })?;

        let status = resp.status();
        self.network.push(format!("GET {url} -> {status}"));
        if !status.is_success() {
            return Err(nav_err(format!("HTTP {status}")));
        }

        let final_url = resp.url().clone();
        self.html = resp.text().await.map_err(|e| nav_err(e.to_string()))?;
        self.trace.push(format!("[{}] loaded {final_url}", self.profile));
        self.url = Some(final_url);
        self.form.clear();
        Ok(())
    }
}

#[async_trait]
impl BrowserContext for HttpContext {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| DriverError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        self.fetch(parsed).await
    }

    async fn perform(&mut self, step: &TaskStep, locator: &str) -> Result<Option<String>, DriverError> {
        let selector_err = |reason: &str| DriverError::Selector {
            locator: locator.to_string(),
            reason: reason.to_string(),
        };

        let regex = Regex::new(locator).map_err(|e| selector_err(&e.to_string()))?;
        let value = {
            let caps = regex
                .captures(&self.html)
                .ok_or_else(|| selector_err("no match"))?;
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default()
        };
        self.trace.push(format!("{} {locator:?} matched", step.name()));

        match step {
            TaskStep::Extract { .. } => Ok(Some(value)),
            TaskStep::Fill { value: input, .. } => {
                self.form.insert(value, input.clone());
                Ok(None)
            }
            TaskStep::Click { .. } => {
                // Following the matched href is the only click an HTTP page supports.
                let target = self.url.as_ref().and_then(|base| base.join(&value).ok());
                match target {
                    Some(url) => self.fetch(url).await.map(|()| None),
                    None => Ok(None),
                }
            }
            TaskStep::WaitFor { .. } | TaskStep::Navigate { .. } | TaskStep::HumanGate { .. } => Ok(None),
        }
    }

    fn current_url(&self) -> Option<String> {
        self.url.as_ref().map(|u| u.to_string())
    }

    async fn detect_gate(&mut self) -> Result<Option<String>, DriverError> {
        Ok(self
            .patterns
            .challenges
            .iter()
            .find(|p| p.regex.is_match(&self.html))
            .map(|p| p.name.clone()))
    }

    async fn dismiss_interstitials(&mut self) -> Result<Vec<String>, DriverError> {
        let mut dismissed = Vec::new();
        for pattern in &self.patterns.interstitials {
            if pattern.regex.is_match(&self.html) {
                self.html = pattern.regex.replace_all(&self.html, "").into_owned();
                dismissed.push(pattern.name.clone());
            }
        }
        if !dismissed.is_empty() {
            self.trace.push(format!("dismissed {}", dismissed.join(", ")));
        }
        Ok(dismissed)
    }

    async fn reload(&mut self) -> Result<(), DriverError> {
        let url = self.url.clone().ok_or_else(|| DriverError::Navigation {
            url: String::new(),
            reason: "nothing loaded to reload".into(),
        })?;
        self.fetch(url).await
    }

    async fn capture(&mut self, kind: ArtifactKind) -> Result<String, DriverError> {
        match kind {
            ArtifactKind::Trace => Ok(self.trace.join("\n")),
            ArtifactKind::NetworkLog => Ok(self.network.join("\n")),
            ArtifactKind::Screenshot => Err(DriverError::Unsupported(
                "screenshots require a rendering browser".into(),
            )),
        }
    }

    async fn close(&mut self) {
        self.html.clear();
        self.form.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::state::Locator;

    fn context_with(html: &str) -> HttpContext {
        let driver = HttpDriver::new().unwrap();
        let mut ctx = HttpContext::new(driver.client.clone(), "default", driver.patterns);
        ctx.url = Some(reqwest::Url::parse("https://example.com/start").unwrap());
        ctx.html = html.to_string();
        ctx
    }

    fn extract(pattern: &str) -> TaskStep {
        TaskStep::Extract {
            locator: Locator::new(pattern),
            field: "title".into(),
        }
    }

    #[tokio::test]
    async fn extract_returns_first_capture_group() {
        let mut ctx = context_with("<html><h1> Hello </h1></html>");
        let step = extract("<h1>(.*?)</h1>");
        let value = ctx.perform(&step, "<h1>(.*?)</h1>").await.unwrap();
        assert_eq!(value.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn missing_element_is_a_selector_error() {
        let mut ctx = context_with("<html></html>");
        let err = ctx.perform(&extract("<h2>(.*)</h2>"), "<h2>(.*)</h2>").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Selector);
    }

    #[tokio::test]
    async fn cookie_banner_is_dismissed() {
        let mut ctx = context_with(
            r#"<div class="cookie-consent">Accept <a>ok</a></div><h1>Body</h1>"#,
        );
        let dismissed = ctx.dismiss_interstitials().await.unwrap();
        assert_eq!(dismissed, vec!["cookie_banner".to_string()]);
        assert!(!ctx.html.contains("cookie"));
        assert!(ctx.dismiss_interstitials().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn challenge_page_is_detected() {
        let mut ctx = context_with(r#"<div class="g-recaptcha"></div>"#);
        assert_eq!(ctx.detect_gate().await.unwrap().as_deref(), Some("captcha"));
        let mut clean = context_with("<p>welcome</p>");
        assert!(clean.detect_gate().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn screenshots_are_unsupported_but_traces_work() {
        let mut ctx = context_with("<p></p>");
        assert!(matches!(
            ctx.capture(ArtifactKind::Screenshot).await,
            Err(DriverError::Unsupported(_))
        ));
        assert!(ctx.capture(ArtifactKind::Trace).await.is_ok());
    }

    #[tokio::test]
    async fn guarded_reports_timeout_and_cancel() {
        let cancel = CancellationToken::new();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, DriverError>(())
        };
        let err = guarded(&cancel, Duration::from_millis(10), "slow", slow)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));

        cancel.cancel();
        let err = guarded(&cancel, Duration::from_secs(5), "any", async {
            Ok::<_, DriverError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled));
    }
}
