//! WebDriver automation against the external site's fixed form pages.
//!
//! The coupling is structural and deliberate: the signup/signin/signout
//! paths, input element ids and result marker classes below are exactly
//! what the site renders today. Any markup change there breaks this module
//! first.

use std::time::{Duration, Instant};

use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use thiserror::Error;

use crate::config::{SiteConfig, WebDriverConfig};

// Fixed page paths.
pub const SIGNUP_PATH: &str = "/auth/signup/";
pub const SIGNIN_PATH: &str = "/auth/signin/";
pub const SIGNOUT_PATH: &str = "/auth/signout/";

// Form element ids on the signup page.
const FIELD_USERNAME: &str = "id_username";
const FIELD_EMAIL: &str = "id_email";
const FIELD_FIRST_NAME: &str = "id_first_name";
const FIELD_LAST_NAME: &str = "id_last_name";
const FIELD_PASSWORD1: &str = "id_password1";
const FIELD_PASSWORD2: &str = "id_password2";

// Form element ids on the signin page.
const FIELD_LOGIN: &str = "id_login";
const FIELD_PASSWORD: &str = "id_password";

const SUBMIT_XPATH: &str = "//input[@type='submit']";

// Result markup.
const ERRORLIST_CSS: &str = ".errorlist li";
const PROFILE_SIGNED_IN_CSS: &str = ".profile__bar-username";
const PROFILE_SIGNED_OUT_CSS: &str = ".profile__bar-login";

/// URL-change polling interval while waiting for a form submit to land.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The browser is disposed after this many consecutive failed operations;
/// the next operation reconnects fresh instead of reusing a wedged session.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Fields the signup form asks for. Only the username and secret outlive
/// the page interaction; the rest exist because the site requires them.
#[derive(Debug, Clone)]
pub struct SignupForm {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub secret: String,
    pub secret_repeat: String,
}

#[derive(Debug, Error)]
pub enum DriverError {
    /// A bounded wait elapsed. Terminal for this attempt; no retry.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The site re-rendered the form with validation errors.
    #[error("the site rejected the form: {}", .0.join("; "))]
    FormRejected(Vec<String>),
    /// No WebDriver session could be established.
    #[error("webdriver session could not be started: {0}")]
    Connect(String),
    /// An operation needed a browser but none is open.
    #[error("no active browser session")]
    NoSession,
    #[error(transparent)]
    WebDriver(#[from] CmdError),
}

/// Driver for the external site. Holds at most one WebDriver session,
/// connected lazily and kept open across operations until sign-out,
/// repeated failure, or process exit tears it down.
pub struct SiteDriver {
    site: SiteConfig,
    webdriver: WebDriverConfig,
    client: Option<Client>,
    consecutive_failures: u32,
}

impl SiteDriver {
    pub fn new(site: SiteConfig, webdriver: WebDriverConfig) -> Self {
        Self {
            site,
            webdriver,
            client: None,
            consecutive_failures: 0,
        }
    }

    fn page_wait(&self) -> Duration {
        Duration::from_secs(self.webdriver.page_wait_secs)
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Register an account through the signup form.
    ///
    /// Success is the page navigating away from the signup URL; staying
    /// put, or timing out with error markup rendered, is a rejection.
    pub async fn sign_up(&mut self, form: &SignupForm) -> Result<(), DriverError> {
        let result = self.run_sign_up(form).await;
        self.track(result).await
    }

    /// Sign an existing account in through the signin form.
    pub async fn sign_in(&mut self, username: &str, secret: &str) -> Result<(), DriverError> {
        let result = self.run_sign_in(username, secret).await;
        self.track(result).await
    }

    /// Sign out via the signout URL.
    ///
    /// The browser is torn down afterwards no matter how the confirmation
    /// wait went.
    pub async fn sign_out(&mut self) -> Result<(), DriverError> {
        let result = self.run_sign_out().await;
        self.dispose().await;
        self.consecutive_failures = 0;
        result
    }

    /// Close the WebDriver session if one is open.
    pub async fn dispose(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                tracing::warn!("Error closing WebDriver session: {e}");
            } else {
                tracing::info!("WebDriver session closed");
            }
        }
    }

    // ── Flows ───────────────────────────────────────────────────────

    async fn run_sign_up(&mut self, form: &SignupForm) -> Result<(), DriverError> {
        let wait = self.page_wait();
        let url = join_url(&self.site.base_url, SIGNUP_PATH);
        let client = self.ensure_client().await?;

        client.goto(&url).await?;
        tracing::info!("Opened signup page");

        let username = wait_for(client, Locator::Id(FIELD_USERNAME), "the signup form", wait).await?;
        username.send_keys(&form.username).await?;
        client.find(Locator::Id(FIELD_EMAIL)).await?.send_keys(&form.email).await?;
        client
            .find(Locator::Id(FIELD_FIRST_NAME))
            .await?
            .send_keys(&form.first_name)
            .await?;
        client
            .find(Locator::Id(FIELD_LAST_NAME))
            .await?
            .send_keys(&form.last_name)
            .await?;
        client
            .find(Locator::Id(FIELD_PASSWORD1))
            .await?
            .send_keys(&form.secret)
            .await?;
        client
            .find(Locator::Id(FIELD_PASSWORD2))
            .await?
            .send_keys(&form.secret_repeat)
            .await?;

        let submit = wait_for(client, Locator::XPath(SUBMIT_XPATH), "the submit control", wait).await?;
        submit.click().await?;

        match wait_for_url_change(client, &url, wait).await {
            Ok(current) if still_on(&current, SIGNUP_PATH) => {
                Err(DriverError::FormRejected(collect_form_errors(client).await))
            }
            Ok(_) => Ok(()),
            Err(DriverError::Timeout(_)) => {
                // Some rejections re-render in place without a URL change.
                let errors = collect_form_errors(client).await;
                if errors.is_empty() {
                    Err(DriverError::Timeout("the signup result"))
                } else {
                    Err(DriverError::FormRejected(errors))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn run_sign_in(&mut self, username: &str, secret: &str) -> Result<(), DriverError> {
        let wait = self.page_wait();
        let url = join_url(&self.site.base_url, SIGNIN_PATH);
        let client = self.ensure_client().await?;

        client.goto(&url).await?;
        tracing::info!("Opened signin page");

        let login = wait_for(client, Locator::Id(FIELD_LOGIN), "the signin form", wait).await?;
        login.send_keys(username).await?;
        client
            .find(Locator::Id(FIELD_PASSWORD))
            .await?
            .send_keys(secret)
            .await?;

        let submit = wait_for(client, Locator::XPath(SUBMIT_XPATH), "the submit control", wait).await?;
        submit.click().await?;

        // The profile bar only renders the username for a signed-in visitor.
        wait_for(
            client,
            Locator::Css(PROFILE_SIGNED_IN_CSS),
            "sign-in confirmation",
            wait,
        )
        .await?;
        Ok(())
    }

    async fn run_sign_out(&mut self) -> Result<(), DriverError> {
        let wait = self.page_wait();
        let url = join_url(&self.site.base_url, SIGNOUT_PATH);
        let client = self.client.as_ref().ok_or(DriverError::NoSession)?;

        client.goto(&url).await?;
        wait_for(
            client,
            Locator::Css(PROFILE_SIGNED_OUT_CSS),
            "sign-out confirmation",
            wait,
        )
        .await?;
        Ok(())
    }

    // ── Session lifecycle ───────────────────────────────────────────

    async fn ensure_client(&mut self) -> Result<&Client, DriverError> {
        if self.client.is_none() {
            let mut caps = serde_json::map::Map::new();
            let mut args = vec!["--log-level=3".to_string(), "--silent".to_string()];
            if self.webdriver.headless {
                args.push("--headless=new".to_string());
            }
            caps.insert(
                "goog:chromeOptions".to_string(),
                serde_json::json!({ "args": args }),
            );

            let mut builder =
                ClientBuilder::rustls().map_err(|e| DriverError::Connect(e.to_string()))?;
            builder.capabilities(caps);
            let client = builder
                .connect(&self.webdriver.url)
                .await
                .map_err(|e| DriverError::Connect(e.to_string()))?;
            tracing::info!(url = %self.webdriver.url, "WebDriver session started");
            self.client = Some(client);
        }
        self.client.as_ref().ok_or(DriverError::NoSession)
    }

    async fn track(&mut self, result: Result<(), DriverError>) -> Result<(), DriverError> {
        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::warn!(
                        failures = self.consecutive_failures,
                        "Disposing browser session after repeated failures"
                    );
                    self.dispose().await;
                    self.consecutive_failures = 0;
                }
                Err(e)
            }
        }
    }
}

// ── Page helpers ────────────────────────────────────────────────────

async fn wait_for(
    client: &Client,
    locator: Locator<'_>,
    what: &'static str,
    timeout: Duration,
) -> Result<fantoccini::elements::Element, DriverError> {
    match client.wait().at_most(timeout).for_element(locator).await {
        Ok(element) => Ok(element),
        Err(CmdError::WaitTimeout) => Err(DriverError::Timeout(what)),
        Err(e) => Err(DriverError::WebDriver(e)),
    }
}

/// Poll until the browser leaves `from`, returning the new URL.
async fn wait_for_url_change(
    client: &Client,
    from: &str,
    timeout: Duration,
) -> Result<String, DriverError> {
    let deadline = Instant::now() + timeout;
    loop {
        let current = client.current_url().await?;
        if current.as_str() != from {
            return Ok(current.as_str().to_string());
        }
        if Instant::now() >= deadline {
            return Err(DriverError::Timeout("a navigation away from the form"));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Scrape `.errorlist` items the site renders on a rejected form.
async fn collect_form_errors(client: &Client) -> Vec<String> {
    let mut errors = Vec::new();
    match client.find_all(Locator::Css(ERRORLIST_CSS)).await {
        Ok(items) => {
            for item in items {
                match item.text().await {
                    Ok(text) if !text.trim().is_empty() => errors.push(text),
                    Ok(_) => {}
                    Err(e) => tracing::error!("Error reading form error text: {e}"),
                }
            }
        }
        Err(e) => tracing::error!("Error extracting form errors: {e}"),
    }
    errors
}

/// Whether the browser is still on the page identified by `path`.
fn still_on(url: &str, path: &str) -> bool {
    url.contains(path)
}

/// Join the configured base URL with a fixed page path.
fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_driver() -> SiteDriver {
        let cfg = Config::default();
        SiteDriver::new(cfg.site, cfg.webdriver)
    }

    #[test]
    fn join_url_strips_double_slash() {
        assert_eq!(
            join_url("https://cappa.csu.ru/", SIGNUP_PATH),
            "https://cappa.csu.ru/auth/signup/"
        );
        assert_eq!(
            join_url("https://cappa.csu.ru", SIGNIN_PATH),
            "https://cappa.csu.ru/auth/signin/"
        );
    }

    #[test]
    fn still_on_detects_signup_page() {
        assert!(still_on("https://cappa.csu.ru/auth/signup/", SIGNUP_PATH));
        assert!(still_on("https://cappa.csu.ru/auth/signup/?retry=1", SIGNUP_PATH));
        assert!(!still_on("https://cappa.csu.ru/", SIGNUP_PATH));
    }

    #[test]
    fn form_rejected_joins_errors() {
        let e = DriverError::FormRejected(vec![
            "Username taken".to_string(),
            "Password too short".to_string(),
        ]);
        assert_eq!(
            e.to_string(),
            "the site rejected the form: Username taken; Password too short"
        );
    }

    #[test]
    fn timeout_names_what_was_awaited() {
        let e = DriverError::Timeout("sign-in confirmation");
        assert_eq!(e.to_string(), "timed out waiting for sign-in confirmation");
    }

    #[tokio::test]
    async fn track_resets_on_success() {
        let mut driver = test_driver();
        driver.consecutive_failures = 2;
        assert!(driver.track(Ok(())).await.is_ok());
        assert_eq!(driver.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn track_counts_failures() {
        let mut driver = test_driver();
        let _ = driver.track(Err(DriverError::Timeout("the signup form"))).await;
        let _ = driver.track(Err(DriverError::Timeout("the signup form"))).await;
        assert_eq!(driver.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn third_failure_disposes_and_resets() {
        let mut driver = test_driver();
        for _ in 0..3 {
            let _ = driver.track(Err(DriverError::Timeout("the signup form"))).await;
        }
        // dispose() on a never-connected driver is a no-op, but the
        // counter must come back to zero for the next attempt.
        assert_eq!(driver.consecutive_failures, 0);
        assert!(driver.client.is_none());
    }

    #[tokio::test]
    async fn sign_out_without_session_reports_no_session() {
        let mut driver = test_driver();
        let err = driver.sign_out().await.unwrap_err();
        assert!(matches!(err, DriverError::NoSession));
    }
}
