//! TOML configuration with per-component sections.
//!
//! Every field has a default, so an absent file (or an empty one) yields a
//! working configuration for everything except Telegram, which needs real
//! credentials before notifications go anywhere.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment override for the Telegram bot token, so the secret can stay
/// out of the config file.
const BOT_TOKEN_ENV: &str = "WEBREG_BOT_TOKEN";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub site: SiteConfig,
    pub webdriver: WebDriverConfig,
    pub database: DatabaseConfig,
    pub telegram: TelegramConfig,
}

/// The external site this console drives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    pub base_url: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cappa.csu.ru".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebDriverConfig {
    /// WebDriver endpoint (chromedriver listens on 9515 by default).
    pub url: String,
    pub headless: bool,
    /// Bound on every page-element and submit-result wait.
    pub page_wait_secs: u64,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9515".to_string(),
            headless: true,
            page_wait_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite file path; `~` expands to the home directory.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.webreg/webreg.db".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Expanded filesystem path for the database file.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).into_owned())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Destination chat (numeric id or `@channelname`).
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

impl Config {
    /// Load from `path`, or from the platform config dir when no path is
    /// given. A missing file falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            Self::parse(&raw).with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "No config file found, using defaults");
            Self::default()
        };

        if let Ok(token) = std::env::var(BOT_TOKEN_ENV) {
            if !token.is_empty() {
                config.telegram.bot_token = token;
            }
        }
        Ok(config)
    }

    fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

/// `<platform config dir>/webreg/webreg.toml`, falling back to the current
/// directory when no home is available.
fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "webreg")
        .map(|dirs| dirs.config_dir().join("webreg.toml"))
        .unwrap_or_else(|| PathBuf::from("webreg.toml"))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.site.base_url, "https://cappa.csu.ru");
        assert_eq!(config.webdriver.url, "http://localhost:9515");
        assert!(config.webdriver.headless);
        assert_eq!(config.webdriver.page_wait_secs, 10);
        assert!(!config.telegram.is_configured());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [webdriver]
            headless = false

            [telegram]
            bot_token = "123:abc"
            chat_id = "-100200300"
            "#,
        )
        .unwrap();
        assert!(!config.webdriver.headless);
        assert_eq!(config.webdriver.page_wait_secs, 10);
        assert_eq!(config.site.base_url, "https://cappa.csu.ru");
        assert!(config.telegram.is_configured());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let result = Config::parse(
            r#"
            [webdriver]
            headles = false
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn telegram_needs_both_token_and_chat() {
        let config = Config::parse(
            r#"
            [telegram]
            bot_token = "123:abc"
            "#,
        )
        .unwrap();
        assert!(!config.telegram.is_configured());
    }

    #[test]
    fn database_path_tilde_expands() {
        let config = Config::default();
        let resolved = config.database.resolved_path();
        assert!(!resolved.to_string_lossy().contains('~') || std::env::var("HOME").is_err());
    }
}
