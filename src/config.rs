//! Configuration module for the mailbox watch and its collaborators
//!
//! All configuration is loaded from environment variables following the pattern
//! `GMAIL_DIGEST_<KEY>`. Credentials are wrapped in `SecretString` so they never
//! show up in `Debug` output or logs.

use std::env;
use std::env::VarError;
use std::net::SocketAddr;
use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

const PREFIX: &str = "GMAIL_DIGEST_";

/// Google OAuth client and mailbox identity
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: SecretString,
    /// Long-lived refresh token produced by the one-time authorization flow
    pub refresh_token: SecretString,
    /// Gmail user id (`me` for the authorized account)
    pub user_id: String,
    /// Token endpoint, overridable for testing against a stub
    pub token_url: String,
    /// Gmail REST base URL
    pub api_base: String,
}

/// Push subscription settings
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Fully qualified Pub/Sub topic (`projects/<p>/topics/<t>`)
    pub topic: String,
    /// Labels the watch is restricted to
    pub label_ids: Vec<String>,
    /// Renewal fires at least this long before expiration
    pub renewal_margin_secs: u64,
    /// First retry delay after a failed renewal
    pub renewal_backoff_initial_secs: u64,
    /// Upper bound for the renewal retry delay
    pub renewal_backoff_max_secs: u64,
}

impl WatchConfig {
    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.renewal_margin_secs)
    }
}

/// Summarizer model endpoint
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}

/// Chat delivery target
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: SecretString,
    /// Recipient of the direct messages (and of mentions)
    pub user_id: String,
    pub api_base: String,
}

/// Content shaping applied before summarization and delivery
#[derive(Debug, Clone)]
pub struct DigestConfig {
    /// Whether attachments are fetched while parsing
    pub fetch_attachments: bool,
    /// HTML beyond this many characters is truncated before conversion
    pub html_max_input_chars: usize,
    /// Bracketed URLs longer than this are shortened
    pub url_max_len: usize,
    /// Prefix of the "see full email" link; the message id is appended
    pub deep_link_base: String,
}

/// Server-wide configuration
///
/// Shared by the webhook, the ingestion pipeline, and the renewal task.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for the webhook
    pub bind_addr: SocketAddr,
    /// Shared secret expected in the `token` query parameter, if set
    pub webhook_token: Option<SecretString>,
    /// Per-request timeout for every outbound HTTP call, in milliseconds
    pub http_timeout_ms: u64,
    pub google: GoogleConfig,
    pub watch: WatchConfig,
    pub openai: OpenAiConfig,
    pub discord: DiscordConfig,
    pub digest: DigestConfig,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// GMAIL_DIGEST_CLIENT_ID=1234.apps.googleusercontent.com
    /// GMAIL_DIGEST_CLIENT_SECRET=secret
    /// GMAIL_DIGEST_REFRESH_TOKEN=1//0g...
    /// GMAIL_DIGEST_TOPIC=projects/my-project/topics/gmail-push
    /// GMAIL_DIGEST_OPENAI_API_KEY=sk-...
    /// GMAIL_DIGEST_DISCORD_BOT_TOKEN=MTA...
    /// GMAIL_DIGEST_DISCORD_USER_ID=526191240962768910
    /// GMAIL_DIGEST_BIND=0.0.0.0:3000
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let bind_raw = optional_env(&key("BIND"))?.unwrap_or_else(|| "0.0.0.0:3000".to_owned());
        let bind_addr = parse_socket_addr(&bind_raw)?;

        let google = GoogleConfig {
            client_id: required_env(&key("CLIENT_ID"))?,
            client_secret: secret_env(&key("CLIENT_SECRET"))?,
            refresh_token: secret_env(&key("REFRESH_TOKEN"))?,
            user_id: optional_env(&key("USER_ID"))?.unwrap_or_else(|| "me".to_owned()),
            token_url: optional_env(&key("TOKEN_URL"))?
                .unwrap_or_else(|| "https://oauth2.googleapis.com/token".to_owned()),
            api_base: optional_env(&key("GMAIL_API_BASE"))?
                .unwrap_or_else(|| "https://gmail.googleapis.com/gmail/v1".to_owned()),
        };

        let watch = WatchConfig {
            topic: required_env(&key("TOPIC"))?,
            label_ids: parse_list_env(&key("WATCH_LABELS"), &["INBOX"])?,
            renewal_margin_secs: parse_u64_env(&key("RENEWAL_MARGIN_SECS"), 60)?,
            renewal_backoff_initial_secs: parse_u64_env(&key("RENEWAL_BACKOFF_INITIAL_SECS"), 5)?,
            renewal_backoff_max_secs: parse_u64_env(&key("RENEWAL_BACKOFF_MAX_SECS"), 300)?,
        };

        let openai = OpenAiConfig {
            api_key: secret_env(&key("OPENAI_API_KEY"))?,
            model: optional_env(&key("OPENAI_MODEL"))?.unwrap_or_else(|| "gpt-5.2".to_owned()),
            base_url: optional_env(&key("OPENAI_BASE_URL"))?
                .unwrap_or_else(|| "https://api.openai.com/v1".to_owned()),
        };

        let discord = DiscordConfig {
            bot_token: secret_env(&key("DISCORD_BOT_TOKEN"))?,
            user_id: required_env(&key("DISCORD_USER_ID"))?,
            api_base: optional_env(&key("DISCORD_API_BASE"))?
                .unwrap_or_else(|| "https://discord.com/api/v10".to_owned()),
        };

        let digest = DigestConfig {
            fetch_attachments: parse_bool_env(&key("FETCH_ATTACHMENTS"), true)?,
            html_max_input_chars: parse_usize_env(&key("HTML_MAX_INPUT_CHARS"), 50_000)?,
            url_max_len: parse_usize_env(&key("URL_MAX_LEN"), 1000)?,
            deep_link_base: optional_env(&key("DEEP_LINK_BASE"))?
                .unwrap_or_else(|| "https://mail.google.com/mail/u/0/#inbox/".to_owned()),
        };

        if watch.renewal_backoff_initial_secs == 0 {
            return Err(AppError::invalid(format!(
                "{} must be greater than zero",
                key("RENEWAL_BACKOFF_INITIAL_SECS")
            )));
        }

        Ok(Self {
            bind_addr,
            webhook_token: optional_env(&key("WEBHOOK_TOKEN"))?
                .map(|t| SecretString::new(t.into())),
            http_timeout_ms: parse_u64_env(&key("HTTP_TIMEOUT_MS"), 30_000)?,
            google,
            watch,
            openai,
            discord,
            digest,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

fn key(suffix: &str) -> String {
    format!("{PREFIX}{suffix}")
}

/// Parse a listen address such as `0.0.0.0:3000`
pub fn parse_socket_addr(raw: &str) -> AppResult<SocketAddr> {
    raw.trim()
        .parse::<SocketAddr>()
        .map_err(|_| AppError::InvalidInput(format!("invalid listen address '{raw}'")))
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

fn secret_env(key: &str) -> AppResult<SecretString> {
    required_env(key).map(|v| SecretString::new(v.into()))
}

/// Read an optional environment variable; blank values count as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a comma-separated list environment variable
///
/// Entries are trimmed and empty entries dropped. Returns `default` if unset.
fn parse_list_env(key: &str, default: &[&str]) -> AppResult<Vec<String>> {
    let Some(raw) = optional_env(key)? else {
        return Ok(default.iter().map(|s| (*s).to_owned()).collect());
    };
    let items = parse_list_value(&raw);
    if items.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "environment variable {key} must list at least one value"
        )));
    }
    Ok(items)
}

fn parse_list_value(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set to an unrecognized value.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `usize` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `usize`.
fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match env::var(key) {
        Ok(v) => v.trim().parse::<usize>().map_err(|_| {
            AppError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}
