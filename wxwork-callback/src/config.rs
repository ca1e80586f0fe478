//! Configuration module for environment variable parsing.
//!
//! Everything is read once at startup. Missing values never abort the
//! process: the server still starts so health checks keep working, and the
//! binary logs which credentials are still on their placeholders.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Placeholder used when `WXWORK_TOKEN` is unset.
pub const TOKEN_PLACEHOLDER: &str = "your_token_here";

/// Placeholder used when `WXWORK_ENCODING_AES_KEY` is unset.
pub const ENCODING_AES_KEY_PLACEHOLDER: &str = "your_encoding_aes_key_here";

/// Placeholder used when `WXWORK_CORP_ID` is unset.
pub const CORP_ID_PLACEHOLDER: &str = "your_corp_id_here";

/// Shared secrets issued by the WeCom admin console.
///
/// Immutable after startup and handed to the crypto collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct CallbackCredentials {
    /// Token configured for the callback URL
    pub token: String,

    /// 43-character EncodingAESKey
    pub encoding_aes_key: String,

    /// Corp ID the messages are addressed to
    pub corp_id: String,
}

impl CallbackCredentials {
    pub fn new(
        token: impl Into<String>,
        encoding_aes_key: impl Into<String>,
        corp_id: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            encoding_aes_key: encoding_aes_key.into(),
            corp_id: corp_id.into(),
        }
    }

    /// Environment variable names whose values are empty or still the placeholder.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let checks = [
            ("WXWORK_TOKEN", self.token.as_str(), TOKEN_PLACEHOLDER),
            (
                "WXWORK_ENCODING_AES_KEY",
                self.encoding_aes_key.as_str(),
                ENCODING_AES_KEY_PLACEHOLDER,
            ),
            ("WXWORK_CORP_ID", self.corp_id.as_str(), CORP_ID_PLACEHOLDER),
        ];

        checks
            .into_iter()
            .filter(|(_, value, placeholder)| value.trim().is_empty() || value == placeholder)
            .map(|(name, _, _)| name)
            .collect()
    }

    pub fn is_configured(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

// Secrets stay out of logs even when the whole config is debug-printed.
impl std::fmt::Debug for CallbackCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackCredentials")
            .field("token", &"<redacted>")
            .field("encoding_aes_key", &"<redacted>")
            .field("corp_id", &self.corp_id)
            .finish()
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Callback secrets
    pub credentials: CallbackCredentials,

    /// Address the web server binds to
    pub host: String,

    /// Port for the web server to listen on
    pub port: u16,

    /// Maximum accepted POST body size in bytes
    pub max_body_bytes: usize,

    /// Whole-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Upper bound for a single crypto call in milliseconds
    pub crypto_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            credentials: CallbackCredentials {
                token: env::var("WXWORK_TOKEN").unwrap_or_else(|_| TOKEN_PLACEHOLDER.to_string()),

                encoding_aes_key: env::var("WXWORK_ENCODING_AES_KEY")
                    .unwrap_or_else(|_| ENCODING_AES_KEY_PLACEHOLDER.to_string()),

                corp_id: env::var("WXWORK_CORP_ID")
                    .unwrap_or_else(|_| CORP_ID_PLACEHOLDER.to_string()),
            },

            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            port: parse_number("PORT", 8000),

            max_body_bytes: parse_number("MAX_BODY_BYTES", 64 * 1024),

            request_timeout_ms: parse_number("REQUEST_TIMEOUT_MS", 10_000),

            crypto_timeout_ms: parse_number("CRYPTO_TIMEOUT_MS", 2_000),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn crypto_timeout(&self) -> Duration {
        Duration::from_millis(self.crypto_timeout_ms)
    }
}

/// Parse a numeric variable, falling back to `default` when unset or invalid.
fn parse_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid numeric value, using default");
            default
        }
    }
}
