//! Configuration parsing and validation for gemrelay.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable consulted when the config file lists no upstream keys.
pub const KEYS_ENV_VAR: &str = "GEMINI_API_KEYS";

/// Environment variable consulted when the config file has no operator secret.
pub const AUTH_ENV_VAR: &str = "GEMRELAY_AUTH";

/// Resolved gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub healing: HealingConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the gateway.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory served as a static site for any unmatched path
    #[serde(default)]
    pub static_dir: Option<String>,
    /// Per-client budget for `/v1/chat/completions`
    #[serde(default = "default_chat_rate_limit")]
    pub chat_rate_limit: RateLimit,
    /// Per-client budget for `/api/check-keys`
    #[serde(default = "default_check_keys_rate_limit")]
    pub check_keys_rate_limit: RateLimit,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_chat_rate_limit() -> RateLimit {
    RateLimit::per_minute(20)
}

fn default_check_keys_rate_limit() -> RateLimit {
    RateLimit::per_minute(5)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            static_dir: None,
            chat_rate_limit: default_chat_rate_limit(),
            check_keys_rate_limit: default_check_keys_rate_limit(),
        }
    }
}

/// Requests a single client may make per window, written `"20/minute"`.
///
/// `"off"` disables the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct RateLimit {
    /// Zero when the limit is disabled
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }

    pub const fn disabled() -> Self {
        Self {
            max_requests: 0,
            window: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0 && !self.window.is_zero()
    }
}

impl FromStr for RateLimit {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("off") {
            return Ok(Self::disabled());
        }

        let invalid = || {
            ConfigError::Validation(format!(
                "invalid rate limit '{}': expected '<count>/<second|minute|hour|day>' or 'off'",
                value
            ))
        };
        let (count, unit) = value.split_once('/').ok_or_else(invalid)?;
        let max_requests: u32 = count.trim().parse().map_err(|_| invalid())?;
        let window_secs = match unit.trim() {
            "s" | "second" => 1,
            "m" | "minute" => 60,
            "h" | "hour" => 3600,
            "d" | "day" => 86_400,
            _ => return Err(invalid()),
        };
        if max_requests == 0 {
            return Err(invalid());
        }

        Ok(Self {
            max_requests,
            window: Duration::from_secs(window_secs),
        })
    }
}

impl TryFrom<String> for RateLimit {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_enabled() {
            return write!(f, "off");
        }
        let unit = match self.window.as_secs() {
            1 => "second",
            60 => "minute",
            3600 => "hour",
            86_400 => "day",
            secs => return write!(f, "{} per {}s", self.max_requests, secs),
        };
        write!(f, "{} per {}", self.max_requests, unit)
    }
}

/// A Gemini key or operator secret, redacted wherever it is formatted.
///
/// Every access to the raw value goes through `.expose_secret()`, so call
/// sites stay grep-auditable. Diagnostics use [`ApiKey::suffix`].
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// The raw secret, for the `x-goog-api-key` header and auth comparison only.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    /// Last four characters of the key, formatted as `...abcd`.
    ///
    /// Keys of four characters or fewer are masked entirely.
    pub fn suffix(&self) -> String {
        let raw = self.0.expose_secret();
        let chars: Vec<char> = raw.chars().collect();
        if chars.len() <= 4 {
            return "****".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("...{}", tail)
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a secret value was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Literal string in the config file
    Literal,
    /// Contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Read from a convention env var (holds var name)
    Convention(String),
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
        }
    }
}

/// Upstream (Gemini) configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the generative-content API
    pub base_url: String,
    /// Credential pool, in configured order
    pub api_keys: Vec<ApiKey>,
    /// Maximum credentials tried per inbound request
    pub max_attempts: usize,
    /// Timeout for one upstream call (or for opening a stream)
    pub attempt_timeout_secs: u64,
    /// Longest silence tolerated between two streamed fragments
    pub stream_idle_timeout_secs: u64,
    /// Model used by the key-check probe
    pub probe_model: String,
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_max_attempts() -> usize {
    3
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

fn default_stream_idle_timeout_secs() -> u64 {
    60
}

fn default_probe_model() -> String {
    "gemini-2.0-flash".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_keys: Vec::new(),
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            probe_model: default_probe_model(),
        }
    }
}

impl UpstreamConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

/// Self-healing stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealingConfig {
    /// Resume interrupted streams transparently
    #[serde(default)]
    pub enabled: bool,
    /// Resumptions allowed per stream session
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
        }
    }
}

impl HealingConfig {
    /// Retry ceiling actually applied to a session (zero when healing is off).
    pub fn effective_retries(&self) -> u32 {
        if self.enabled {
            self.max_retries
        } else {
            0
        }
    }
}

/// Operator authentication.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Shared secret callers must present; `None` disables auth
    pub secret: Option<ApiKey>,
}

/// `[logging]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{field}': {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

/// Raw upstream section; keys may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawUpstreamConfig {
    #[serde(default = "default_base_url")]
    base_url: String,
    #[serde(default)]
    api_keys: Vec<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: usize,
    #[serde(default = "default_attempt_timeout_secs")]
    attempt_timeout_secs: u64,
    #[serde(default = "default_stream_idle_timeout_secs")]
    stream_idle_timeout_secs: u64,
    #[serde(default = "default_probe_model")]
    probe_model: String,
}

impl Default for RawUpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_keys: Vec::new(),
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            probe_model: default_probe_model(),
        }
    }
}

/// Raw auth section.
#[derive(Deserialize, Default)]
pub struct RawAuthConfig {
    secret: Option<String>,
}

/// The file as written, before secrets are resolved.
#[derive(Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    upstream: RawUpstreamConfig,
    #[serde(default)]
    healing: HealingConfig,
    #[serde(default)]
    auth: RawAuthConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Replace every `${VAR}` in `input` using `lookup`.
///
/// Supports multiple `${VAR}` in one string. Fails on first missing variable,
/// unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            field: field.to_string(),
            message: "Unclosed '${' in config value".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!("Environment variable '{}' is not set", var_name),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Resolve one configured secret, recording where it came from.
fn resolve_secret<F>(raw: &str, field: &str, lookup: &F) -> Result<(ApiKey, KeySource), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if raw.contains("${") {
        let expanded = expand_env_vars_with(raw, field, lookup)?;
        Ok((ApiKey::from(expanded), KeySource::EnvExpanded))
    } else {
        Ok((ApiKey::from(raw), KeySource::Literal))
    }
}

/// Split a comma-separated key list, dropping blanks.
pub fn split_key_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Convert raw config to final config using real environment variables.
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Resolve a parsed file into a `Config`, expanding secrets from the process environment.
    ///
    /// - `${VAR}` references in keys and the auth secret are expanded
    /// - An empty `api_keys` list falls back to `GEMINI_API_KEYS` (comma-separated)
    /// - A missing auth secret falls back to `GEMRELAY_AUTH`
    ///
    /// Returns the config and the source of each key, labelled by key suffix.
    pub fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut api_keys = Vec::new();
        let mut key_sources = Vec::new();

        if raw.upstream.api_keys.is_empty() {
            if let Some(value) = lookup(KEYS_ENV_VAR) {
                for key in split_key_list(&value) {
                    let key = ApiKey::from(key);
                    key_sources.push((key.suffix(), KeySource::Convention(KEYS_ENV_VAR.into())));
                    api_keys.push(key);
                }
            }
        } else {
            for (i, raw_key) in raw.upstream.api_keys.iter().enumerate() {
                let field = format!("upstream.api_keys[{}]", i);
                let (key, source) = resolve_secret(raw_key, &field, &lookup)?;
                if key.expose_secret().trim().is_empty() {
                    return Err(ConfigError::Validation(format!("{} is empty", field)));
                }
                key_sources.push((key.suffix(), source));
                api_keys.push(key);
            }
        }

        let secret = match raw.auth.secret {
            Some(ref value) => Some(resolve_secret(value, "auth.secret", &lookup)?.0),
            None => lookup(AUTH_ENV_VAR)
                .filter(|v| !v.is_empty())
                .map(ApiKey::from),
        };

        let config = Config {
            server: raw.server,
            upstream: UpstreamConfig {
                base_url: raw.upstream.base_url,
                api_keys,
                max_attempts: raw.upstream.max_attempts,
                attempt_timeout_secs: raw.upstream.attempt_timeout_secs,
                stream_idle_timeout_secs: raw.upstream.stream_idle_timeout_secs,
                probe_model: raw.upstream.probe_model,
            },
            healing: raw.healing,
            auth: AuthConfig { secret },
            logging: raw.logging,
        };

        Ok((config, key_sources))
    }

    /// Parse configuration from a TOML string, expanding from the real environment.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (config, _) = Self::from_raw(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string with a custom variable lookup.
    pub fn parse_str_with<F>(
        content: &str,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw_with(raw, lookup)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Read, parse and resolve a TOML config file.
    ///
    /// Returns the config and per-key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str_with(&content, |name| std::env::var(name).ok())
    }

    /// Build configuration from defaults and the environment alone.
    ///
    /// Used when no config file exists, so a deployment can be driven
    /// entirely by `GEMINI_API_KEYS` and `GEMRELAY_AUTH`.
    pub fn from_env() -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let (config, key_sources) = Self::from_raw(RawConfig::default())?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Reject settings the gateway cannot run with.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.api_keys.is_empty() {
            tracing::warn!("No upstream API keys configured - proxy will reject all requests");
        }

        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "upstream.base_url is empty".to_string(),
            ));
        }

        if self.upstream.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "upstream.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.upstream.attempt_timeout_secs == 0 || self.upstream.stream_idle_timeout_secs == 0
        {
            return Err(ConfigError::Validation(
                "upstream timeouts must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_minimal_config() {
        let (config, sources) = Config::parse_str_with("", no_env).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert!(config.upstream.api_keys.is_empty());
        assert!(sources.is_empty());
        assert_eq!(config.upstream.max_attempts, 3);
        assert!(!config.healing.enabled);
        assert_eq!(config.healing.max_retries, 2);
        assert!(config.auth.secret.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen = "0.0.0.0:7860"
            static_dir = "./public"

            [upstream]
            base_url = "http://localhost:9999"
            api_keys = ["key-aaaa1111", "key-bbbb2222"]
            max_attempts = 5
            attempt_timeout_secs = 30
            stream_idle_timeout_secs = 15
            probe_model = "gemini-1.5-flash"

            [healing]
            enabled = true
            max_retries = 4

            [auth]
            secret = "operator"

            [logging]
            level = "debug"
        "#;

        let (config, sources) = Config::parse_str_with(toml, no_env).unwrap();
        assert_eq!(config.server.static_dir.as_deref(), Some("./public"));
        assert_eq!(config.upstream.api_keys.len(), 2);
        assert_eq!(config.upstream.max_attempts, 5);
        assert_eq!(config.upstream.attempt_timeout(), Duration::from_secs(30));
        assert_eq!(config.upstream.stream_idle_timeout(), Duration::from_secs(15));
        assert_eq!(config.healing.effective_retries(), 4);
        assert_eq!(
            config.auth.secret.as_ref().unwrap().expose_secret(),
            "operator"
        );
        assert_eq!(sources[0], ("...1111".to_string(), KeySource::Literal));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_rate_limits_default_and_parse() {
        let (config, _) = Config::parse_str_with("", no_env).unwrap();
        assert_eq!(config.server.chat_rate_limit, RateLimit::per_minute(20));
        assert_eq!(config.server.check_keys_rate_limit, RateLimit::per_minute(5));

        let toml = r#"
            [server]
            chat_rate_limit = "100/hour"
            check_keys_rate_limit = "off"
        "#;
        let (config, _) = Config::parse_str_with(toml, no_env).unwrap();
        assert_eq!(config.server.chat_rate_limit.max_requests, 100);
        assert_eq!(
            config.server.chat_rate_limit.window,
            Duration::from_secs(3600)
        );
        assert_eq!(config.server.chat_rate_limit.to_string(), "100 per hour");
        assert!(!config.server.check_keys_rate_limit.is_enabled());
    }

    #[test]
    fn test_malformed_rate_limit_rejected() {
        for bad in ["20", "20/fortnight", "x/minute", "0/minute"] {
            assert!(bad.parse::<RateLimit>().is_err(), "{} should be rejected", bad);
        }
        let toml = r#"
            [server]
            chat_rate_limit = "twenty"
        "#;
        assert!(Config::parse_str_with(toml, no_env).is_err());
    }

    #[test]
    fn test_healing_disabled_means_zero_retries() {
        let healing = HealingConfig {
            enabled: false,
            max_retries: 5,
        };
        assert_eq!(healing.effective_retries(), 0);
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let toml = r#"
            [upstream]
            max_attempts = 0
        "#;
        let err = Config::parse_str_with(toml, no_env).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_api_key_debug_redaction() {
        let key = ApiKey::from("super-secret-gemini-key");
        let debug_output = format!("{:?}", key);
        assert_eq!(debug_output, "[REDACTED]");
        assert!(!debug_output.contains("super-secret"));
    }

    #[test]
    fn test_api_key_display_redaction() {
        let key = ApiKey::from("super-secret-gemini-key");
        assert_eq!(format!("{}", key), "[REDACTED]");
    }

    #[test]
    fn test_api_key_serialize_redaction() {
        let key = ApiKey::from("real-secret-value");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"[REDACTED]\"");
    }

    #[test]
    fn test_api_key_suffix() {
        assert_eq!(ApiKey::from("AIzaSyExample1234").suffix(), "...1234");
        assert_eq!(ApiKey::from("abcd").suffix(), "****");
        assert_eq!(ApiKey::from("").suffix(), "****");
    }

    #[test]
    fn test_upstream_config_debug_redaction() {
        let config = UpstreamConfig {
            api_keys: vec![ApiKey::from("AIzaSySecretValue")],
            ..Default::default()
        };
        let debug_output = format!("{:?}", config);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("AIzaSySecretValue"));
    }

    // ── Expansion tests (closure lookup, no global env state) ──

    #[test]
    fn test_expand_single_var() {
        let lookup = |name: &str| match name {
            "MY_KEY" => Some("AIzaResolved".to_string()),
            _ => None,
        };
        let result = expand_env_vars_with("${MY_KEY}", "test", &lookup).unwrap();
        assert_eq!(result, "AIzaResolved");
    }

    #[test]
    fn test_expand_mixed_literal_and_var() {
        let lookup = |name: &str| match name {
            "KEY" => Some("resolved".to_string()),
            _ => None,
        };
        let result = expand_env_vars_with("prefix-${KEY}-suffix", "test", &lookup).unwrap();
        assert_eq!(result, "prefix-resolved-suffix");
    }

    #[test]
    fn test_expand_no_vars_passthrough() {
        let lookup = |_: &str| -> Option<String> { panic!("should not be called") };
        let result = expand_env_vars_with("literal-value", "test", &lookup).unwrap();
        assert_eq!(result, "literal-value");
    }

    #[test]
    fn test_expand_missing_var_fails() {
        let result = expand_env_vars_with("${MISSING}", "upstream.api_keys[2]", &no_env);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("MISSING"), "Error should name the variable");
        assert!(err.contains("upstream.api_keys[2]"), "Error should name the field");
    }

    #[test]
    fn test_expand_unclosed_brace_fails() {
        let err = expand_env_vars_with("${UNCLOSED", "test", &no_env)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(err.contains("unclosed"));
    }

    #[test]
    fn test_expand_empty_var_name_fails() {
        let err = expand_env_vars_with("${}", "test", &no_env)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(err.contains("empty"));
    }

    #[test]
    fn test_keys_expanded_from_env() {
        let toml = r#"
            [upstream]
            api_keys = ["${PRIMARY_KEY}", "literal-key-9999"]
        "#;
        let lookup = |name: &str| match name {
            "PRIMARY_KEY" => Some("expanded-key-0001".to_string()),
            _ => None,
        };
        let (config, sources) = Config::parse_str_with(toml, lookup).unwrap();
        assert_eq!(
            config.upstream.api_keys[0].expose_secret(),
            "expanded-key-0001"
        );
        assert_eq!(sources[0].1, KeySource::EnvExpanded);
        assert_eq!(sources[1].1, KeySource::Literal);
    }

    #[test]
    fn test_keys_fall_back_to_convention_var() {
        let lookup = |name: &str| match name {
            KEYS_ENV_VAR => Some(" key-one-1111 , ,key-two-2222,".to_string()),
            _ => None,
        };
        let (config, sources) = Config::parse_str_with("", lookup).unwrap();
        assert_eq!(config.upstream.api_keys.len(), 2);
        assert_eq!(config.upstream.api_keys[1].expose_secret(), "key-two-2222");
        assert_eq!(
            sources[0].1,
            KeySource::Convention(KEYS_ENV_VAR.to_string())
        );
    }

    #[test]
    fn test_auth_secret_falls_back_to_env() {
        let lookup = |name: &str| match name {
            AUTH_ENV_VAR => Some("from-env".to_string()),
            _ => None,
        };
        let (config, _) = Config::parse_str_with("", lookup).unwrap();
        assert_eq!(
            config.auth.secret.as_ref().unwrap().expose_secret(),
            "from-env"
        );
    }

    #[test]
    fn test_split_key_list() {
        assert_eq!(split_key_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_key_list(" , ").is_empty());
    }
}
