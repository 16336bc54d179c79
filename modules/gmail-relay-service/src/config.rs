//! Relay configuration, read from the environment (after `.env`).

use gmail_relay_types::{HookSettings, DEFAULT_MAX_BODY_BYTES};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// What to do with the provider's notification when the hook fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Advance the cursor before delivery and always acknowledge.
    Acknowledge,
    /// Advance only after a 2xx from the hook; otherwise ask for redelivery.
    Redeliver,
}

impl AckPolicy {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "ack" | "acknowledge" => Ok(AckPolicy::Acknowledge),
            "redeliver" => Ok(AckPolicy::Redeliver),
            other => Err(format!(
                "GMAIL_RELAY_ACK_POLICY must be 'ack' or 'redeliver', got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub enabled: bool,
    pub expected_email: Option<String>,
    pub audience: Option<String>,
    pub jwks_url: String,
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
    pub path: String,
    pub oidc: OidcSettings,
    pub shared_token: Option<String>,
    pub hook: Option<HookSettings>,
    /// Body options used when no hook is configured (diagnostic echo).
    pub include_body: bool,
    pub max_bytes: usize,
    pub save_hook: bool,
    pub history_max_results: u32,
    pub resync_max_results: u32,
    pub hook_timeout: Duration,
    /// Deadline for a client to finish sending request headers.
    pub header_timeout: Duration,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub echo_payload: bool,
    pub ack_policy: AckPolicy,
}

impl ServeConfig {
    pub fn listen_addr(&self) -> String {
        if self.bind.contains(':') && !self.bind.starts_with('[') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }

    pub fn has_auth(&self) -> bool {
        self.oidc.enabled || self.shared_token.is_some()
    }
}

/// Inputs for the `start`/`renew` lifecycle verbs.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub topic: Option<String>,
    pub labels: Vec<String>,
    pub ttl: Option<Duration>,
    pub renew_after: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub account: String,
    pub state_dir: PathBuf,
    pub access_token: Option<String>,
    pub api_base: String,
    pub serve: ServeConfig,
    pub watch: WatchSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests can avoid the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let account = get("GMAIL_RELAY_ACCOUNT").ok_or("GMAIL_RELAY_ACCOUNT must be set")?;

        let include_body = parse_bool(&get, "GMAIL_RELAY_INCLUDE_BODY", false)?;
        let max_bytes = parse_num(&get, "GMAIL_RELAY_MAX_BYTES", DEFAULT_MAX_BODY_BYTES)?;
        let hook = get("GMAIL_RELAY_HOOK_URL").map(|url| HookSettings {
            url,
            token: get("GMAIL_RELAY_HOOK_TOKEN"),
            include_body,
            max_bytes,
        });

        let serve = ServeConfig {
            bind: get("GMAIL_RELAY_BIND").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_num(&get, "GMAIL_RELAY_PORT", 8788)?,
            path: normalize_path(&get("GMAIL_RELAY_PATH").unwrap_or_else(|| "/gmail-pubsub".into())),
            oidc: OidcSettings {
                enabled: parse_bool(&get, "GMAIL_RELAY_VERIFY_OIDC", false)?,
                expected_email: get("GMAIL_RELAY_OIDC_EMAIL"),
                audience: get("GMAIL_RELAY_OIDC_AUDIENCE"),
                jwks_url: get("GMAIL_RELAY_OIDC_JWKS_URL")
                    .unwrap_or_else(|| GOOGLE_JWKS_URL.to_string()),
            },
            shared_token: get("GMAIL_RELAY_TOKEN"),
            hook,
            include_body,
            max_bytes,
            save_hook: parse_bool(&get, "GMAIL_RELAY_SAVE_HOOK", false)?,
            history_max_results: parse_num(&get, "GMAIL_RELAY_HISTORY_MAX", 100)?,
            resync_max_results: parse_num(&get, "GMAIL_RELAY_RESYNC_MAX", 10)?,
            hook_timeout: Duration::from_secs(parse_num(&get, "GMAIL_RELAY_HOOK_TIMEOUT_SECS", 10)?),
            header_timeout: Duration::from_secs(parse_num(&get, "GMAIL_RELAY_HEADER_TIMEOUT_SECS", 10)?),
            request_timeout: Duration::from_secs(parse_num(
                &get,
                "GMAIL_RELAY_REQUEST_TIMEOUT_SECS",
                30,
            )?),
            max_body_bytes: parse_num(&get, "GMAIL_RELAY_MAX_BODY_BYTES", 1024 * 1024)?,
            echo_payload: parse_bool(&get, "GMAIL_RELAY_ECHO_PAYLOAD", false)?,
            ack_policy: AckPolicy::parse(&get("GMAIL_RELAY_ACK_POLICY").unwrap_or_default())?,
        };

        let watch = WatchSettings {
            topic: get("GMAIL_RELAY_TOPIC"),
            labels: get("GMAIL_RELAY_LABELS")
                .map(|raw| {
                    raw.split(',')
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            ttl: get("GMAIL_RELAY_TTL_SECS")
                .map(|raw| {
                    raw.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| format!("GMAIL_RELAY_TTL_SECS must be a number, got '{}'", raw))
                })
                .transpose()?,
            renew_after: Duration::from_secs(
                60 * parse_num::<u64, _>(&get, "GMAIL_RELAY_RENEW_AFTER_MINUTES", 720)?,
            ),
        };

        let config = Self {
            account,
            state_dir: PathBuf::from(
                get("GMAIL_RELAY_STATE_DIR").unwrap_or_else(|| "./.gmail-relay/watch".to_string()),
            ),
            access_token: get("GMAIL_ACCESS_TOKEN"),
            api_base: get("GMAIL_API_BASE")
                .unwrap_or_else(|| DEFAULT_GMAIL_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            serve,
            watch,
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup-time checks. An unauthenticated relay may only listen on loopback.
    pub fn validate(&self) -> Result<(), String> {
        let serve = &self.serve;
        if !serve.has_auth() && !is_loopback_bind(&serve.bind) {
            return Err(format!(
                "refusing to bind {} without authentication: set GMAIL_RELAY_VERIFY_OIDC=true or GMAIL_RELAY_TOKEN",
                serve.bind
            ));
        }
        if let Some(hook) = &serve.hook {
            if !(hook.url.starts_with("http://") || hook.url.starts_with("https://")) {
                return Err(format!("GMAIL_RELAY_HOOK_URL must be http(s), got '{}'", hook.url));
            }
        }
        if serve.history_max_results == 0 || serve.resync_max_results == 0 {
            return Err("GMAIL_RELAY_HISTORY_MAX and GMAIL_RELAY_RESYNC_MAX must be > 0".into());
        }
        if serve.max_body_bytes == 0 {
            return Err("GMAIL_RELAY_MAX_BODY_BYTES must be > 0".into());
        }
        if serve.max_bytes == 0 {
            return Err("GMAIL_RELAY_MAX_BYTES must be > 0".into());
        }
        if serve.header_timeout.is_zero() || serve.request_timeout.is_zero() {
            return Err(
                "GMAIL_RELAY_HEADER_TIMEOUT_SECS and GMAIL_RELAY_REQUEST_TIMEOUT_SECS must be > 0".into(),
            );
        }
        Ok(())
    }
}

/// `localhost`, `127.0.0.0/8` and `::1` count as loopback. Anything else,
/// including `0.0.0.0`, does not.
pub fn is_loopback_bind(bind: &str) -> bool {
    let host = bind.trim().trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

fn normalize_path(raw: &str) -> String {
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, String>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(format!("{} must be a boolean, got '{}'", key, raw)),
        },
    }
}

fn parse_num<T, G>(get: &G, key: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("{} must be a number, got '{}'", key, raw)),
    }
}
