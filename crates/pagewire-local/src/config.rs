//! Environment-driven settings, read once at startup and passed down explicitly.

use pagewire_core::WaitPolicy;
use std::time::Duration;

pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
pub const DEFAULT_MAX_BODY_BYTES: usize = 10_000_000;

/// The results endpoint serves its lightweight markup only to clients that look like a
/// desktop browser.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct Settings {
    pub search_endpoint: String,
    pub user_agent: String,
    pub direct_timeout_ms: u64,
    /// Hard cap on bytes read from a direct response body.
    pub max_body_bytes: usize,
    pub render_timeout_ms: u64,
    pub render_wait: WaitPolicy,
    pub render_headless: bool,
    pub render_disabled: bool,
    pub node_bin: String,
    pub node_path: Option<String>,
    pub max_text_chars: usize,
    pub text_width: usize,
    pub drop_chrome: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            search_endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            direct_timeout_ms: 20_000,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            render_timeout_ms: 30_000,
            render_wait: WaitPolicy::NetworkIdle,
            render_headless: false,
            render_disabled: false,
            node_bin: "node".to_string(),
            node_path: None,
            max_text_chars: 300_000,
            text_width: 100,
            drop_chrome: false,
        }
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env(key) {
        Some(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env(key).map(|s| s.parse::<T>()) {
        Some(Ok(v)) => v,
        Some(Err(_)) => {
            tracing::warn!(key, "ignoring unparseable setting, using default");
            default
        }
        None => default,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        let render_wait = match env("PAGEWIRE_RENDER_WAIT").map(|s| s.parse::<WaitPolicy>()) {
            Some(Ok(w)) => w,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "ignoring PAGEWIRE_RENDER_WAIT");
                d.render_wait
            }
            None => d.render_wait,
        };
        Self {
            search_endpoint: env("PAGEWIRE_SEARCH_ENDPOINT").unwrap_or(d.search_endpoint),
            user_agent: env("PAGEWIRE_USER_AGENT").unwrap_or(d.user_agent),
            direct_timeout_ms: env_parse("PAGEWIRE_DIRECT_TIMEOUT_MS", d.direct_timeout_ms)
                .clamp(1_000, 120_000),
            max_body_bytes: env_parse("PAGEWIRE_MAX_BODY_BYTES", d.max_body_bytes),
            render_timeout_ms: env_parse("PAGEWIRE_RENDER_TIMEOUT_MS", d.render_timeout_ms)
                .clamp(1_000, 300_000),
            render_wait,
            render_headless: env_bool("PAGEWIRE_RENDER_HEADLESS", d.render_headless),
            render_disabled: env_bool("PAGEWIRE_RENDER_DISABLE", d.render_disabled),
            node_bin: env("PAGEWIRE_NODE").unwrap_or(d.node_bin),
            node_path: env("PAGEWIRE_NODE_PATH"),
            max_text_chars: env_parse("PAGEWIRE_MAX_TEXT_CHARS", d.max_text_chars),
            text_width: env_parse("PAGEWIRE_TEXT_WIDTH", d.text_width).clamp(20, 1_000),
            drop_chrome: env_bool("PAGEWIRE_DROP_CHROME", d.drop_chrome),
        }
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms)
    }

    pub fn normalize_options(&self) -> crate::normalize::NormalizeOptions {
        crate::normalize::NormalizeOptions {
            width: self.text_width,
            max_chars: self.max_text_chars,
            drop_chrome: self.drop_chrome,
        }
    }

    /// Shared reqwest client for direct retrieval and search.
    pub fn http_client(&self) -> pagewire_core::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            // Avoid hanging forever on DNS/TLS/body stalls.
            .connect_timeout(Duration::from_secs(10))
            .timeout(self.direct_timeout())
            .build()
            .map_err(|e| pagewire_core::Error::NotConfigured(format!("http client: {e}")))
    }
}
