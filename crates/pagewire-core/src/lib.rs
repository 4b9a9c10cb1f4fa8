use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A required field is missing or malformed. Raised before any IO.
    #[error("invalid params: {0}")]
    Validation(String),
    #[error("rendered retrieval failed: {0}")]
    Render(String),
    #[error("direct retrieval failed: {0}")]
    Fetch(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Reachability/backend failures are reported to the caller as flagged content;
    /// everything else is a protocol-level fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Render(_) | Self::Fetch(_) | Self::Search(_) | Self::NotConfigured(_)
        )
    }

    /// The detail text without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Validation(m)
            | Self::Render(m)
            | Self::Fetch(m)
            | Self::Search(m)
            | Self::NotConfigured(m)
            | Self::UnknownOperation(m)
            | Self::NotFound(m) => m,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// When a rendered navigation counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    /// No in-flight network requests for a quiet window.
    #[default]
    NetworkIdle,
    /// Initial DOM parse complete.
    DomContentLoaded,
}

impl WaitPolicy {
    /// The `waitUntil` token understood by Puppeteer.
    pub fn as_puppeteer(self) -> &'static str {
        match self {
            Self::NetworkIdle => "networkidle0",
            Self::DomContentLoaded => "domcontentloaded",
        }
    }
}

impl std::str::FromStr for WaitPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "networkidle" | "networkidle0" | "idle" => Ok(Self::NetworkIdle),
            "domcontentloaded" | "dom" => Ok(Self::DomContentLoaded),
            other => Err(Error::Validation(format!(
                "unknown wait policy {other:?} (expected networkidle or domcontentloaded)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderOptions {
    pub headless: bool,
    /// Extra browser launch arguments, in order.
    pub args: Vec<String>,
    pub wait: WaitPolicy,
    pub timeout_ms: u64,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            headless: false,
            args: Vec::new(),
            wait: WaitPolicy::default(),
            timeout_ms: 30_000,
        }
    }
}

impl RenderOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Split a flags string (`"--no-sandbox --lang=en"`) into launch arguments.
    pub fn split_flags(flags: &str) -> Vec<String> {
        flags.split_whitespace().map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// Try the headless browser first, falling back to a direct GET.
    pub use_rendered_retrieval: bool,
    pub renderer_flags: Vec<String>,
    pub render_headless: bool,
    /// Return the page markup untouched instead of normalized text.
    pub return_raw: bool,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            use_rendered_retrieval: true,
            renderer_flags: Vec::new(),
            render_headless: false,
            return_raw: false,
        }
    }

    /// Checks the url is present and absolute. Never touches the network.
    pub fn validate(&self) -> Result<url::Url> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(Error::Validation("url must be non-empty".to_string()));
        }
        let parsed =
            url::Url::parse(url).map_err(|e| Error::Validation(format!("invalid url: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            other => Err(Error::Validation(format!(
                "unsupported url scheme {other:?} (expected http or https)"
            ))),
        }
    }
}

pub const DEFAULT_RESULT_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub result_limit: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            result_limit: DEFAULT_RESULT_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.result_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::Validation("query must be non-empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    /// Destination URL, never a provider redirect wrapper.
    pub url: String,
    pub description: String,
}

/// Unit of textual payload handed back to the calling agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Self::Text { text } => text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolReply {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: true,
        }
    }

    pub fn first_text(&self) -> &str {
        self.content.first().map(ContentBlock::as_text).unwrap_or("")
    }
}

/// Headless-browser page acquisition: returns the final DOM markup.
#[async_trait::async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str, opts: &RenderOptions) -> Result<String>;
}

/// Single unscripted GET returning the response body as text.
#[async_trait::async_trait]
pub trait RawFetcher: Send + Sync {
    async fn fetch_raw(&self, url: &str) -> Result<String>;
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, req: &SearchRequest) -> Result<Vec<SearchResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_request_defaults_prefer_rendered_retrieval() {
        let r = FetchRequest::new("https://example.com");
        assert!(r.use_rendered_retrieval);
        assert!(!r.render_headless);
        assert!(!r.return_raw);
        assert!(r.renderer_flags.is_empty());
    }

    #[test]
    fn fetch_request_validation_rejects_missing_and_relative_urls() {
        assert!(matches!(
            FetchRequest::new("").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            FetchRequest::new("   ").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            FetchRequest::new("/just/a/path").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            FetchRequest::new("file:///etc/passwd").validate(),
            Err(Error::Validation(_))
        ));
        let u = FetchRequest::new(" https://example.com/a ").validate().unwrap();
        assert_eq!(u.as_str(), "https://example.com/a");
    }

    #[test]
    fn split_flags_is_whitespace_split() {
        assert_eq!(
            RenderOptions::split_flags("  --no-sandbox\t--lang=en  \n--disable-gpu "),
            vec!["--no-sandbox", "--lang=en", "--disable-gpu"]
        );
        assert!(RenderOptions::split_flags("").is_empty());
    }

    #[test]
    fn wait_policy_parses_both_spellings() {
        assert_eq!("networkidle".parse::<WaitPolicy>().unwrap(), WaitPolicy::NetworkIdle);
        assert_eq!(
            "DOMContentLoaded".parse::<WaitPolicy>().unwrap(),
            WaitPolicy::DomContentLoaded
        );
        assert!("load".parse::<WaitPolicy>().is_err());
        assert_eq!(WaitPolicy::NetworkIdle.as_puppeteer(), "networkidle0");
    }

    #[test]
    fn search_request_requires_query() {
        assert!(SearchRequest::new("").validate().is_err());
        assert!(SearchRequest::new("rust").validate().is_ok());
        assert_eq!(SearchRequest::new("rust").result_limit, 5);
    }

    #[test]
    fn content_blocks_serialize_with_type_tag() {
        let reply = ToolReply::error("boom");
        let v = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "content": [{"type": "text", "text": "boom"}],
                "isError": true
            })
        );
        assert_eq!(reply.first_text(), "boom");
    }

    #[test]
    fn only_backend_failures_are_recoverable() {
        assert!(Error::Render("x".into()).is_recoverable());
        assert!(Error::Fetch("x".into()).is_recoverable());
        assert!(!Error::Validation("x".into()).is_recoverable());
        assert!(!Error::UnknownOperation("x".into()).is_recoverable());
    }
}
