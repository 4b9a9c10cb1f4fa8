use crate::config::{Settings, DEFAULT_MAX_BODY_BYTES};
use crate::read_body_capped;
use html_scraper::{Html, Selector};
use pagewire_core::{Error, Result, SearchProvider, SearchRequest, SearchResult, ToolReply};
use percent_encoding::percent_decode_str;
use std::time::Instant;

// Markup contract of the lightweight results page. A layout change there breaks these.
const RESULT_SELECTOR: &str = "div.result";
const TITLE_LINK_SELECTOR: &str = "a.result__a";
const SNIPPET_SELECTOR: &str = ".result__snippet";

const REDIRECT_HOST: &str = "duckduckgo.com";
const REDIRECT_PATH: &str = "/l/?";
const WRAPPED_PARAM: &str = "uddg=";
const TRACKING_MARKER: &str = "&rut=";

/// Scrapes DuckDuckGo's HTML results page.
#[derive(Debug, Clone)]
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    endpoint: String,
    user_agent: String,
    max_body_bytes: usize,
}

impl DuckDuckGoSearch {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            user_agent: user_agent.into(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Cap on how much of a results page is read.
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(
            settings.http_client()?,
            settings.search_endpoint.clone(),
            settings.user_agent.clone(),
        )
        .with_max_body_bytes(settings.max_body_bytes))
    }
}

/// Resolve a redirect-wrapper link (`//duckduckgo.com/l/?uddg=<encoded>&rut=<token>`) to its
/// destination. Anything else comes back unchanged.
pub fn canonicalize_url(href: &str) -> String {
    let href = href.trim();
    let Some(query) = href
        .find(REDIRECT_PATH)
        .filter(|&i| is_redirect_host(&href[..i]))
        .map(|i| &href[i + REDIRECT_PATH.len()..])
    else {
        return href.to_string();
    };
    let Some(wrapped) = query
        .split('&')
        .find_map(|kv| kv.strip_prefix(WRAPPED_PARAM))
    else {
        return href.to_string();
    };
    let decoded = percent_decode_str(wrapped).decode_utf8_lossy().into_owned();
    match decoded.find(TRACKING_MARKER) {
        Some(i) => decoded[..i].to_string(),
        None => decoded,
    }
}

/// Whatever precedes `/l/?` must be empty (a relative link) or name a DuckDuckGo host,
/// scheme-relative or absolute.
fn is_redirect_host(prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let rest = prefix
        .strip_prefix("https:")
        .or_else(|| prefix.strip_prefix("http:"))
        .unwrap_or(prefix);
    let Some(authority) = rest.strip_prefix("//") else {
        return false;
    };
    let host = authority.split(':').next().unwrap_or("").to_ascii_lowercase();
    host == REDIRECT_HOST || host.ends_with(&format!(".{REDIRECT_HOST}"))
}

fn element_text(el: &html_scraper::ElementRef) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pull result records out of a results page, in page order.
///
/// At most `limit` containers are examined; containers lacking a title or link are dropped
/// rather than replaced, so fewer than `limit` records may come back.
pub fn parse_results(html: &str, limit: usize) -> Vec<SearchResult> {
    let doc = Html::parse_document(html);
    let (Ok(result_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse(RESULT_SELECTOR),
        Selector::parse(TITLE_LINK_SELECTOR),
        Selector::parse(SNIPPET_SELECTOR),
    ) else {
        return Vec::new();
    };

    doc.select(&result_sel)
        .take(limit)
        .filter_map(|container| {
            let link = container.select(&link_sel).next()?;
            let title = element_text(&link);
            let href = link.value().attr("href").unwrap_or("").trim();
            if title.is_empty() || href.is_empty() {
                return None;
            }
            let description = container
                .select(&snippet_sel)
                .next()
                .map(|el| element_text(&el))
                .unwrap_or_default();
            Some(SearchResult {
                title,
                url: canonicalize_url(href),
                description,
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl SearchProvider for DuckDuckGoSearch {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(&self, req: &SearchRequest) -> Result<Vec<SearchResult>> {
        req.validate()?;
        let t0 = Instant::now();
        let resp = self
            .client
            .get(&self.endpoint)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .query(&[("q", req.query.as_str())])
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("duckduckgo search HTTP {status}")));
        }
        let (body, truncated) = read_body_capped(resp, self.max_body_bytes)
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        if truncated {
            tracing::warn!(cap = self.max_body_bytes, "search results page truncated");
        }

        let results = parse_results(&String::from_utf8_lossy(&body), req.result_limit);
        tracing::info!(
            provider = self.name(),
            results = results.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "search done"
        );
        Ok(results)
    }
}

/// Run a search and package it as a reply: one text block holding the JSON array, or an
/// error-flagged block. Only validation errors come back as `Err`.
pub async fn search_reply(provider: &dyn SearchProvider, req: &SearchRequest) -> Result<ToolReply> {
    req.validate()?;
    match provider.search(req).await {
        Ok(results) => match serde_json::to_string_pretty(&results) {
            Ok(json) => Ok(ToolReply::text(json)),
            Err(e) => Ok(ToolReply::error(format!(
                "Search failed: could not serialize results: {e}"
            ))),
        },
        Err(e) if e.is_recoverable() => {
            tracing::warn!(provider = provider.name(), error = %e, "search failed");
            Ok(ToolReply::error(format!("Search failed: {}", e.message())))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Query,
        http::{header, HeaderMap, StatusCode},
        response::Html as AxumHtml,
        routing::get,
        Router,
    };
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn result_block(href: &str, title: &str, snippet: &str) -> String {
        format!(
            r#"<div class="result results_links results_links_deep web-result">
                 <div class="links_main links_deep result__body">
                   <h2 class="result__title"><a rel="nofollow" class="result__a" href="{href}">{title}</a></h2>
                   <a class="result__snippet" href="{href}">{snippet}</a>
                 </div>
               </div>"#
        )
    }

    fn page(blocks: &[String]) -> String {
        format!(
            r#"<!DOCTYPE html><html><head><title>q at DuckDuckGo</title></head>
               <body><div id="links" class="results">{}</div></body></html>"#,
            blocks.concat()
        )
    }

    fn three_results() -> String {
        page(&[
            result_block(
                "//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&amp;rut=abc123",
                "Rust <b>Programming</b> Language",
                "A language empowering everyone.",
            ),
            result_block(
                "https://doc.rust-lang.org/book/",
                "The Rust Book",
                "Learn <b>Rust</b> from first principles.",
            ),
            result_block(
                "//duckduckgo.com/l/?uddg=https%3A%2F%2Fen.wikipedia.org%2Fwiki%2FRust_(programming_language)%3Fa%3D1%26b%3D2&amp;rut=def",
                "Rust - Wikipedia",
                "",
            ),
        ])
    }

    #[test]
    fn canonicalizes_redirect_wrapper_and_strips_tracking() {
        assert_eq!(
            canonicalize_url("//duckduckgo.com/l/?uddg=https%3A%2F%2Fex.com%2Fp&rut=abc"),
            "https://ex.com/p"
        );
        assert_eq!(
            canonicalize_url("https://duckduckgo.com/l/?uddg=https%3A%2F%2Fex.com%2Fp&rut=abc"),
            "https://ex.com/p"
        );
        // Tracking marker that survived inside the encoded value is cut too.
        assert_eq!(
            canonicalize_url("//duckduckgo.com/l/?uddg=https%3A%2F%2Fex.com%2Fp%26rut%3Dabc"),
            "https://ex.com/p"
        );
    }

    #[test]
    fn canonicalize_keeps_destination_query_params() {
        assert_eq!(
            canonicalize_url("//duckduckgo.com/l/?uddg=https%3A%2F%2Fex.com%2F%3Fa%3D1%26b%3D2&rut=x"),
            "https://ex.com/?a=1&b=2"
        );
    }

    #[test]
    fn canonicalize_leaves_plain_links_alone() {
        assert_eq!(
            canonicalize_url(" https://example.com/a?b=c "),
            "https://example.com/a?b=c"
        );
        // Redirect path without the wrapped parameter is not a wrapper.
        assert_eq!(
            canonicalize_url("//duckduckgo.com/l/?kh=-1"),
            "//duckduckgo.com/l/?kh=-1"
        );
    }

    #[test]
    fn canonicalize_only_unwraps_duckduckgo_redirects() {
        // Same path shape on an unrelated site is a real destination.
        assert_eq!(
            canonicalize_url("https://example.org/l/?uddg=abc"),
            "https://example.org/l/?uddg=abc"
        );
        assert_eq!(
            canonicalize_url("https://notduckduckgo.com/l/?uddg=abc"),
            "https://notduckduckgo.com/l/?uddg=abc"
        );
        assert_eq!(
            canonicalize_url("https://example.org/duckduckgo.com/l/?uddg=abc"),
            "https://example.org/duckduckgo.com/l/?uddg=abc"
        );
        // Relative links and DuckDuckGo subdomains still unwrap.
        assert_eq!(
            canonicalize_url("/l/?uddg=https%3A%2F%2Fex.com%2Fp&rut=abc"),
            "https://ex.com/p"
        );
        assert_eq!(
            canonicalize_url("https://html.duckduckgo.com/l/?uddg=https%3A%2F%2Fex.com%2Fp"),
            "https://ex.com/p"
        );
    }

    #[test]
    fn parses_results_in_page_order() {
        let results = parse_results(&three_results(), 5);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].title, "Rust Programming Language");
        assert_eq!(results[0].url, "https://www.rust-lang.org/");
        assert_eq!(results[0].description, "A language empowering everyone.");
        assert_eq!(results[1].url, "https://doc.rust-lang.org/book/");
        assert_eq!(results[1].description, "Learn Rust from first principles.");
        assert_eq!(
            results[2].url,
            "https://en.wikipedia.org/wiki/Rust_(programming_language)?a=1&b=2"
        );
        assert_eq!(results[2].description, "");
    }

    #[test]
    fn limit_caps_results() {
        let results = parse_results(&three_results(), 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].title, "The Rust Book");
    }

    #[test]
    fn records_without_title_or_link_are_dropped() {
        let html = page(&[
            result_block("https://a.example/", "", "no title"),
            r#"<div class="result"><a class="result__snippet">orphan snippet</a></div>"#
                .to_string(),
            result_block("", "No link", "x"),
            result_block("https://b.example/", "Kept", "y"),
        ]);
        let results = parse_results(&html, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Kept");
    }

    #[test]
    fn no_containers_is_empty_not_error() {
        assert!(parse_results("<html><body><p>No results.</p></body></html>", 5).is_empty());
        assert!(parse_results("", 5).is_empty());
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn provider_for(addr: SocketAddr) -> DuckDuckGoSearch {
        let settings = Settings {
            search_endpoint: format!("http://{addr}/html/"),
            ..Settings::default()
        };
        DuckDuckGoSearch::from_settings(&settings).unwrap()
    }

    #[tokio::test]
    async fn sends_query_and_browser_user_agent() {
        let app = Router::new().route(
            "/html/",
            get(
                |Query(q): Query<HashMap<String, String>>, headers: HeaderMap| async move {
                    let ua = headers
                        .get(header::USER_AGENT)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("");
                    if !ua.starts_with("Mozilla/5.0") {
                        return (StatusCode::FORBIDDEN, AxumHtml(String::new()));
                    }
                    if q.get("q").map(String::as_str) != Some("rust & friends") {
                        return (StatusCode::BAD_REQUEST, AxumHtml(String::new()));
                    }
                    (StatusCode::OK, AxumHtml(three_results()))
                },
            ),
        );
        let addr = serve(app).await;
        let results = provider_for(addr)
            .search(&SearchRequest::new("rust & friends").with_limit(2))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://www.rust-lang.org/");
    }

    #[tokio::test]
    async fn search_reply_serializes_results_as_one_text_block() {
        let app = Router::new().route("/html/", get(|| async { AxumHtml(three_results()) }));
        let addr = serve(app).await;
        let provider = provider_for(addr);
        let reply = search_reply(&provider, &SearchRequest::new("test").with_limit(2))
            .await
            .unwrap();
        assert!(!reply.is_error);
        assert_eq!(reply.content.len(), 1);
        let parsed: Vec<SearchResult> = serde_json::from_str(reply.first_text()).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn http_failure_becomes_error_block() {
        let app = Router::new().route(
            "/html/",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let addr = serve(app).await;
        let provider = provider_for(addr);
        let reply = search_reply(&provider, &SearchRequest::new("test"))
            .await
            .unwrap();
        assert!(reply.is_error);
        assert!(reply.first_text().contains("503"), "{}", reply.first_text());
    }

    #[tokio::test]
    async fn oversized_results_page_is_read_up_to_the_cap() {
        use axum::body::{Body, Bytes};
        use futures_util::{stream, StreamExt};

        let cap = 64 * 1024;
        let app = Router::new().route(
            "/html/",
            get(|| async {
                // Results first, then padding that never ends.
                let head = three_results().replace("</body></html>", "<div class=\"result\"><p>");
                let padding = Bytes::from(vec![b'x'; 16 * 1024]);
                let body = stream::iter([Ok::<_, std::io::Error>(Bytes::from(head))])
                    .chain(stream::repeat_with(move || Ok(padding.clone())));
                Body::from_stream(body)
            }),
        );
        let addr = serve(app).await;
        let settings = Settings {
            search_endpoint: format!("http://{addr}/html/"),
            max_body_bytes: cap,
            ..Settings::default()
        };
        let provider = DuckDuckGoSearch::from_settings(&settings).unwrap();
        let results = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            provider.search(&SearchRequest::new("big").with_limit(5)),
        )
        .await
        .expect("capped read must finish")
        .unwrap();
        // The padded container has no link, so only the real records survive.
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].url, "https://www.rust-lang.org/");
    }

    #[tokio::test]
    async fn empty_query_is_a_validation_error() {
        let provider = DuckDuckGoSearch::from_settings(&Settings::default()).unwrap();
        let err = search_reply(&provider, &SearchRequest::new("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
