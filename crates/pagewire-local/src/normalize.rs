use std::io::Cursor;

/// Elements whose subtrees never carry visible text.
const INVISIBLE: &str = "script, style, noscript, template";
/// Page chrome dropped when `drop_chrome` is set.
const CHROME: &str = "nav, header, footer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Wrap width for the markdown-ish renderer.
    pub width: usize,
    /// Upper bound on normalized output, in chars. Raw output is never bounded.
    pub max_chars: usize,
    pub drop_chrome: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            width: 100,
            max_chars: 300_000,
            drop_chrome: false,
        }
    }
}

/// Convert an HTML document to text.
///
/// `raw = true` is a passthrough. Otherwise block elements become line breaks, headings and
/// emphasis keep markdown markers, and links render as their text. Malformed markup degrades
/// to best-effort text; this never fails.
pub fn normalize(html: &str, raw: bool) -> String {
    normalize_with(html, raw, &NormalizeOptions::default())
}

pub fn normalize_with(html: &str, raw: bool, opts: &NormalizeOptions) -> String {
    if raw {
        return html.to_string();
    }
    let cleaned = strip_subtrees(html, opts.drop_chrome);
    let rendered = html_to_text(&cleaned, opts.width);
    let text = if has_any_text(&rendered) {
        tidy_lines(&rendered)
    } else {
        // The renderer gave up or produced nothing; take the bare text nodes instead.
        visible_text(&cleaned)
    };
    truncate_to_chars(&text, opts.max_chars)
}

/// Markdown-flavoured plain text via html2text.
pub fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width.max(20)).unwrap_or_default()
}

fn has_any_text(s: &str) -> bool {
    s.chars().any(|c| !c.is_whitespace())
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Re-serialize the document without invisible (and optionally chrome) subtrees.
///
/// The HTML5 parser never rejects input, so unclosed tags and unknown elements come back
/// balanced here.
fn strip_subtrees(html: &str, drop_chrome: bool) -> String {
    let mut doc = html_scraper::Html::parse_document(html);
    let selector = if drop_chrome {
        format!("{INVISIBLE}, {CHROME}")
    } else {
        INVISIBLE.to_string()
    };
    let Ok(sel) = html_scraper::Selector::parse(&selector) else {
        return html.to_string();
    };
    let ids: Vec<_> = doc.select(&sel).map(|el| el.id()).collect();
    if ids.is_empty() {
        return html.to_string();
    }
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
    doc.html()
}

fn visible_text(html: &str) -> String {
    let doc = html_scraper::Html::parse_document(html);
    let joined = doc.root_element().text().collect::<Vec<_>>().join(" ");
    norm_ws(&joined)
}

/// Trim line ends and squeeze runs of blank lines down to one.
fn tidy_lines(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0usize;
    for line in s.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

fn truncate_to_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte, _)) => s[..byte].to_string(),
        None => s.to_string(),
    }
}
