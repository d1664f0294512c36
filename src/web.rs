//! Web tools: Brave-backed search, and a page fetcher gated by the
//! allow-list of URLs that have entered the conversation legitimately
//! (user messages and prior search results). The allow-list is in-memory
//! only; a restart clears it.

use std::collections::HashSet;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{extract_urls, Config};

const MAX_PAGE_BYTES: u64 = 500_000;
const USER_AGENT: &str = "Mozilla/5.0 (compatible; OutpostAgent/0.3)";

// ── Allow-list ───────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub(crate) struct AllowedUrls {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl AllowedUrls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, url: &str) {
        if let Ok(mut set) = self.inner.lock() {
            set.insert(url.trim().to_string());
        }
    }

    pub(crate) fn register_from_text(&self, text: &str) {
        for url in extract_urls(text) {
            self.register(&url);
        }
    }

    pub(crate) fn contains(&self, url: &str) -> bool {
        self.inner
            .lock()
            .map(|set| set.contains(url.trim()))
            .unwrap_or(false)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map(|set| set.len()).unwrap_or(0)
    }
}

// ── Search ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct WebResult {
    pub(crate) title: String,
    pub(crate) url: String,
    pub(crate) description: String,
}

fn agent(config: &Config) -> ureq::Agent {
    let timeout = Duration::from_secs(config.web_timeout_secs);
    ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .timeout_write(timeout)
        .build()
}

pub(crate) fn web_search(
    config: &Config,
    query: &str,
    count: usize,
) -> Result<Vec<WebResult>, String> {
    brave_search(config, "web/search", "web", query, count)
}

pub(crate) fn news_search(
    config: &Config,
    query: &str,
    count: usize,
) -> Result<Vec<WebResult>, String> {
    brave_search(config, "news/search", "results", query, count)
}

fn brave_search(
    config: &Config,
    endpoint: &str,
    results_key: &str,
    query: &str,
    count: usize,
) -> Result<Vec<WebResult>, String> {
    let api_key = config
        .brave_api_key
        .as_ref()
        .ok_or("web search is not configured (missing BRAVE_API_KEY)")?;
    let url = format!(
        "https://api.search.brave.com/res/v1/{endpoint}?q={}&count={}",
        urlencoding::encode(query),
        count.clamp(1, 20)
    );
    let response = agent(config)
        .get(&url)
        .set("accept", "application/json")
        .set("x-subscription-token", api_key)
        .call()
        .map_err(|e| format!("search request failed: {e}"))?;
    let payload: serde_json::Value = response
        .into_json()
        .map_err(|e| format!("search response: {e}"))?;
    Ok(parse_brave_results(&payload, results_key))
}

/// Brave nests web hits under `web.results` and news hits under `results`.
pub(crate) fn parse_brave_results(payload: &serde_json::Value, key: &str) -> Vec<WebResult> {
    let results = payload
        .get(key)
        .and_then(|section| section.get("results"))
        .or_else(|| payload.get("results"))
        .and_then(|v| v.as_array());
    let Some(results) = results else {
        return Vec::new();
    };
    results
        .iter()
        .filter_map(|item| {
            let url = item.get("url").and_then(|v| v.as_str())?;
            Some(WebResult {
                title: item
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(untitled)")
                    .to_string(),
                url: url.to_string(),
                description: item
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            })
        })
        .collect()
}

pub(crate) fn format_results(results: &[WebResult]) -> String {
    if results.is_empty() {
        return "No results.".to_string();
    }
    let mut out = String::new();
    for (i, r) in results.iter().enumerate() {
        out.push_str(&format!("{}. {}\n   {}\n   {}\n", i + 1, r.title, r.url, r.description));
    }
    out
}

// ── Fetch ────────────────────────────────────────────────────────────────

/// Fetch a page that has already cleared the allow-list check. With
/// `wait_for_js` and a configured rendering service, the page goes through
/// the renderer; otherwise it's a plain GET capped at MAX_PAGE_BYTES.
pub(crate) fn fetch_page(config: &Config, url: &str, wait_for_js: bool) -> Result<String, String> {
    if wait_for_js {
        if let Some(render_url) = &config.render_url {
            let response = agent(config)
                .post(render_url)
                .set("content-type", "application/json")
                .send_json(serde_json::json!({"url": url, "wait_for_js": true}))
                .map_err(|e| format!("render request failed: {e}"))?;
            return response
                .into_string()
                .map_err(|e| format!("render response: {e}"));
        }
        eprintln!("[web] wait_for_js requested but no renderer configured; plain fetch");
    }

    let response = agent(config)
        .get(url)
        .set("user-agent", USER_AGENT)
        .call()
        .map_err(|e| format!("fetch failed: {e}"))?;
    let content_type = response.content_type().to_string();
    let mut body = String::new();
    response
        .into_reader()
        .take(MAX_PAGE_BYTES)
        .read_to_string(&mut body)
        .map_err(|e| format!("fetch read: {e}"))?;
    if content_type.contains("html") || looks_like_html(&body) {
        return Ok(html_to_text(&body));
    }
    Ok(body)
}

pub(crate) fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start().get(..256).unwrap_or(body.trim_start());
    let lower = head.to_ascii_lowercase();
    lower.starts_with("<!doctype html") || lower.contains("<html")
}

/// Crude readability pass: drop script/style subtrees, strip tags, decode
/// the common entities, collapse blank runs. Good enough for a model to
/// read; layout fidelity is not a goal.
pub(crate) fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut chars = html.char_indices().peekable();
    let lower = html.to_ascii_lowercase();
    let mut skip_until: Option<usize> = None;

    while let Some((i, ch)) = chars.next() {
        if let Some(end) = skip_until {
            if i < end {
                continue;
            }
            skip_until = None;
        }
        if ch == '<' {
            let rest = &lower[i..];
            for (open, close) in [("<script", "</script>"), ("<style", "</style>")] {
                if rest.starts_with(open) {
                    if let Some(pos) = rest.find(close) {
                        skip_until = Some(i + pos + close.len());
                    } else {
                        skip_until = Some(html.len());
                    }
                    break;
                }
            }
            if skip_until.is_some() {
                continue;
            }
            // block-level closers read better as line breaks
            for tag in ["</p>", "</div>", "</h1>", "</h2>", "</h3>", "</li>", "<br", "</tr>"] {
                if rest.starts_with(tag) {
                    out.push('\n');
                    break;
                }
            }
            // skip to the end of the tag
            for (j, c) in html[i..].char_indices() {
                if c == '>' {
                    skip_until = Some(i + j + 1);
                    break;
                }
            }
            if skip_until.is_none() {
                skip_until = Some(html.len());
            }
            continue;
        }
        out.push(ch);
    }

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    // collapse runs of blank lines and trailing space
    let mut lines: Vec<&str> = Vec::new();
    let mut blank = false;
    for line in decoded.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !blank && !lines.is_empty() {
                lines.push("");
            }
            blank = true;
        } else {
            lines.push(trimmed);
            blank = false;
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_urls_register_and_check() {
        let allowed = AllowedUrls::new();
        assert!(!allowed.contains("https://example.com/a"));
        allowed.register("https://example.com/a");
        assert!(allowed.contains("https://example.com/a"));
        assert!(allowed.contains("  https://example.com/a  "));
        assert!(!allowed.contains("https://example.com/b"));
    }

    #[test]
    fn test_register_from_text() {
        let allowed = AllowedUrls::new();
        allowed.register_from_text("look at https://docs.rs/serde and http://a.io/x.");
        assert!(allowed.contains("https://docs.rs/serde"));
        assert!(allowed.contains("http://a.io/x"));
        assert_eq!(allowed.len(), 2);
    }

    #[test]
    fn test_html_to_text_strips_tags_and_scripts() {
        let html = "<!DOCTYPE html><html><head><style>body{color:red}</style>\
                    <script>alert('x')</script></head>\
                    <body><h1>Title</h1><p>First &amp; second.</p>\
                    <div>Third&nbsp;line</div></body></html>";
        let text = html_to_text(html);
        assert!(text.contains("Title"));
        assert!(text.contains("First & second."));
        assert!(text.contains("Third line"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color:red"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn test_html_to_text_collapses_blank_runs() {
        let text = html_to_text("<p>a</p>\n\n\n<p>b</p>");
        assert_eq!(text, "a\n\nb");
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html("  <!DOCTYPE html><html>"));
        assert!(looks_like_html("<HTML lang=\"en\">"));
        assert!(!looks_like_html("{\"json\": true}"));
        assert!(!looks_like_html("plain text"));
    }

    #[test]
    fn test_parse_brave_results() {
        let payload = serde_json::json!({
            "web": {
                "results": [
                    {"title": "A", "url": "https://a.io", "description": "aaa"},
                    {"title": "B", "url": "https://b.io"}
                ]
            }
        });
        let results = parse_brave_results(&payload, "web");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://a.io");
        assert_eq!(results[1].description, "");

        let news = serde_json::json!({
            "results": [{"title": "N", "url": "https://n.io", "description": "news"}]
        });
        assert_eq!(parse_brave_results(&news, "results").len(), 1);
        assert!(parse_brave_results(&serde_json::json!({}), "web").is_empty());
    }
}
