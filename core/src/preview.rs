use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ChatError, Result};
use crate::model::LinkPreview;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s]+").unwrap());

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const MAX_TITLE_CHARS: usize = 200;
const MAX_DESCRIPTION_CHARS: usize = 300;
const MAX_BODY_BYTES: usize = 512 * 1024;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// First well-formed http(s) URL in the text, if any.
pub fn first_url(text: &str) -> Option<Url> {
    URL_RE.find_iter(text).find_map(|m| {
        Url::parse(m.as_str())
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
    })
}

/// Fetches pages and extracts a short summary of them.
pub struct LinkPreviewResolver {
    client: reqwest::Client,
}

impl LinkPreviewResolver {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ChatError::UpstreamUnavailable(e.to_string()))?;
        Ok(Self { client })
    }

    /// Resolve a preview. Every failure degrades to `None`.
    pub async fn resolve(&self, url: &str) -> Option<LinkPreview> {
        match self.fetch(url).await {
            Ok(preview) => {
                debug!(%url, title = %preview.title, "link preview resolved");
                Some(preview)
            }
            Err(e) => {
                warn!(%url, error = %e, "link preview unavailable");
                None
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<LinkPreview> {
        let parsed = Url::parse(url).map_err(|e| ChatError::invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ChatError::invalid(format!("unsupported scheme {}", parsed.scheme())));
        }
        let mut response = self
            .client
            .get(parsed.clone())
            .send()
            .await
            .map_err(upstream)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::UpstreamUnavailable(format!("HTTP {status}")));
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(upstream)? {
            let room = MAX_BODY_BYTES - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= MAX_BODY_BYTES {
                break;
            }
        }
        Ok(parse_preview(&parsed, &String::from_utf8_lossy(&body)))
    }
}

fn upstream(err: reqwest::Error) -> ChatError {
    ChatError::UpstreamUnavailable(err.to_string())
}

/// Build a preview from a fetched document.
///
/// Open Graph tags win; `<title>` and `meta name="description"` are the
/// fallbacks, and the URL itself stands in for a missing title.
pub fn parse_preview(url: &Url, document: &str) -> LinkPreview {
    let document = Html::parse_document(document);

    let mut meta = HashMap::new();
    if let Ok(selector) = Selector::parse("meta") {
        for el in document.select(&selector) {
            let node = el.value();
            if let (Some(key), Some(content)) = (
                node.attr("property").or_else(|| node.attr("name")),
                node.attr("content"),
            ) {
                let content = content.trim();
                if !content.is_empty() {
                    meta.entry(key.to_ascii_lowercase())
                        .or_insert_with(|| content.to_owned());
                }
            }
        }
    }

    let page_title = Selector::parse("title").ok().and_then(|selector| {
        document
            .select(&selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_owned())
            .filter(|t| !t.is_empty())
    });

    let title = meta
        .remove("og:title")
        .or(page_title)
        .unwrap_or_else(|| url.to_string());
    let description = meta
        .remove("og:description")
        .or_else(|| meta.remove("description"))
        .unwrap_or_default();
    let image = meta.remove("og:image").map(|src| {
        url.join(&src).map(|u| u.to_string()).unwrap_or(src)
    });

    LinkPreview {
        url: url.to_string(),
        title: truncate_chars(&title, MAX_TITLE_CHARS),
        description: truncate_chars(&description, MAX_DESCRIPTION_CHARS),
        image,
        domain: url.host_str().unwrap_or_default().to_owned(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
