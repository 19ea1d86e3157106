use anyhow::Result;
use regex_lite::Regex;
use std::sync::LazyLock;

use crate::hands::BrowserPage;

/// Prefix every observation starts with; the system prompt refers to it.
pub const OBSERVATION_MARKER: &str = "[HTML]:";

static SCRIPT_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").unwrap());
static STYLE_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").unwrap());
static EVENT_HANDLERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\son\w+=("[^"]*"|'[^']*')"#).unwrap());
static NOISY_ATTRIBUTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\s(type|language)=("[^"]*"|'[^']*')"#).unwrap());
static COMMENTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n+").unwrap());
static WHITESPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());
static BETWEEN_TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">\s+<").unwrap());

/// Reduce raw markup to the token-frugal form shown to the model.
///
/// Steps run in order: drop `<script>`/`<style>` elements, inline `on*`
/// handlers, `type`/`language` attributes and comments, then squeeze
/// whitespace. The result is always prefixed with [`OBSERVATION_MARKER`].
pub fn clean_html(raw: &str) -> String {
    let html = SCRIPT_TAGS.replace_all(raw, "");
    let html = STYLE_TAGS.replace_all(&html, "");
    let html = EVENT_HANDLERS.replace_all(&html, "");
    let html = NOISY_ATTRIBUTES.replace_all(&html, "");
    let html = COMMENTS.replace_all(&html, "");

    let html = NEWLINES.replace_all(&html, "");
    let html = WHITESPACE_RUNS.replace_all(&html, " ");
    let html = BETWEEN_TAGS.replace_all(&html, "><");

    format!("{}\n{}", OBSERVATION_MARKER, html.trim())
}

/// Capture the current page body and normalize it into an observation.
pub fn observe(page: &dyn BrowserPage) -> Result<String> {
    let raw = page.body_html()?;
    Ok(clean_html(&raw))
}
