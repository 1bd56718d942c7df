//! Extraction of YouTube video identifiers from scraped markup and URLs.
//!
//! Everything here is best effort: unexpected markup yields fewer (or zero)
//! candidates, never an error.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

use super::Candidate;

static VIDEO_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());

/// Video links embedded anywhere in a page, including percent-encoded ones.
static EMBEDDED_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:youtube\.com/(?:watch\?(?:[^\s\x22'<>]*?&(?:amp;)?)?v=|shorts/|embed/|live/)|youtu\.be/)([A-Za-z0-9_-]{11})",
    )
    .unwrap()
});

/// Canonical watch URL for a video id.
pub fn canonical_watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", id)
}

/// Extract the 11-character video id from any common YouTube URL form.
pub fn video_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let with_scheme = if raw.starts_with("//") {
        format!("https:{}", raw)
    } else if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let parsed = url::Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host
        .trim_start_matches("www.")
        .trim_start_matches("m.")
        .trim_start_matches("music.");

    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let candidate = match host {
        "youtube.com" | "youtube-nocookie.com" => match segments.next()? {
            "watch" => parsed
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned())?,
            "shorts" | "embed" | "live" | "v" => segments.next()?.to_string(),
            _ => return None,
        },
        "youtu.be" => segments.next()?.to_string(),
        _ => return None,
    };

    VIDEO_ID.is_match(&candidate).then_some(candidate)
}

/// Resolve a search result href to the URL it points at.
///
/// DuckDuckGo wraps targets in `/l/?uddg=<encoded>` redirects.
pub fn extract_redirect(href: &str) -> Option<String> {
    if let Some(uddg_start) = href.find("uddg=") {
        let encoded = &href[uddg_start + 5..];
        let end = encoded.find('&').unwrap_or(encoded.len());
        return urlencoding::decode(&encoded[..end])
            .ok()
            .map(|s| s.into_owned());
    }

    if href.starts_with("http://") || href.starts_with("https://") {
        Some(href.to_string())
    } else if href.starts_with("//") {
        Some(format!("https:{}", href))
    } else {
        None
    }
}

fn clean_title(text: &str) -> Option<String> {
    let title = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let title = title
        .strip_suffix(" - YouTube")
        .unwrap_or(&title)
        .trim()
        .to_string();
    (!title.is_empty()).then_some(title)
}

fn candidates_from_anchors(document: &Html, css: &str) -> Vec<(String, Option<String>)> {
    let Ok(selector) = Selector::parse(css) else {
        return Vec::new();
    };

    document
        .select(&selector)
        .filter_map(|element| {
            let href = element.value().attr("href")?;
            let target = extract_redirect(href)?;
            let id = video_id(&target)?;
            let title = clean_title(&element.text().collect::<String>());
            Some((id, title))
        })
        .collect()
}

fn candidates_from_text(html: &str) -> Vec<(String, Option<String>)> {
    let decoded = urlencoding::decode(html)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| html.to_string());

    EMBEDDED_LINK
        .captures_iter(&decoded)
        .filter_map(|caps| caps.get(1).map(|m| (m.as_str().to_string(), None)))
        .collect()
}

/// Build ranked, deduplicated candidates from `(id, title)` pairs in order.
pub fn rank(found: Vec<(String, Option<String>)>, max_results: usize) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|(id, _)| seen.insert(id.clone()))
        .take(max_results)
        .enumerate()
        .map(|(i, (id, title))| Candidate {
            url: canonical_watch_url(&id),
            id,
            title,
            rank: i + 1,
        })
        .collect()
}

/// Parse a search results page.
///
/// Tries the result anchors first, then every link, then a raw text scan, so
/// a layout change degrades the parse rather than breaking it.
pub fn parse_results(html: &str) -> Vec<Candidate> {
    let document = Html::parse_document(html);

    let mut found = candidates_from_anchors(&document, "a.result__a");
    if found.is_empty() {
        found = candidates_from_anchors(&document, "a[href]");
    }
    if found.is_empty() {
        found = candidates_from_text(html);
    }

    let candidates = rank(found, usize::MAX);
    debug!("Parsed {} candidates from search page", candidates.len());
    candidates
}
