//! Stable identities for content items.
//!
//! Videos are keyed by YouTube id (`video:<id>`), everything else by a
//! normalized URL (`article:<url>`), so the same link reached through
//! different tracking parameters or fragments dedups to one record.

use herald_core::models::ContentKind;
use regex::Regex;
use reqwest::Url;
use std::sync::OnceLock;

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref_src"];

fn video_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid video id regex"))
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("valid url regex"))
}

pub fn video_fingerprint(video_id: &str) -> String {
    format!("video:{}", video_id)
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Canonical form of a URL: lowercase scheme and host, no fragment, no
/// tracking parameters, no trailing slash on non-root paths.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Some(url.to_string())
}

/// YouTube video id from watch, short, embed, live and youtu.be URLs.
pub fn youtube_video_id(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let host = host.strip_prefix("m.").unwrap_or(host);

    let candidate = match host {
        "youtu.be" => url.path_segments()?.next().map(str::to_string),
        "youtube.com" | "music.youtube.com" => {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some("shorts") | Some("embed") | Some("live") | Some("v") => {
                    segments.next().map(str::to_string)
                }
                _ => None,
            }
        }
        _ => None,
    }?;

    video_id_pattern()
        .is_match(&candidate)
        .then_some(candidate)
}

/// Fingerprint for an arbitrary link, as found in publish-target history.
pub fn fingerprint_for_url(raw: &str) -> Option<(String, ContentKind)> {
    if let Some(id) = youtube_video_id(raw) {
        return Some((video_fingerprint(&id), ContentKind::Video));
    }
    normalize_url(raw).map(|u| (format!("article:{}", u), ContentKind::Article))
}

pub fn article_fingerprint(raw: &str) -> Option<String> {
    normalize_url(raw).map(|u| format!("article:{}", u))
}

/// Every http(s) URL in a block of text.
pub fn extract_urls(text: &str) -> Vec<&str> {
    url_pattern()
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']))
        .collect()
}
