//! Rewrites `url(...)` and string `@import` references inside CSS.

use regex::{Captures, Regex};
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};
use url::Url;

use crate::canonical::{external_image_key, key_to_href};
use crate::harvester::ExternalAssetRequest;
use crate::resolver::{first_match, is_inert, Resolver, STYLESHEET_STRATEGIES};

static URL_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)'"]*?))\s*\)"#).expect("valid url() pattern")
});

static STRING_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("valid @import pattern")
});

#[derive(Debug, Default)]
pub struct CssOutcome {
    pub text: String,
    pub rewritten: usize,
    /// References left untouched because nothing matched.
    pub unresolved: Vec<String>,
}

/// Rewrite every resolvable reference in `css`.
///
/// `base` is the URL the stylesheet was served from (relative references
/// join against it) and `output_dir` is the archive directory the rewritten
/// text will live in. Misses keep their original text.
pub fn rewrite_stylesheet(css: &str, base: &Url, output_dir: &str, resolver: &Resolver<'_>) -> CssOutcome {
    let mut outcome = CssOutcome::default();

    let text = URL_FUNCTION.replace_all(css, |caps: &Captures<'_>| {
        let value = captured_value(caps);
        match rewrite_reference(value, base, output_dir, resolver) {
            Some(href) => {
                outcome.rewritten += 1;
                format!("url('{}')", href)
            }
            None => {
                note_miss(&mut outcome, value);
                caps[0].to_string()
            }
        }
    });

    let text = STRING_IMPORT.replace_all(&text, |caps: &Captures<'_>| {
        let value = captured_value(caps);
        match rewrite_reference(value, base, output_dir, resolver) {
            Some(href) => {
                outcome.rewritten += 1;
                format!("@import '{}'", href)
            }
            None => {
                note_miss(&mut outcome, value);
                caps[0].to_string()
            }
        }
    });

    outcome.text = text.into_owned();
    outcome
}

/// Off-origin references in `css` that are not captured yet, as harvest
/// requests under their synthesized `external_images/` keys.
pub fn discover_external_assets(css: &str, base: &Url, resolver: &Resolver<'_>) -> Vec<ExternalAssetRequest> {
    URL_FUNCTION
        .captures_iter(css)
        .filter_map(|caps| {
            let value = captured_value(&caps).trim();
            if is_inert(value) || !is_absolute(value) {
                return None;
            }
            let url = base.join(value).ok()?;
            if !resolver.is_off_origin(&url) {
                return None;
            }
            if first_match(&resolver.key_for(&url), resolver.store(), STYLESHEET_STRATEGIES).is_some() {
                return None;
            }
            debug!("found external asset in CSS: {}", url);
            let local_path = external_image_key(&url);
            Some(ExternalAssetRequest::new(url, local_path))
        })
        .collect()
}

/// Every non-inert `url(...)` and string `@import` value in `css`.
pub fn css_references(css: &str) -> Vec<&str> {
    URL_FUNCTION
        .captures_iter(css)
        .chain(STRING_IMPORT.captures_iter(css))
        .map(|caps| captured_value(&caps).trim())
        .filter(|value| !is_inert(value))
        .collect()
}

/// URL a captured stylesheet is assumed to have been served from: the page
/// origin plus its archive key.
pub fn stylesheet_base(page: &Url, key: &str) -> Option<Url> {
    page.join(&format!("/{}", key_to_href(key))).ok()
}

/// Archive directory holding `key` (empty for the root).
pub fn key_dir(key: &str) -> &str {
    key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Relative href from `from_dir` to the archive key `key`.
pub fn relative_href(from_dir: &str, key: &str) -> String {
    if from_dir.is_empty() {
        return key_to_href(key);
    }
    let relative = pathdiff::diff_paths(Path::new(key), Path::new(from_dir))
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|| key.to_string());
    key_to_href(&relative)
}

fn rewrite_reference(value: &str, base: &Url, output_dir: &str, resolver: &Resolver<'_>) -> Option<String> {
    let value = value.trim();
    if is_inert(value) {
        return None;
    }
    let url = base.join(value).ok()?;

    if is_absolute(value) && resolver.is_off_origin(&url) {
        let harvested = external_image_key(&url);
        if resolver.store().contains(&harvested) {
            return Some(relative_href(output_dir, &harvested));
        }
    }

    let store = resolver.store();
    let key = first_match(&resolver.key_for(&url), store, STYLESHEET_STRATEGIES).or_else(|| {
        // A relative reference may really be rooted at the site origin.
        if is_absolute(value) || value.starts_with('/') {
            return None;
        }
        let rooted = base.join(&format!("/{}", value)).ok()?;
        first_match(&resolver.key_for(&rooted), store, STYLESHEET_STRATEGIES)
    })?;
    Some(relative_href(output_dir, &key))
}

fn captured_value<'c>(caps: &Captures<'c>) -> &'c str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str())
        .unwrap_or("")
}

fn note_miss(outcome: &mut CssOutcome, value: &str) {
    let value = value.trim();
    if !is_inert(value) {
        warn!("could not find resource for CSS reference {:?}", value);
        outcome.unresolved.push(value.to_string());
    }
}

fn is_absolute(value: &str) -> bool {
    let lower = value.get(..8).unwrap_or(value).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || value.starts_with("//")
}
