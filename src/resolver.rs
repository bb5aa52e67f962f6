//! Maps reference strings found in markup and stylesheets onto store keys.
//!
//! Generic resolution is an ordered list of pure strategies, each taking the
//! canonical candidate and the store and returning a key or nothing. The
//! first strategy to answer wins, so the tie-break order is simply the order
//! of [`GENERIC_STRATEGIES`].

use percent_encoding::percent_decode_str;
use std::path::Path;
use tracing::debug;
use url::Url;

use crate::canonical::{canonical_key_with_limit, external_image_key};
use crate::config::CloneConfig;
use crate::harvester::ExternalAssetRequest;
use crate::store::ResourceStore;

pub type Strategy = fn(&str, &ResourceStore) -> Option<String>;

/// Full fallback chain used for markup references.
pub const GENERIC_STRATEGIES: &[(&str, Strategy)] = &[
    ("exact", exact_match),
    ("decoded", decoded_match),
    ("query-stripped", query_stripped_match),
    ("prefix", prefix_match),
    ("segment-fuzzy", fuzzy_match),
];

/// Narrower chain for `url(...)` references; stylesheets never fuzzy-match.
pub const STYLESHEET_STRATEGIES: &[(&str, Strategy)] = &[
    ("exact", exact_match),
    ("decoded", decoded_match),
    ("query-stripped", query_stripped_match),
    ("prefix", prefix_match),
];

const INERT_PREFIXES: &[&str] = &["data:", "blob:", "javascript:", "mailto:", "tel:", "about:", "#"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "svg", "webp", "avif", "ico", "bmp"];

/// One reference awaiting resolution: where it was found and what it says.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceTask<'a> {
    pub element: &'a str,
    pub attribute: &'a str,
    pub reference: &'a str,
    pub base: &'a Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// `data:`, `blob:`, fragments and friends; left untouched.
    Inert,
    /// Resolved to an existing store key.
    Local(String),
    /// Off-origin image not yet captured; points at the reserved key once queued.
    Harvest(ExternalAssetRequest),
    /// API or analytics endpoint; the reference is removed.
    Strip,
    /// Image proxy whose original could not be found.
    Placeholder,
    Unresolved,
}

/// Try `strategies` in order against `candidate`.
pub fn first_match(
    candidate: &str,
    store: &ResourceStore,
    strategies: &[(&str, Strategy)],
) -> Option<String> {
    if candidate.is_empty() {
        return None;
    }
    strategies.iter().find_map(|(name, strategy)| {
        let found = strategy(candidate, store)?;
        debug!("{} matched {:?} via {}", candidate, found, name);
        Some(found)
    })
}

pub fn is_inert(reference: &str) -> bool {
    let trimmed = reference.trim();
    trimmed.is_empty()
        || INERT_PREFIXES.iter().any(|prefix| {
            trimmed
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        })
}

pub fn has_image_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn exact_match(candidate: &str, store: &ResourceStore) -> Option<String> {
    store.contains(candidate).then(|| candidate.to_string())
}

fn decoded_match(candidate: &str, store: &ResourceStore) -> Option<String> {
    let decoded = percent_decode_str(candidate).decode_utf8().ok()?;
    (decoded != candidate && store.contains(&decoded)).then(|| decoded.into_owned())
}

fn query_stripped_match(candidate: &str, store: &ResourceStore) -> Option<String> {
    let (path, _) = candidate.split_once('?')?;
    store.contains(path).then(|| path.to_string())
}

// Only suffixes the store itself introduces: `?query`, `_file` renames and
// directory index pages.
fn prefix_match(candidate: &str, store: &ResourceStore) -> Option<String> {
    let path = strip_query(candidate);
    if path.is_empty() {
        return None;
    }
    store
        .keys()
        .find(|key| {
            key.strip_prefix(path)
                .is_some_and(|rest| rest.starts_with(['?', '_', '/']))
        })
        .map(str::to_string)
}

// Bracket/percent-insensitive containment, bounded to keys that share the
// candidate's final path segment.
fn fuzzy_match(candidate: &str, store: &ResourceStore) -> Option<String> {
    let target = normalize(candidate);
    let target_leaf = leaf(&target);
    if target_leaf.is_empty() {
        return None;
    }
    store
        .keys()
        .find(|key| {
            let normalized = normalize(key);
            leaf(&normalized) == target_leaf
                && (normalized.contains(&target) || target.contains(&normalized))
        })
        .map(str::to_string)
}

fn strip_query(candidate: &str) -> &str {
    candidate.split('?').next().unwrap_or(candidate)
}

fn normalize(value: &str) -> String {
    value.chars().filter(|c| !matches!(c, '%' | '[' | ']')).collect()
}

fn leaf(value: &str) -> &str {
    strip_query(value).rsplit('/').next().unwrap_or("")
}

/// Resolves references against one run's store.
///
/// Holds only shared borrows: the store is read-only while rewriting, which
/// is what makes repeated resolution of the same reference stable.
pub struct Resolver<'a> {
    store: &'a ResourceStore,
    page: &'a Url,
    config: &'a CloneConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a ResourceStore, page: &'a Url, config: &'a CloneConfig) -> Self {
        Self { store, page, config }
    }

    pub fn store(&self) -> &'a ResourceStore {
        self.store
    }

    pub fn resolve(&self, task: &ReferenceTask<'_>) -> Resolution {
        let reference = task.reference.trim();
        if is_inert(reference) {
            return Resolution::Inert;
        }
        if self.is_proxy(reference) {
            return self.resolve_proxy(reference, task.base);
        }
        if self.is_stripped(reference) {
            return Resolution::Strip;
        }

        let absolute = match task.base.join(reference) {
            Ok(url) => url,
            Err(e) => {
                debug!("skipping unparseable reference {:?}: {}", reference, e);
                return Resolution::Unresolved;
            }
        };
        // Links to other sites are navigation, not resources.
        if matches!(task.element, "a" | "area") && self.is_off_origin(&absolute) {
            return Resolution::Inert;
        }

        let candidate = self.key_for(&absolute);
        if let Some(key) = first_match(&candidate, self.store, GENERIC_STRATEGIES) {
            return Resolution::Local(key);
        }

        if self.is_off_origin(&absolute) && is_image_task(task, &absolute) {
            let local_path = external_image_key(&absolute);
            if self.store.contains(&local_path) {
                return Resolution::Local(local_path);
            }
            return Resolution::Harvest(ExternalAssetRequest::new(absolute, local_path));
        }

        Resolution::Unresolved
    }

    pub fn is_proxy(&self, reference: &str) -> bool {
        self.config
            .proxy_rules
            .iter()
            .any(|rule| reference.contains(&rule.path_marker))
    }

    pub fn is_stripped(&self, reference: &str) -> bool {
        self.config
            .strip_markers
            .iter()
            .any(|marker| reference.contains(marker.as_str()))
    }

    pub fn is_off_origin(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https") && url.host_str() != self.page.host_str()
    }

    /// Canonical key of `url` under this run's length limit.
    pub fn key_for(&self, url: &Url) -> String {
        canonical_key_with_limit(url, self.config.max_key_len)
    }

    /// The original image URL embedded in an optimization-proxy reference.
    pub fn proxy_original(&self, reference: &str, base: &Url) -> Option<Url> {
        let rule = self
            .config
            .proxy_rules
            .iter()
            .find(|rule| reference.contains(&rule.path_marker))?;
        let proxy = base.join(reference.trim()).ok()?;
        let (_, embedded) = proxy.query_pairs().find(|(name, _)| *name == rule.param.as_str())?;
        base.join(&embedded).ok()
    }

    fn resolve_proxy(&self, reference: &str, base: &Url) -> Resolution {
        let Some(original) = self.proxy_original(reference, base) else {
            return Resolution::Placeholder;
        };
        let key = self.key_for(&original);
        if let Some(found) = first_match(&key, self.store, STYLESHEET_STRATEGIES) {
            return Resolution::Local(found);
        }
        // Same file captured under another directory or host.
        let leaf_name = leaf(&key);
        if !leaf_name.is_empty() && leaf_name.contains('.') {
            if let Some(found) = self.store.keys().find(|k| {
                k.ends_with(&format!("/{}", key)) || strip_query(k).rsplit('/').next() == Some(leaf_name)
            }) {
                return Resolution::Local(found.to_string());
            }
        }
        Resolution::Placeholder
    }
}

fn is_image_task(task: &ReferenceTask<'_>, url: &Url) -> bool {
    let image_element = matches!(task.element, "img" | "source" | "picture" | "image");
    let image_attribute = matches!(task.attribute, "src" | "srcset" | "data-src" | "data-bg" | "poster");
    (image_element && image_attribute) || task.attribute == "poster" || has_image_extension(url.path())
}
