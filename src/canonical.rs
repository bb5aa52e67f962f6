//! Turns absolute URLs into deterministic, filesystem-safe archive keys.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::path::Path;
use url::Url;

use crate::config::DEFAULT_MAX_KEY_LEN;

const INDEX_FILE: &str = "index.html";
const TRUNCATED_MARKER: &str = "_truncated";
const EXTERNAL_IMAGES_DIR: &str = "external_images";

/// Characters escaped when a key is written back into markup or CSS, so a
/// key such as `a?x=1` is loaded as a literal file rather than `a` + query.
const HREF_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'\'')
    .add(b'#')
    .add(b'%')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`');

/// Canonical key for `url` with the default length limit.
pub fn canonical_key(url: &Url) -> String {
    canonical_key_with_limit(url, DEFAULT_MAX_KEY_LEN)
}

/// Canonical archive key for an observed response URL.
///
/// The host is not part of the key. Paths are percent-decoded, directory
/// URLs get `index.html`, and the query string is kept after a literal `?`.
/// Anything longer than `max_len` bytes collapses to `file_<hash>.<ext>`.
pub fn canonical_key_with_limit(url: &Url, max_len: usize) -> String {
    let raw_path = url.path();
    let raw_path = raw_path.strip_prefix('/').unwrap_or(raw_path);
    let decoded = percent_decode_str(raw_path).decode_utf8_lossy();

    let mut path = sanitize_path(&decoded);
    if path.is_empty() || decoded.ends_with('/') {
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(INDEX_FILE);
    }

    let mut key = path.clone();
    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        key.push('?');
        key.push_str(&sanitize_query(&truncate_query(query, max_len)));
    }

    if key.len() > max_len {
        return hashed_name(&key, &path);
    }
    key
}

/// Synthesized key for an off-origin image fetched on demand:
/// `external_images/<basename>`, with `.jpg` appended when the basename has
/// no extension.
pub fn external_image_key(url: &Url) -> String {
    let basename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|segment| sanitize_segment(&percent_decode_str(segment).decode_utf8_lossy()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "image".to_string());

    if basename.contains('.') {
        format!("{}/{}", EXTERNAL_IMAGES_DIR, basename)
    } else {
        format!("{}/{}.jpg", EXTERNAL_IMAGES_DIR, basename)
    }
}

/// Escape a key for use as a relative URL in markup or CSS.
pub fn key_to_href(key: &str) -> String {
    utf8_percent_encode(key, HREF_ESCAPES).to_string()
}

/// Sanitize a decoded path: hostile characters become `_`, empty segments are
/// dropped and dot segments can no longer climb out of the archive root.
pub fn sanitize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment {
            "." | ".." => "_".to_string(),
            other => sanitize_segment(other),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

// `?` is legal inside a query segment, so it survives here. A `/` in the
// query still splits the archive path, so its segments get the same dot and
// empty-segment treatment as the path.
fn sanitize_query(query: &str) -> String {
    query
        .split('/')
        .enumerate()
        .map(|(idx, segment)| match segment {
            "." | ".." => "_".to_string(),
            "" if idx > 0 => "_".to_string(),
            other => other
                .chars()
                .map(|c| match c {
                    '<' | '>' | ':' | '"' | '|' | '*' | '\\' => '_',
                    c if c.is_control() => '_',
                    c => c,
                })
                .collect(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn truncate_query(query: &str, max_len: usize) -> String {
    // Length counts the leading `?`.
    if query.len() + 1 <= max_len {
        return query.to_string();
    }
    let mut end = max_len.saturating_sub(1);
    while !query.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &query[..end], TRUNCATED_MARKER)
}

fn hashed_name(key: &str, path: &str) -> String {
    let hash = string_hash(key);
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()));

    match extension {
        Some(ext) => format!("file_{}.{}", hash, ext),
        None => format!("file_{}", hash),
    }
}

/// 31-multiplier string hash over UTF-16 code units, wrapping at 32 bits.
fn string_hash(s: &str) -> u32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
        .unsigned_abs()
}
