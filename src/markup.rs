use tracing::{debug, warn};
use url::Url;

use crate::canonical::key_to_href;
use crate::harvester::ExternalAssetRequest;
use crate::html_parser::{Element, HtmlDocument};
use crate::resolver::{first_match, ReferenceTask, Resolution, Resolver, STYLESHEET_STRATEGIES};
use crate::stylesheet::rewrite_stylesheet;

/// Attributes whose whole value is a single resource URL.
pub const RESOURCE_ATTRIBUTES: &[&str] = &[
    "href",
    "src",
    "poster",
    "data-src",
    "data-bg",
    "data-anim-src",
    "data-href",
    "data-poster",
    "data-background",
];

/// Attributes holding comma-separated image candidates.
pub const SRCSET_ATTRIBUTES: &[&str] = &["srcset", "imagesrcset", "data-srcset"];

/// Grey 100x100 "Image" tile shown where an image could not be recovered.
pub const PLACEHOLDER_IMAGE: &str = "data:image/svg+xml;base64,PHN2ZyB3aWR0aD0iMTAwIiBoZWlnaHQ9IjEwMCIgeG1sbnM9Imh0dHA6Ly93d3cudzMub3JnLzIwMDAvc3ZnIj48cmVjdCB3aWR0aD0iMTAwIiBoZWlnaHQ9IjEwMCIgZmlsbD0iI2RkZCIvPjx0ZXh0IHg9IjUwIiB5PSI1MCIgZm9udC1zaXplPSIxMiIgdGV4dC1hbmNob3I9Im1pZGRsZSIgZHk9Ii4zZW0iPkltYWdlPC90ZXh0Pjwvc3ZnPg==";

const PLACEHOLDER_STYLE: &str = "opacity: 0.5";

#[derive(Debug, Default)]
pub struct MarkupReport {
    pub rewritten: usize,
    pub placeholders: usize,
    pub stripped: usize,
    pub unresolved: Vec<String>,
    /// Off-origin images the rewritten markup now expects to find locally.
    pub harvest: Vec<ExternalAssetRequest>,
}

/// Base URL for relative references: `<base href>` if present, else the page.
pub fn document_base(doc: &HtmlDocument, page: &Url) -> Url {
    doc.first("base")
        .and_then(|base| base.attr("href"))
        .and_then(|href| page.join(href.trim()).ok())
        .unwrap_or_else(|| page.clone())
}

/// Originals behind image-proxy references whose files are not captured yet,
/// keyed under their own canonical paths.
pub fn proxy_originals(doc: &HtmlDocument, resolver: &Resolver<'_>, base: &Url) -> Vec<ExternalAssetRequest> {
    let mut requests: Vec<ExternalAssetRequest> = Vec::new();
    for el in doc.elements() {
        let mut references: Vec<String> = RESOURCE_ATTRIBUTES.iter().filter_map(|attr| el.attr(attr)).collect();
        for attr in SRCSET_ATTRIBUTES {
            if let Some(value) = el.attr(attr) {
                references.extend(parse_srcset(&value).into_iter().map(|c| c.url));
            }
        }
        for reference in references.iter().filter(|r| resolver.is_proxy(r)) {
            let Some(original) = resolver.proxy_original(reference, base) else {
                continue;
            };
            let key = resolver.key_for(&original);
            if first_match(&key, resolver.store(), STYLESHEET_STRATEGIES).is_some() {
                continue;
            }
            debug!("found original image behind proxy: {}", original);
            let request = ExternalAssetRequest::new(original, key);
            if !requests.contains(&request) {
                requests.push(request);
            }
        }
    }
    requests
}

/// Rewrites every resource reference in a captured document to its local key.
pub struct MarkupRewriter<'r, 'a> {
    resolver: &'r Resolver<'a>,
    base: Url,
}

impl<'r, 'a> MarkupRewriter<'r, 'a> {
    pub fn new(resolver: &'r Resolver<'a>, base: Url) -> Self {
        Self { resolver, base }
    }

    /// Main pass over resource attributes, srcsets and inline CSS. `<base>`
    /// elements are dropped since every rewritten reference is archive-relative.
    pub fn rewrite(&self, doc: &mut HtmlDocument) -> MarkupReport {
        let mut report = MarkupReport::default();

        for el in doc.elements() {
            if el.is("base") {
                doc.remove(&el);
                continue;
            }
            for attr in RESOURCE_ATTRIBUTES {
                if let Some(value) = el.attr(attr) {
                    self.rewrite_attribute(&el, attr, &value, &mut report);
                }
            }
            for attr in SRCSET_ATTRIBUTES {
                if let Some(value) = el.attr(attr) {
                    self.rewrite_srcset(&el, attr, &value, &mut report);
                }
            }
            if let Some(style) = el.attr("style").filter(|s| s.contains("url(")) {
                let outcome = rewrite_stylesheet(&style, &self.base, "", self.resolver);
                report.rewritten += outcome.rewritten;
                report.unresolved.extend(outcome.unresolved);
                el.set_attr("style", &outcome.text);
            }
            if el.is("style") {
                let css = el.text();
                let outcome = rewrite_stylesheet(&css, &self.base, "", self.resolver);
                if outcome.rewritten > 0 {
                    el.set_text(&outcome.text);
                }
                report.rewritten += outcome.rewritten;
                report.unresolved.extend(outcome.unresolved);
            }
        }

        report
    }

    /// Remove what survived the main pass and still points at an image proxy
    /// or an API endpoint. Returns the number of elements touched.
    pub fn cleanup(&self, doc: &mut HtmlDocument) -> usize {
        let mut touched = 0;
        for el in doc.elements() {
            if el.is("img") {
                if el.attr("srcset").is_some_and(|s| self.resolver.is_proxy(&s)) {
                    debug!("final cleanup: removing proxy srcset");
                    el.remove_attr("srcset");
                    touched += 1;
                }
                if let Some(src) = el.attr("src").filter(|s| self.resolver.is_proxy(s)) {
                    let task = self.task(&el, "src", &src);
                    match self.resolver.resolve(&task) {
                        Resolution::Local(key) => el.set_attr("src", &key_to_href(&key)),
                        _ => apply_placeholder(&el, "src"),
                    }
                    touched += 1;
                }
            } else if el.is("link") {
                let proxied = ["href", "imagesrcset"]
                    .iter()
                    .any(|attr| el.attr(attr).is_some_and(|v| self.resolver.is_proxy(&v)));
                if proxied {
                    debug!("final cleanup: removing proxy link");
                    doc.remove(&el);
                    touched += 1;
                }
            } else if el.is("script") && el.attr("src").is_some_and(|s| self.resolver.is_stripped(&s)) {
                debug!("final cleanup: removing API script");
                doc.remove(&el);
                touched += 1;
            }
        }
        touched
    }

    fn task<'t>(&'t self, el: &'t Element, attribute: &'t str, reference: &'t str) -> ReferenceTask<'t> {
        ReferenceTask {
            element: el.name(),
            attribute,
            reference,
            base: &self.base,
        }
    }

    fn rewrite_attribute(&self, el: &Element, attr: &str, value: &str, report: &mut MarkupReport) {
        let task = self.task(el, attr, value);
        match self.resolver.resolve(&task) {
            Resolution::Inert => {}
            Resolution::Local(key) => {
                el.set_attr(attr, &key_to_href(&key));
                report.rewritten += 1;
            }
            Resolution::Harvest(request) => {
                debug!("adding external image to download queue: {}", request.url);
                el.set_attr(attr, &key_to_href(&request.local_path));
                report.harvest.push(request);
                report.rewritten += 1;
            }
            Resolution::Strip => {
                debug!("removing API resource: {}", value);
                el.remove_attr(attr);
                report.stripped += 1;
            }
            Resolution::Placeholder => {
                debug!("replacing proxied image with placeholder: {}", value);
                apply_placeholder(el, attr);
                report.placeholders += 1;
            }
            Resolution::Unresolved => {
                warn!("could not find resource for {} {}={:?}", el.name(), attr, value);
                report.unresolved.push(value.to_string());
                if el.is("img") && attr == "src" {
                    apply_placeholder(el, attr);
                    report.placeholders += 1;
                }
            }
        }
    }

    fn rewrite_srcset(&self, el: &Element, attr: &str, value: &str, report: &mut MarkupReport) {
        if value.contains("data:") {
            return;
        }
        let mut kept = Vec::new();
        for candidate in parse_srcset(value) {
            let task = self.task(el, attr, &candidate.url);
            let url = match self.resolver.resolve(&task) {
                Resolution::Inert => candidate.url.clone(),
                Resolution::Local(key) => key_to_href(&key),
                Resolution::Harvest(request) => {
                    let href = key_to_href(&request.local_path);
                    report.harvest.push(request);
                    href
                }
                Resolution::Strip | Resolution::Placeholder => continue,
                Resolution::Unresolved => {
                    report.unresolved.push(candidate.url.clone());
                    candidate.url.clone()
                }
            };
            kept.push(match candidate.descriptor.is_empty() {
                true => url,
                false => format!("{} {}", url, candidate.descriptor),
            });
        }
        if kept.is_empty() {
            el.remove_attr(attr);
        } else {
            el.set_attr(attr, &kept.join(", "));
            report.rewritten += 1;
        }
    }
}

/// `src`/`poster` become the placeholder tile at half opacity; any other
/// attribute is dropped.
fn apply_placeholder(el: &Element, attr: &str) {
    if attr != "src" && attr != "poster" {
        el.remove_attr(attr);
        return;
    }
    el.set_attr(attr, PLACEHOLDER_IMAGE);
    let style = match el.attr("style").map(|s| s.trim().trim_end_matches(';').to_string()) {
        Some(existing) if existing.contains(PLACEHOLDER_STYLE) => existing,
        Some(existing) if !existing.is_empty() => format!("{}; {}", existing, PLACEHOLDER_STYLE),
        _ => PLACEHOLDER_STYLE.to_string(),
    };
    el.set_attr("style", &style);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcsetCandidate {
    pub url: String,
    pub descriptor: String,
}

/// Split a `srcset` value into candidates. URLs may contain commas; a
/// candidate ends at the first comma after its URL.
pub fn parse_srcset(value: &str) -> Vec<SrcsetCandidate> {
    let mut candidates = Vec::new();
    let mut rest = value;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }
        let url_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let mut url = &rest[..url_end];
        rest = &rest[url_end..];

        let descriptor = if url.ends_with(',') {
            url = url.trim_end_matches(',');
            ""
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let descriptor = rest[..end].trim();
            rest = &rest[end..];
            descriptor
        };
        if !url.is_empty() {
            candidates.push(SrcsetCandidate {
                url: url.to_string(),
                descriptor: descriptor.to_string(),
            });
        }
    }
    candidates
}
