//! One clone run, from renderer events to a packaged archive.

use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::capture::{CaptureSession, PageRenderer};
use crate::config::CloneConfig;
use crate::error::{CloneError, Result};
use crate::file_manager::{write_zip, ArchiveContents};
use crate::harvester::{AssetFetcher, ExternalAssetRequest, Harvester};
use crate::html_parser::HtmlDocument;
use crate::markup::{document_base, proxy_originals, MarkupRewriter};
use crate::patches::{apply_patches, default_patches, SitePatch};
use crate::progress::{Progress, ProgressSink, CLEANUP, DONE, HARVEST_END, PACKAGING, SETTLED};
use crate::resolver::Resolver;
use crate::store::ResourceStore;
use crate::stylesheet::{discover_external_assets, key_dir, rewrite_stylesheet, stylesheet_base};

/// Discovered assets are harvested in the first half of the harvest span,
/// references queued while rewriting in the second.
const HARVEST_MIDPOINT: f64 = (SETTLED + HARVEST_END) / 2.0;

#[derive(Debug, Default)]
pub struct CloneReport {
    pub captured: usize,
    pub harvested: Vec<String>,
    pub rewritten: usize,
    pub placeholders: usize,
    pub stripped: usize,
    pub cleaned: usize,
    pub patches: Vec<String>,
    /// Every recovered error, in the order it happened.
    pub warnings: Vec<CloneError>,
}

impl CloneReport {
    pub fn unresolved(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().filter_map(|w| match w {
            CloneError::ReferenceUnresolved { reference } => Some(reference.as_str()),
            _ => None,
        })
    }

    pub fn failed_fetches(&self) -> usize {
        self.warnings
            .iter()
            .filter(|w| matches!(w, CloneError::ExternalFetch { .. }))
            .count()
    }
}

pub struct CloneOutput {
    /// ZIP bytes ready to be written or served.
    pub archive: Vec<u8>,
    pub contents: ArchiveContents,
    pub report: CloneReport,
}

/// Parse a page URL given on the command line; a bare host gets `https://`.
pub fn parse_page_url(input: &str) -> Result<Url> {
    let input = input.trim();
    let url = match Url::parse(input) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("https://{}", input)).map_err(|source| CloneError::InvalidUrl {
                url: input.to_string(),
                source,
            })?
        }
        Err(source) => {
            return Err(CloneError::InvalidUrl {
                url: input.to_string(),
                source,
            })
        }
    };
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(CloneError::Config(format!("only http(s) pages can be cloned, got {}", url)));
    }
    Ok(url)
}

/// Owns everything one clone run touches. Nothing is shared between runs.
pub struct CloneEngine<F> {
    page: Url,
    config: CloneConfig,
    store: ResourceStore,
    harvester: Harvester<F>,
    patches: Vec<Box<dyn SitePatch>>,
    report: CloneReport,
    reported_unresolved: HashSet<String>,
}

impl<F: AssetFetcher> CloneEngine<F> {
    pub fn new(page: Url, config: CloneConfig, fetcher: F) -> Result<Self> {
        config.validate()?;
        let harvester = Harvester::new(fetcher, config.harvest_concurrency);
        let patches = default_patches(&config);
        Ok(Self {
            page,
            config,
            store: ResourceStore::new(),
            harvester,
            patches,
            report: CloneReport::default(),
            reported_unresolved: HashSet::new(),
        })
    }

    /// Start from resources captured elsewhere.
    pub fn with_store(mut self, store: ResourceStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_patches(mut self, patches: Vec<Box<dyn SitePatch>>) -> Self {
        self.patches = patches;
        self
    }

    pub fn page(&self) -> &Url {
        &self.page
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    /// Render the page, capture what it loads, then rewrite and package.
    pub async fn run<R: PageRenderer>(mut self, renderer: &R, sink: &dyn ProgressSink) -> Result<CloneOutput> {
        let progress = Progress::new(sink);
        progress.report(0.0, Some("loading page"));

        let (events, receiver) = mpsc::unbounded_channel();
        let session = CaptureSession::new(&mut self.store, self.config.max_key_len);
        let (_, captured) = tokio::join!(
            renderer.render(&self.page, events),
            session.run(receiver, &self.page, &progress)
        );
        let captured = captured?;
        self.report.captured = captured.captured;
        self.report.warnings.extend(captured.warnings);

        self.finish(&captured.markup, &progress).await
    }

    /// Rewrite and package `markup` against the resources already stored.
    pub async fn rewrite(mut self, markup: &str, sink: &dyn ProgressSink) -> Result<CloneOutput> {
        let progress = Progress::new(sink);
        self.report.captured = self.store.len();
        progress.report(SETTLED, Some("page settled"));
        self.finish(markup, &progress).await
    }

    async fn finish(mut self, markup: &str, progress: &Progress<'_>) -> Result<CloneOutput> {
        for request in self.discover(markup) {
            self.harvester.queue(request);
        }
        self.harvest(progress, (SETTLED, HARVEST_MIDPOINT)).await;

        let (rewritten, queued) = self.rewrite_markup(markup)?;
        self.harvester.fix_layout();
        for request in queued {
            self.harvester.queue(request);
        }
        self.harvest(progress, (HARVEST_MIDPOINT, HARVEST_END)).await;
        progress.report(HARVEST_END, None);

        progress.report(CLEANUP, Some("cleaning up markup"));
        let index_html = self.cleanup_markup(&rewritten)?;
        let contents = self.build_contents(index_html);

        progress.report(PACKAGING, Some("creating archive"));
        let archive = write_zip(&contents)?;
        info!(
            "packaged {} files ({} bytes uncompressed, {} compressed)",
            contents.len(),
            contents.total_bytes(),
            archive.len()
        );
        progress.report(DONE, Some("clone complete"));

        Ok(CloneOutput {
            archive,
            contents,
            report: self.report,
        })
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.store, &self.page, &self.config)
    }

    /// Originals behind image proxies and off-origin images named in CSS.
    fn discover(&self, markup: &str) -> Vec<ExternalAssetRequest> {
        let doc = HtmlDocument::parse(markup);
        let base = document_base(&doc, &self.page);
        let resolver = self.resolver();

        let mut requests = proxy_originals(&doc, &resolver, &base);
        for style in doc.elements_named("style") {
            requests.extend(discover_external_assets(&style.text(), &base, &resolver));
        }
        for element in doc.elements() {
            if let Some(style) = element.attr("style") {
                requests.extend(discover_external_assets(&style, &base, &resolver));
            }
        }
        for (key, resource) in self.store.iter().filter(|(_, r)| r.is_stylesheet()) {
            let (Ok(css), Some(css_base)) = (std::str::from_utf8(&resource.bytes), stylesheet_base(&self.page, key))
            else {
                continue;
            };
            requests.extend(discover_external_assets(css, &css_base, &resolver));
        }
        requests
    }

    async fn harvest(&mut self, progress: &Progress<'_>, span: (f64, f64)) {
        let report = self.harvester.harvest(&mut self.store, progress, span).await;
        self.report.harvested.extend(report.harvested);
        self.report.warnings.extend(report.failures);
    }

    fn rewrite_markup(&mut self, markup: &str) -> Result<(String, Vec<ExternalAssetRequest>)> {
        let mut doc = HtmlDocument::parse(markup);
        let base = document_base(&doc, &self.page);
        let resolver = Resolver::new(&self.store, &self.page, &self.config);
        let outcome = MarkupRewriter::new(&resolver, base).rewrite(&mut doc);
        let html = doc.to_html()?;

        self.report.rewritten += outcome.rewritten;
        self.report.placeholders += outcome.placeholders;
        self.report.stripped += outcome.stripped;
        self.note_unresolved(outcome.unresolved);
        Ok((html, outcome.harvest))
    }

    fn cleanup_markup(&mut self, html: &str) -> Result<String> {
        let mut doc = HtmlDocument::parse(html);
        let resolver = Resolver::new(&self.store, &self.page, &self.config);
        self.report.cleaned = MarkupRewriter::new(&resolver, self.page.clone()).cleanup(&mut doc);
        self.report.patches = apply_patches(&self.patches, &self.page, &mut doc);
        doc.to_html()
    }

    /// `index.html` first, then every stored file with stylesheets rewritten
    /// relative to their own directory.
    fn build_contents(&mut self, index_html: String) -> ArchiveContents {
        let mut contents = ArchiveContents::new(index_html);
        let mut rewritten = 0;
        let mut unresolved = Vec::new();
        let resolver = Resolver::new(&self.store, &self.page, &self.config);

        for (key, resource) in self.store.iter() {
            if !resource.is_stylesheet() {
                contents.push(key, resource.bytes.clone());
                continue;
            }
            match (std::str::from_utf8(&resource.bytes), stylesheet_base(&self.page, key)) {
                (Ok(css), Some(base)) => {
                    let outcome = rewrite_stylesheet(css, &base, key_dir(key), &resolver);
                    rewritten += outcome.rewritten;
                    unresolved.extend(outcome.unresolved);
                    contents.push(key, outcome.text);
                }
                _ => {
                    warn!("stylesheet {} is not UTF-8; copied unchanged", key);
                    contents.push(key, resource.bytes.clone());
                }
            }
        }

        self.report.rewritten += rewritten;
        self.note_unresolved(unresolved);
        contents
    }

    fn note_unresolved(&mut self, references: Vec<String>) {
        for reference in references {
            if self.reported_unresolved.insert(reference.clone()) {
                self.report
                    .warnings
                    .push(CloneError::ReferenceUnresolved { reference });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::{capture, ScriptedRenderer};
    use crate::harvester::tests::FakeFetcher;
    use crate::markup::PLACEHOLDER_IMAGE;
    use crate::progress::{MockProgressSink, NullProgress, ProgressUpdate};
    use std::sync::{Arc, Mutex};

    fn page() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    fn engine(fetcher: FakeFetcher) -> CloneEngine<FakeFetcher> {
        CloneEngine::new(page(), CloneConfig::default(), fetcher)
            .unwrap()
            .with_patches(Vec::new())
    }

    fn text(output: &CloneOutput, path: &str) -> String {
        String::from_utf8(output.contents.get(path).unwrap().to_vec()).unwrap()
    }

    const PAGE: &str = r#"<!DOCTYPE html><html><head>
<link rel="stylesheet" href="/css/app.css">
<script src="/api/session"></script>
</head><body>
<img src="/_next/image?url=%2Fphoto.png&amp;w=640&amp;q=75" alt="photo">
<img src="/gone.png">
<a href="/about">About</a>
</body></html>"#;

    fn renderer() -> ScriptedRenderer {
        ScriptedRenderer::settled(
            vec![
                capture("https://example.com/", "text/html", PAGE.as_bytes()),
                capture(
                    "https://example.com/css/app.css",
                    "text/css",
                    b"@font-face { src: url(/fonts/x.woff2) } .hero { background: url(https://images.cdn.net/hero) }",
                ),
                capture("https://example.com/fonts/x.woff2", "font/woff2", b"woff2"),
                capture("https://example.com/photo.png", "image/png", b"png"),
            ],
            PAGE,
        )
    }

    #[tokio::test]
    async fn test_full_run() {
        let fetcher = FakeFetcher::default().with("https://images.cdn.net/hero", b"jpeg", None);
        let output = engine(fetcher).run(&renderer(), &NullProgress).await.unwrap();

        let index = text(&output, "index.html");
        assert!(index.contains(r#"href="css/app.css""#), "{}", index);
        assert!(index.contains(r#"<img src="photo.png" alt="photo">"#), "{}", index);
        assert!(index.contains(PLACEHOLDER_IMAGE));
        assert!(!index.contains("/api/session"));

        let css = text(&output, "css/app.css");
        assert_eq!(
            css,
            "@font-face { src: url('../fonts/x.woff2') } .hero { background: url('../external_images/hero.jpg') }"
        );
        assert_eq!(output.contents.get("external_images/hero.jpg"), Some(&b"jpeg"[..]));
        assert_eq!(output.report.captured, 4);
        assert_eq!(output.report.harvested, vec!["external_images/hero.jpg".to_string()]);
        assert_eq!(output.report.unresolved().collect::<Vec<_>>(), vec!["/gone.png", "/about"]);
        assert_eq!(output.contents.paths().next(), Some("index.html"));
    }

    #[tokio::test]
    async fn test_failed_css_fetch_leaves_reference_and_warns() {
        let output = engine(FakeFetcher::default()).run(&renderer(), &NullProgress).await.unwrap();

        let css = text(&output, "css/app.css");
        assert!(css.contains("url(https://images.cdn.net/hero)"), "{}", css);
        assert_eq!(output.report.failed_fetches(), 1);
        assert!(output.report.warnings.iter().all(|w| !w.is_fatal()));
        assert!(output.contents.get("external_images/hero.jpg").is_none());
    }

    #[tokio::test]
    async fn test_navigation_failure_aborts() {
        let renderer = ScriptedRenderer {
            messages: vec![crate::capture::RenderMessage::Failed("HTTP 503 Service Unavailable".into())],
        };
        let err = engine(FakeFetcher::default()).run(&renderer, &NullProgress).await.err().unwrap();
        assert!(matches!(err, CloneError::Navigation { .. }));
    }

    #[tokio::test]
    async fn test_proxy_original_is_harvested_under_its_own_key() {
        let markup = r#"<img src="/_next/image?url=https%3A%2F%2Fcdn.sanity.io%2Fimages%2Fp.jpg&amp;w=640">"#;
        let fetcher = FakeFetcher::default().with("https://cdn.sanity.io/images/p.jpg", b"jpg", Some("image/jpeg"));
        let output = engine(fetcher).rewrite(markup, &NullProgress).await.unwrap();

        assert!(text(&output, "index.html").contains(r#"<img src="images/p.jpg">"#));
        assert_eq!(output.contents.get("images/p.jpg"), Some(&b"jpg"[..]));
    }

    #[tokio::test]
    async fn test_inline_style_backgrounds_are_harvested() {
        let markup = r#"<html><head><style>.b { background: url(https://images.cdn.net/other.jpg) }</style></head>
<body><div style="background-image: url(https://images.cdn.net/hero.jpg)"></div></body></html>"#;
        let fetcher = FakeFetcher::default()
            .with("https://images.cdn.net/hero.jpg", b"hero", Some("image/jpeg"))
            .with("https://images.cdn.net/other.jpg", b"other", Some("image/jpeg"));
        let output = engine(fetcher).rewrite(markup, &NullProgress).await.unwrap();

        let index = text(&output, "index.html");
        assert!(index.contains("url('external_images/hero.jpg')"), "{}", index);
        assert!(index.contains("url('external_images/other.jpg')"), "{}", index);
        assert!(!index.contains("images.cdn.net"));
        assert_eq!(output.contents.get("external_images/hero.jpg"), Some(&b"hero"[..]));
        assert_eq!(output.report.harvested.len(), 2);
    }

    #[tokio::test]
    async fn test_optimistic_image_is_backfilled() {
        let markup = r#"<img src="https://avatars.example.net/u/7">"#;
        let fetcher = FakeFetcher::default().with("https://avatars.example.net/u/7", b"img", Some("image/png"));
        let output = engine(fetcher).rewrite(markup, &NullProgress).await.unwrap();

        assert!(text(&output, "index.html").contains(r#"src="external_images/7.jpg""#));
        assert_eq!(output.contents.get("external_images/7.jpg"), Some(&b"img"[..]));
    }

    #[tokio::test]
    async fn test_default_patches_are_applied() {
        let output = CloneEngine::new(page(), CloneConfig::default(), FakeFetcher::default())
            .unwrap()
            .rewrite("<html><head></head><body></body></html>", &NullProgress)
            .await
            .unwrap();
        assert_eq!(output.report.patches, vec!["offline-shim"]);
        assert!(text(&output, "index.html").contains("data-site-clone=\"offline-shim\""));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_completes() {
        let seen: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::default();
        let mut sink = MockProgressSink::new();
        let recorder = seen.clone();
        sink.expect_report()
            .returning(move |u| recorder.lock().unwrap().push(u.clone()));

        let fetcher = FakeFetcher::default().with("https://images.cdn.net/hero", b"jpeg", None);
        engine(fetcher).run(&renderer(), &sink).await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0].fraction <= w[1].fraction));
        assert_eq!(seen.last().unwrap().fraction, DONE);
        let statuses: Vec<_> = seen.iter().filter_map(|u| u.status.as_deref()).collect();
        for milestone in ["page settled", "cleaning up markup", "creating archive", "clone complete"] {
            assert!(statuses.contains(&milestone), "missing {}", milestone);
        }
    }

    #[test]
    fn test_parse_page_url() {
        assert_eq!(parse_page_url("example.com").unwrap().as_str(), "https://example.com/");
        assert_eq!(parse_page_url(" https://example.com/a ").unwrap().as_str(), "https://example.com/a");
        assert!(parse_page_url("ftp://example.com/").is_err());
        assert!(matches!(parse_page_url("http://[::1"), Err(CloneError::InvalidUrl { .. })));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = CloneConfig {
            harvest_concurrency: 0,
            ..CloneConfig::default()
        };
        assert!(CloneEngine::new(page(), config, FakeFetcher::default()).is_err());
    }
}
