use site_clone::{
    canonical_key, AssetFetcher, CaptureEvent, CapturedResource, CloneConfig, CloneEngine, CloneError, FetchedAsset,
    FileManager, LogProgress, NullProgress, PageRenderer, RenderMessage, ResourceCategory, ResourceStore,
};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

/// Replays canned responses the way a browser session would report them.
struct FakeRenderer {
    responses: Vec<(&'static str, &'static str, Vec<u8>)>,
    markup: String,
}

impl PageRenderer for FakeRenderer {
    async fn render(&self, _url: &Url, events: UnboundedSender<RenderMessage>) {
        for (url, content_type, body) in &self.responses {
            let url = Url::parse(url).unwrap();
            let category = ResourceCategory::classify(Some(*content_type), &url);
            let event = CaptureEvent::loaded(url, category, Some(*content_type), body.clone());
            events.send(RenderMessage::Capture(event)).unwrap();
        }
        events
            .send(RenderMessage::Settled {
                markup: self.markup.clone(),
            })
            .unwrap();
    }
}

#[derive(Default)]
struct MapFetcher {
    assets: HashMap<String, Vec<u8>>,
}

impl AssetFetcher for MapFetcher {
    async fn fetch(&self, url: &Url) -> site_clone::Result<FetchedAsset> {
        match self.assets.get(url.as_str()) {
            Some(bytes) => Ok(FetchedAsset {
                bytes: bytes.clone(),
                content_type: None,
            }),
            None => Err(CloneError::ExternalFetch {
                url: url.to_string(),
                reason: "connection refused".into(),
            }),
        }
    }
}

const MARKUP: &str = r#"<!DOCTYPE html>
<html><head>
<link rel="stylesheet" href="/assets/site.css?v=3">
<script src="/_next/static/chunks/main.js"></script>
<script async src="https://www.googletagmanager.com/gtag/js?id=G-XYZ"></script>
</head><body>
<img src="/logo.svg" alt="logo">
<img src="https://cdn.example.net/team/avatar" alt="avatar">
<a href="/docs/">Docs</a>
<a href="mailto:hi@example.com">Mail</a>
</body></html>"#;

fn renderer() -> FakeRenderer {
    FakeRenderer {
        responses: vec![
            ("https://example.com/", "text/html; charset=utf-8", MARKUP.as_bytes().to_vec()),
            (
                "https://example.com/assets/site.css?v=3",
                "text/css",
                b"body { background: url(../img/bg.png) } h1 { font-family: x; src: url(/fonts/x.woff2) }".to_vec(),
            ),
            ("https://example.com/img/bg.png", "image/png", b"bg".to_vec()),
            ("https://example.com/fonts/x.woff2", "font/woff2", b"font".to_vec()),
            ("https://example.com/_next/static/chunks/main.js", "application/javascript", b"main()".to_vec()),
            ("https://example.com/logo.svg", "image/svg+xml", b"<svg/>".to_vec()),
            ("https://example.com/docs/", "text/html", b"<html>docs</html>".to_vec()),
            ("https://example.com/docs/guide", "text/html", b"<html>guide</html>".to_vec()),
        ],
        markup: MARKUP.to_string(),
    }
}

fn engine(fetcher: MapFetcher) -> CloneEngine<MapFetcher> {
    let config = CloneConfig {
        inject_static_shim: false,
        ..CloneConfig::default()
    };
    CloneEngine::new(Url::parse("https://example.com/").unwrap(), config, fetcher).unwrap()
}

fn read_zip(archive: &[u8]) -> HashMap<String, Vec<u8>> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive.to_vec())).unwrap();
    let mut files = HashMap::new();
    for i in 0..zip.len() {
        let mut file = zip.by_index(i).unwrap();
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).unwrap();
        files.insert(file.name().to_string(), bytes);
    }
    files
}

#[tokio::test]
async fn test_clone_produces_self_contained_archive() {
    let fetcher = MapFetcher {
        assets: HashMap::from([("https://cdn.example.net/team/avatar".to_string(), b"jpeg".to_vec())]),
    };
    let output = engine(fetcher).run(&renderer(), &NullProgress).await.unwrap();
    let files = read_zip(&output.archive);

    let index = String::from_utf8(files["index.html"].clone()).unwrap();
    assert!(index.contains(r#"href="assets/site.css%3Fv=3""#), "{}", index);
    assert!(index.contains(r#"src="_next/static/chunks/main.js""#));
    assert!(index.contains(r#"src="logo.svg""#));
    assert!(index.contains(r#"src="external_images/avatar.jpg""#));
    assert!(index.contains(r#"href="docs/index.html""#));
    assert!(index.contains(r#"href="mailto:hi@example.com""#));
    assert!(!index.contains("googletagmanager"));

    let css = String::from_utf8(files["assets/site.css?v=3"].clone()).unwrap();
    assert_eq!(
        css,
        "body { background: url('../img/bg.png') } h1 { font-family: x; src: url('../fonts/x.woff2') }"
    );
    assert_eq!(files["external_images/avatar.jpg"], b"jpeg");
    assert_eq!(files["docs/guide"], b"<html>guide</html>");
    assert!(output.report.warnings.is_empty(), "{:?}", output.report.warnings);
}

#[tokio::test]
async fn test_every_rewritten_css_reference_exists_in_archive() {
    let output = engine(MapFetcher::default()).run(&renderer(), &NullProgress).await.unwrap();
    let files = read_zip(&output.archive);

    let css_key = "assets/site.css?v=3";
    let css = String::from_utf8(files[css_key].clone()).unwrap();
    let css_url = Url::parse(&format!("file:///root/{}", css_key.replace('?', "%3F"))).unwrap();
    for reference in css.split("url('").skip(1).filter_map(|rest| rest.split("')").next()) {
        let target = css_url.join(reference).unwrap();
        let path = percent_encoding::percent_decode_str(target.path().trim_start_matches("/root/"))
            .decode_utf8()
            .unwrap()
            .into_owned();
        assert!(files.contains_key(&path), "{} -> {} missing", reference, path);
    }
}

#[tokio::test]
async fn test_failed_external_image_keeps_reserved_path() {
    let output = engine(MapFetcher::default()).run(&renderer(), &NullProgress).await.unwrap();
    let files = read_zip(&output.archive);

    let index = String::from_utf8(files["index.html"].clone()).unwrap();
    assert!(index.contains(r#"src="external_images/avatar.jpg""#));
    assert!(!files.contains_key("external_images/avatar.jpg"));
    assert_eq!(output.report.failed_fetches(), 1);
}

#[tokio::test]
async fn test_directory_and_file_collision_keeps_both() {
    let renderer = FakeRenderer {
        responses: vec![
            ("https://example.com/blog", "text/html", b"<html>blog</html>".to_vec()),
            ("https://example.com/blog/post.css", "text/css", b"p{}".to_vec()),
        ],
        markup: r#"<html><head><link rel="stylesheet" href="/blog/post.css"></head><body><a href="/blog">Blog</a></body></html>"#
            .to_string(),
    };
    let output = engine(MapFetcher::default()).run(&renderer, &NullProgress).await.unwrap();
    let files = read_zip(&output.archive);

    assert_eq!(files["blog_file"], b"<html>blog</html>");
    assert_eq!(files["blog/post.css"], b"p{}");
    let index = String::from_utf8(files["index.html"].clone()).unwrap();
    assert!(index.contains(r#"href="blog_file""#), "{}", index);
}

#[tokio::test]
async fn test_extract_to_directory() {
    let output = engine(MapFetcher::default()).run(&renderer(), &NullProgress).await.unwrap();
    let temp_dir = tempdir().unwrap();
    let manager = FileManager::new(temp_dir.path()).unwrap();

    let written = manager.extract(&output.contents).unwrap();
    assert_eq!(written, output.contents.len());
    assert!(manager.file_exists("index.html"));
    assert!(manager.file_exists("img/bg.png"));

    let archive_path = temp_dir.path().join("example.com_clone.zip");
    FileManager::save_archive(&archive_path, &output.archive).unwrap();
    assert!(archive_path.exists());
}

#[tokio::test]
async fn test_query_with_dot_segments_extracts_inside_output_dir() {
    let renderer = FakeRenderer {
        responses: vec![(
            "https://example.com/img?p=../../../../escape.png",
            "image/png",
            b"png".to_vec(),
        )],
        markup: r#"<html><body><img src="/img?p=../../../../escape.png"></body></html>"#.to_string(),
    };
    let output = engine(MapFetcher::default()).run(&renderer, &NullProgress).await.unwrap();

    let mut zip = zip::ZipArchive::new(Cursor::new(output.archive.clone())).unwrap();
    for i in 0..zip.len() {
        let entry = zip.by_index(i).unwrap();
        assert!(entry.enclosed_name().is_some(), "{} escapes the archive root", entry.name());
    }

    let temp_dir = tempdir().unwrap();
    let manager = FileManager::new(temp_dir.path()).unwrap();
    assert_eq!(manager.extract(&output.contents).unwrap(), 2);
    assert!(manager.file_exists("img?p=../_/_/_/escape.png"));
}

#[tokio::test]
async fn test_rewrite_against_prepared_store() {
    let mut store = ResourceStore::new();
    store.insert(
        "css/site.css",
        CapturedResource::new(&b"body { background: url(/images/a.png) }"[..], "text/css"),
    );
    store.insert("images/a.png", CapturedResource::new(&b"png"[..], "image/png"));

    let engine = engine(MapFetcher::default()).with_store(store);
    assert_eq!(engine.page().as_str(), "https://example.com/");
    assert_eq!(engine.store().len(), 2);

    let markup = r#"<html><head><link rel="stylesheet" href="/css/site.css"></head><body><img src="images/a.png"></body></html>"#;
    let output = engine.rewrite(markup, &LogProgress).await.unwrap();
    let files = read_zip(&output.archive);

    let index = String::from_utf8(files["index.html"].clone()).unwrap();
    assert!(index.contains(r#"href="css/site.css""#), "{}", index);
    assert!(index.contains(r#"src="images/a.png""#));
    assert_eq!(
        String::from_utf8(files["css/site.css"].clone()).unwrap(),
        "body { background: url('../images/a.png') }"
    );
    assert_eq!(output.report.captured, 2);
}

#[test]
fn test_canonical_key_scenario() {
    let url = Url::parse("https://example.com/a?x=1").unwrap();
    assert_eq!(canonical_key(&url), "a?x=1");
}
