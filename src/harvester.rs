use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{CloneError, Result};
use crate::progress::Progress;
use crate::store::{CapturedResource, InsertOutcome, ResourceStore};

const DEFAULT_IMAGE_TYPE: &str = "image/jpeg";

/// A resource referenced by URL but never loaded by the renderer, and the key
/// reserved for it in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalAssetRequest {
    pub url: Url,
    pub local_path: String,
}

impl ExternalAssetRequest {
    pub fn new(url: Url, local_path: String) -> Self {
        Self { url, local_path }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Fetches a single remote asset.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<FetchedAsset>> + Send;
}

#[derive(Debug, Default)]
pub struct HarvestReport {
    pub harvested: Vec<String>,
    pub failures: Vec<CloneError>,
}

/// Deduplicated queue of external assets, fetched with bounded parallelism.
pub struct Harvester<F> {
    fetcher: F,
    concurrency: usize,
    queue: Vec<ExternalAssetRequest>,
    seen: HashSet<ExternalAssetRequest>,
    reserved: HashMap<String, Url>,
    layout_fixed: bool,
}

impl<F: AssetFetcher> Harvester<F> {
    pub fn new(fetcher: F, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
            queue: Vec::new(),
            seen: HashSet::new(),
            reserved: HashMap::new(),
            layout_fixed: false,
        }
    }

    /// Queue `request`. Returns false for repeats, and for a second URL
    /// claiming an already reserved local path.
    pub fn queue(&mut self, request: ExternalAssetRequest) -> bool {
        if self.seen.contains(&request) {
            return false;
        }
        if let Some(owner) = self.reserved.get(&request.local_path) {
            warn!(
                "{} maps to {} which is already reserved for {}; skipping",
                request.url, request.local_path, owner
            );
            return false;
        }
        debug!("queued external asset {} -> {}", request.url, request.local_path);
        self.reserved
            .insert(request.local_path.clone(), request.url.clone());
        self.seen.insert(request.clone());
        self.queue.push(request);
        true
    }

    /// Existing keys are referenced from rewritten output from now on; later
    /// harvests skip assets whose insertion would rename one of them.
    pub fn fix_layout(&mut self) {
        self.layout_fixed = true;
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Fetch everything queued so far and insert successes into `store`.
    ///
    /// Failed requests are dropped for the rest of the run; references to
    /// their reserved paths stay as they are.
    pub async fn harvest(
        &mut self,
        store: &mut ResourceStore,
        progress: &Progress<'_>,
        span: (f64, f64),
    ) -> HarvestReport {
        let requests: Vec<_> = std::mem::take(&mut self.queue)
            .into_iter()
            .filter(|request| !store.contains(&request.local_path))
            .collect();
        let total = requests.len();
        let mut report = HarvestReport::default();
        if total == 0 {
            return report;
        }
        info!("harvesting {} external assets", total);

        let fetcher = &self.fetcher;
        let mut results = stream::iter(requests)
            .map(|request| async move {
                let result = fetcher.fetch(&request.url).await;
                (request, result)
            })
            .buffer_unordered(self.concurrency);

        let mut done = 0;
        while let Some((request, result)) = results.next().await {
            done += 1;
            match result {
                Ok(_) if self.layout_fixed && store.would_rename(&request.local_path) => {
                    let err = CloneError::ReferenceUnresolved {
                        reference: request.url.to_string(),
                    };
                    warn!(
                        "{} cannot be stored at {} without moving a referenced file; dropped",
                        request.url, request.local_path
                    );
                    report.failures.push(err);
                    progress.step(span.0, span.1, done, total, None);
                }
                Ok(asset) => {
                    let content_type = asset
                        .content_type
                        .filter(|ct| !ct.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_IMAGE_TYPE.to_string());
                    let resource = CapturedResource::new(asset.bytes, &content_type);
                    match store.insert(&request.local_path, resource) {
                        InsertOutcome::Renamed { from, to } => {
                            debug!("harvested {} moved {} to {}", request.url, from, to)
                        }
                        InsertOutcome::Duplicate => {
                            debug!("{} already captured", request.local_path)
                        }
                        InsertOutcome::Inserted => {}
                    }
                    info!("harvested {} -> {}", request.url, request.local_path);
                    report.harvested.push(request.local_path.clone());
                    let status = format!("harvested {}", request.local_path);
                    progress.step(span.0, span.1, done, total, Some(&status));
                }
                Err(err) => {
                    warn!("{}", err);
                    report.failures.push(err);
                    progress.step(span.0, span.1, done, total, None);
                }
            }
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::progress::NullProgress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned bodies; every other URL fails like a 404.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub assets: HashMap<String, (Vec<u8>, Option<String>)>,
        pub calls: AtomicUsize,
    }

    impl FakeFetcher {
        pub fn with(mut self, url: &str, body: &[u8], content_type: Option<&str>) -> Self {
            self.assets
                .insert(url.to_string(), (body.to_vec(), content_type.map(str::to_string)));
            self
        }
    }

    impl AssetFetcher for FakeFetcher {
        async fn fetch(&self, url: &Url) -> Result<FetchedAsset> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.assets.get(url.as_str()) {
                Some((bytes, content_type)) => Ok(FetchedAsset {
                    bytes: bytes.clone(),
                    content_type: content_type.clone(),
                }),
                None => Err(CloneError::ExternalFetch {
                    url: url.to_string(),
                    reason: "HTTP 404 Not Found".into(),
                }),
            }
        }
    }

    fn request(url: &str, path: &str) -> ExternalAssetRequest {
        ExternalAssetRequest::new(Url::parse(url).unwrap(), path.to_string())
    }

    #[test]
    fn test_queue_deduplicates_by_value() {
        let mut harvester = Harvester::new(FakeFetcher::default(), 2);
        assert!(harvester.queue(request("https://cdn.net/a.png", "external_images/a.png")));
        assert!(!harvester.queue(request("https://cdn.net/a.png", "external_images/a.png")));
        // Same basename from another host collides with the reserved path.
        assert!(!harvester.queue(request("https://img.org/a.png", "external_images/a.png")));
        assert_eq!(harvester.pending(), 1);
    }

    #[tokio::test]
    async fn test_harvest_inserts_with_default_content_type() {
        let fetcher = FakeFetcher::default()
            .with("https://cdn.net/a.png", b"png", Some("image/png"))
            .with("https://cdn.net/b", b"jpeg", None);
        let mut harvester = Harvester::new(fetcher, 2);
        harvester.queue(request("https://cdn.net/a.png", "external_images/a.png"));
        harvester.queue(request("https://cdn.net/b", "external_images/b.jpg"));

        let mut store = ResourceStore::new();
        let sink = NullProgress;
        let report = harvester.harvest(&mut store, &Progress::new(&sink), (0.7, 0.8)).await;

        assert_eq!(report.harvested.len(), 2);
        assert!(report.failures.is_empty());
        assert_eq!(store.get("external_images/a.png").unwrap().content_type, "image/png");
        assert_eq!(store.get("external_images/b.jpg").unwrap().content_type, "image/jpeg");
        assert_eq!(harvester.pending(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_not_retried() {
        let fetcher = FakeFetcher::default().with("https://cdn.net/ok.png", b"ok", None);
        let mut harvester = Harvester::new(fetcher, 4);
        harvester.queue(request("https://cdn.net/ok.png", "external_images/ok.png"));
        harvester.queue(request("https://cdn.net/gone.png", "external_images/gone.png"));

        let mut store = ResourceStore::new();
        let sink = NullProgress;
        let progress = Progress::new(&sink);
        let report = harvester.harvest(&mut store, &progress, (0.7, 0.8)).await;

        assert_eq!(report.harvested, vec!["external_images/ok.png".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.failures[0].is_fatal());
        assert!(!store.contains("external_images/gone.png"));

        assert!(!harvester.queue(request("https://cdn.net/gone.png", "external_images/gone.png")));
        assert_eq!(harvester.fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(progress.fraction(), 0.8);
    }

    #[tokio::test]
    async fn test_fixed_layout_skips_renaming_inserts() {
        let fetcher = FakeFetcher::default()
            .with("https://cdn.net/a.png", b"a", None)
            .with("https://cdn.net/b.png", b"b", None);
        let mut harvester = Harvester::new(fetcher, 2);
        harvester.fix_layout();
        harvester.queue(request("https://cdn.net/a.png", "external_images/a.png"));
        harvester.queue(request("https://cdn.net/b.png", "media/b.png"));

        let mut store = ResourceStore::new();
        store.insert("external_images", CapturedResource::new(b"page".to_vec(), "text/html"));
        let sink = NullProgress;
        let report = harvester.harvest(&mut store, &Progress::new(&sink), (0.7, 0.8)).await;

        assert_eq!(report.harvested, vec!["media/b.png".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0], CloneError::ReferenceUnresolved { .. }));
        assert!(store.contains("external_images"));
        assert!(!store.contains("external_images/a.png"));
    }

    #[tokio::test]
    async fn test_already_captured_paths_are_not_fetched() {
        let mut harvester = Harvester::new(FakeFetcher::default(), 1);
        harvester.queue(request("https://cdn.net/a.png", "external_images/a.png"));

        let mut store = ResourceStore::new();
        store.insert("external_images/a.png", CapturedResource::new(b"x".to_vec(), "image/png"));
        let sink = NullProgress;
        let report = harvester.harvest(&mut store, &Progress::new(&sink), (0.7, 0.8)).await;

        assert!(report.harvested.is_empty());
        assert!(report.failures.is_empty());
        assert_eq!(harvester.fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
