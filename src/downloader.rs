use futures::stream::{self, StreamExt};
use reqwest::{header, Client, ClientBuilder, Response};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use url::Url;

use crate::capture::{CaptureEvent, PageRenderer, RenderMessage, ResourceCategory};
use crate::config::CloneConfig;
use crate::error::{CloneError, Result};
use crate::harvester::{AssetFetcher, FetchedAsset};
use crate::html_parser::HtmlDocument;
use crate::markup::parse_srcset;
use crate::resolver::is_inert;
use crate::stylesheet::css_references;

/// reqwest-backed fetcher for harvested assets.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &CloneConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(&config.user_agent, config.request_timeout())?,
        })
    }

    async fn get(&self, url: &Url) -> std::result::Result<Response, String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(response)
    }
}

fn build_http_client(user_agent: &str, timeout: Duration) -> Result<Client> {
    ClientBuilder::new()
        .use_rustls_tls()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
        .map_err(|e| CloneError::Config(format!("failed to build HTTP client: {}", e)))
}

fn content_type_of(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedAsset> {
        let failed = |reason: String| CloneError::ExternalFetch {
            url: url.to_string(),
            reason,
        };
        let response = self.get(url).await.map_err(failed)?;
        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }
        let content_type = content_type_of(&response);
        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        Ok(FetchedAsset {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Static stand-in for a browser: loads the page over HTTP and captures the
/// sub-resources its markup and stylesheets name. Scripts are not executed.
pub struct HttpRenderer {
    fetcher: HttpFetcher,
    concurrency: usize,
    navigation_timeout: Duration,
    settle_delay: Duration,
    blocked: Vec<String>,
}

impl HttpRenderer {
    pub fn new(config: &CloneConfig) -> Result<Self> {
        let blocked = config
            .proxy_rules
            .iter()
            .map(|rule| rule.path_marker.clone())
            .chain(config.strip_markers.iter().cloned())
            .collect();
        Ok(Self {
            fetcher: HttpFetcher::new(config)?,
            concurrency: config.harvest_concurrency.max(1),
            navigation_timeout: config.navigation_timeout(),
            settle_delay: config.settle_delay(),
            blocked,
        })
    }

    /// Image proxies and API endpoints are never requested.
    fn is_blocked(&self, url: &Url) -> bool {
        self.blocked.iter().any(|marker| url.as_str().contains(marker.as_str()))
    }

    async fn navigate(&self, url: &Url) -> std::result::Result<(CaptureEvent, String), String> {
        let response = tokio::time::timeout(self.navigation_timeout, self.fetcher.get(url))
            .await
            .map_err(|_| format!("timed out after {}s", self.navigation_timeout.as_secs()))??;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let final_url = response.url().clone();
        let content_type = content_type_of(&response);
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        let markup = String::from_utf8_lossy(&bytes).into_owned();
        let content_type = content_type.as_deref().or(Some("text/html"));
        let event = CaptureEvent::loaded(final_url, ResourceCategory::Document, content_type, bytes.to_vec());
        Ok((event, markup))
    }

    async fn capture(&self, url: Url, hint: ResourceCategory) -> CaptureEvent {
        let response = match self.fetcher.get(&url).await {
            Ok(response) => response,
            Err(reason) => {
                debug!("request failed for {}: {}", url, reason);
                return CaptureEvent {
                    url,
                    category: hint,
                    ok: false,
                    content_type: None,
                    body: Err(reason),
                };
            }
        };
        let ok = response.status().is_success();
        let content_type = content_type_of(&response);
        let category = match ResourceCategory::classify(content_type.as_deref(), &url) {
            ResourceCategory::Other => hint,
            category => category,
        };
        let body = match response.bytes().await {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) => Err(e.to_string()),
        };
        CaptureEvent {
            url,
            category,
            ok,
            content_type,
            body,
        }
    }

    /// Fetch `targets` with bounded parallelism, forwarding each response.
    /// Returns the stylesheets that loaded, for the next discovery round.
    async fn capture_all(
        &self,
        targets: Vec<(Url, ResourceCategory)>,
        events: &UnboundedSender<RenderMessage>,
    ) -> Vec<(Url, String)> {
        let mut stylesheets = Vec::new();
        let mut responses = stream::iter(targets)
            .map(|(url, hint)| self.capture(url, hint))
            .buffer_unordered(self.concurrency);
        while let Some(event) = responses.next().await {
            if event.ok && event.category == ResourceCategory::Stylesheet {
                if let Ok(body) = &event.body {
                    stylesheets.push((event.url.clone(), String::from_utf8_lossy(body).into_owned()));
                }
            }
            if events.send(RenderMessage::Capture(event)).is_err() {
                break;
            }
        }
        stylesheets
    }

    fn admit(&self, url: Url, hint: ResourceCategory, seen: &mut HashSet<Url>) -> Option<(Url, ResourceCategory)> {
        if !matches!(url.scheme(), "http" | "https") || self.is_blocked(&url) {
            return None;
        }
        seen.insert(url.clone()).then_some((url, hint))
    }
}

impl PageRenderer for HttpRenderer {
    async fn render(&self, url: &Url, events: UnboundedSender<RenderMessage>) {
        info!("loading {}", url);
        let (document, markup) = match self.navigate(url).await {
            Ok(loaded) => loaded,
            Err(reason) => {
                let _ = events.send(RenderMessage::Failed(reason));
                return;
            }
        };
        let page = document.url.clone();
        if events.send(RenderMessage::Capture(document)).is_err() {
            return;
        }

        let mut seen = HashSet::from([page.clone()]);
        let targets: Vec<_> = discover_subresources(&markup, &page)
            .into_iter()
            .filter_map(|(url, hint)| self.admit(url, hint, &mut seen))
            .collect();
        info!("fetching {} page resources", targets.len());
        let stylesheets = self.capture_all(targets, &events).await;

        // One level of stylesheet references: fonts, backgrounds, imports.
        let nested: Vec<_> = stylesheets
            .iter()
            .flat_map(|(base, css)| {
                css_references(css)
                    .into_iter()
                    .filter_map(|reference| base.join(reference).ok())
                    .collect::<Vec<_>>()
            })
            .filter_map(|url| self.admit(url, ResourceCategory::Other, &mut seen))
            .collect();
        if !nested.is_empty() {
            info!("fetching {} stylesheet resources", nested.len());
            self.capture_all(nested, &events).await;
        }

        if !self.settle_delay.is_zero() {
            debug!("waiting {:?} for the page to settle", self.settle_delay);
            tokio::time::sleep(self.settle_delay).await;
        }
        if events.send(RenderMessage::Settled { markup }).is_err() {
            warn!("capture session closed before {} settled", page);
        }
    }
}

/// Sub-resources a browser would load for `markup`, in document order.
fn discover_subresources(markup: &str, page: &Url) -> Vec<(Url, ResourceCategory)> {
    let doc = HtmlDocument::parse(markup);
    let base = doc
        .first("base")
        .and_then(|el| el.attr("href"))
        .and_then(|href| page.join(&href).ok())
        .unwrap_or_else(|| page.clone());

    let mut found = Vec::new();
    let mut push = |reference: &str, hint: ResourceCategory| {
        let reference = reference.trim();
        if is_inert(reference) {
            return;
        }
        if let Ok(url) = base.join(reference) {
            found.push((url, hint));
        }
    };

    for el in doc.elements() {
        match el.name() {
            "link" => {
                let rel = el.attr("rel").unwrap_or_default().to_ascii_lowercase();
                let hint = if rel.contains("stylesheet") {
                    ResourceCategory::Stylesheet
                } else if rel.contains("icon") {
                    ResourceCategory::Image
                } else if rel.contains("modulepreload") {
                    ResourceCategory::Script
                } else if rel.contains("preload") {
                    ResourceCategory::Other
                } else {
                    continue;
                };
                if let Some(href) = el.attr("href") {
                    push(&href, hint);
                }
                if let Some(srcset) = el.attr("imagesrcset") {
                    for candidate in parse_srcset(&srcset) {
                        push(&candidate.url, ResourceCategory::Image);
                    }
                }
            }
            "script" => {
                if let Some(src) = el.attr("src") {
                    push(&src, ResourceCategory::Script);
                }
            }
            "img" | "source" => {
                if let Some(src) = el.attr("src") {
                    push(&src, ResourceCategory::Image);
                }
                if let Some(srcset) = el.attr("srcset") {
                    for candidate in parse_srcset(&srcset) {
                        push(&candidate.url, ResourceCategory::Image);
                    }
                }
            }
            "video" | "audio" => {
                if let Some(poster) = el.attr("poster") {
                    push(&poster, ResourceCategory::Image);
                }
                if let Some(src) = el.attr("src") {
                    push(&src, ResourceCategory::Media);
                }
            }
            _ => {}
        }
    }
    found
}
