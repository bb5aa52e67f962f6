//! Capture phase: renderer events streamed into the resource store.
//!
//! The renderer and the [`CaptureSession`] talk over an unbounded channel.
//! Every store mutation happens inside the session, and the phase ends only
//! when the renderer sends [`RenderMessage::Settled`].

use std::future::Future;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use url::Url;

use crate::canonical::canonical_key_with_limit;
use crate::error::{CloneError, Result};
use crate::progress::{Progress, CAPTURE_CEILING, EXPECTED_CAPTURES, SETTLED};
use crate::resolver::is_inert;
use crate::store::{CapturedResource, InsertOutcome, ResourceStore};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceCategory {
    Document,
    Stylesheet,
    Script,
    Image,
    Font,
    Media,
    Other,
}

impl ResourceCategory {
    pub fn is_captured(self) -> bool {
        !matches!(self, ResourceCategory::Other)
    }

    /// Best guess from a content type, falling back to the URL's extension.
    pub fn classify(content_type: Option<&str>, url: &Url) -> Self {
        let essence = content_type
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .or_else(|| mime_guess::from_path(url.path()).first());
        let Some(essence) = essence else {
            return ResourceCategory::Other;
        };
        match (essence.type_().as_str(), essence.subtype().as_str()) {
            ("text", "html") | ("application", "xhtml") => ResourceCategory::Document,
            ("text", "css") => ResourceCategory::Stylesheet,
            (_, "javascript") | (_, "ecmascript") | (_, "x-javascript") => ResourceCategory::Script,
            ("image", _) => ResourceCategory::Image,
            ("font", _) => ResourceCategory::Font,
            ("application", sub) if sub.starts_with("font") || sub.starts_with("x-font") => ResourceCategory::Font,
            ("video", _) | ("audio", _) => ResourceCategory::Media,
            _ => ResourceCategory::Other,
        }
    }
}

/// One observed network response.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub url: Url,
    pub category: ResourceCategory,
    pub ok: bool,
    pub content_type: Option<String>,
    /// `Err` carries the reason the body could not be read.
    pub body: std::result::Result<Vec<u8>, String>,
}

impl CaptureEvent {
    /// A successful, readable response.
    pub fn loaded(url: Url, category: ResourceCategory, content_type: Option<&str>, body: Vec<u8>) -> Self {
        Self {
            url,
            category,
            ok: true,
            content_type: content_type.map(str::to_string),
            body: Ok(body),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RenderMessage {
    Capture(CaptureEvent),
    /// Navigation finished and the page has settled; no further captures follow.
    Settled { markup: String },
    /// Navigation failed; the run is over.
    Failed(String),
}

/// Loads a page and reports what it fetched.
///
/// Implementations send every captured response, then exactly one `Settled`
/// or `Failed`. Dropping the sender without either counts as a failure.
pub trait PageRenderer: Send + Sync {
    fn render(&self, url: &Url, events: UnboundedSender<RenderMessage>) -> impl Future<Output = ()> + Send;
}

#[derive(Debug)]
pub struct CaptureOutcome {
    pub markup: String,
    pub captured: usize,
    pub warnings: Vec<CloneError>,
}

/// Append-only consumer of capture events for one run.
pub struct CaptureSession<'s> {
    store: &'s mut ResourceStore,
    max_key_len: usize,
    captured: usize,
    warnings: Vec<CloneError>,
}

impl<'s> CaptureSession<'s> {
    pub fn new(store: &'s mut ResourceStore, max_key_len: usize) -> Self {
        Self {
            store,
            max_key_len,
            captured: 0,
            warnings: Vec::new(),
        }
    }

    /// Store one event. Returns the key it landed under, if any.
    pub fn accept(&mut self, event: CaptureEvent) -> Option<String> {
        if !event.ok || !event.category.is_captured() || is_inert(event.url.as_str()) {
            debug!("ignoring {:?} response for {}", event.category, event.url);
            return None;
        }
        let bytes = match event.body {
            Ok(bytes) => bytes,
            Err(reason) => {
                let err = CloneError::CaptureDecode {
                    url: event.url.to_string(),
                    reason,
                };
                warn!("{}", err);
                self.warnings.push(err);
                return None;
            }
        };

        let key = canonical_key_with_limit(&event.url, self.max_key_len);
        let content_type = event
            .content_type
            .as_deref()
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        match self.store.insert(&key, CapturedResource::new(bytes, content_type)) {
            InsertOutcome::Duplicate => {
                debug!("already captured {}", key);
                None
            }
            InsertOutcome::Renamed { from, to } => {
                debug!("captured {} (moved {} to {})", key, from, to);
                self.captured += 1;
                Some(key)
            }
            InsertOutcome::Inserted => {
                debug!("captured {} -> {}", event.url, key);
                self.captured += 1;
                Some(key)
            }
        }
    }

    /// Drain `events` until the renderer settles.
    pub async fn run(
        mut self,
        mut events: UnboundedReceiver<RenderMessage>,
        page: &Url,
        progress: &Progress<'_>,
    ) -> Result<CaptureOutcome> {
        while let Some(message) = events.recv().await {
            match message {
                RenderMessage::Capture(event) => {
                    if let Some(key) = self.accept(event) {
                        let fraction = (self.captured as f64 / EXPECTED_CAPTURES).min(CAPTURE_CEILING);
                        progress.report(fraction, Some(&format!("captured {}", key)));
                    }
                }
                RenderMessage::Settled { markup } => {
                    info!("page settled with {} captured resources", self.captured);
                    progress.report(SETTLED, Some("page settled"));
                    return Ok(CaptureOutcome {
                        markup,
                        captured: self.captured,
                        warnings: self.warnings,
                    });
                }
                RenderMessage::Failed(reason) => {
                    return Err(CloneError::Navigation {
                        url: page.to_string(),
                        reason,
                    });
                }
            }
        }
        Err(CloneError::Navigation {
            url: page.to_string(),
            reason: "renderer stopped before the page settled".into(),
        })
    }
}
