pub mod canonical;
pub mod capture;
pub mod cli;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod file_manager;
pub mod harvester;
pub mod html_parser;
pub mod markup;
pub mod patches;
pub mod progress;
pub mod resolver;
pub mod store;
pub mod stylesheet;

// Re-export main types for convenience
pub use canonical::{canonical_key, external_image_key};
pub use capture::{CaptureEvent, PageRenderer, RenderMessage, ResourceCategory};
pub use cli::CloneCommand;
pub use config::{CloneConfig, ProxyRule};
pub use downloader::{HttpFetcher, HttpRenderer};
pub use engine::{parse_page_url, CloneEngine, CloneOutput, CloneReport};
pub use error::{CloneError, Result};
pub use file_manager::{write_zip, ArchiveContents, FileManager};
pub use harvester::{AssetFetcher, ExternalAssetRequest, FetchedAsset};
pub use html_parser::HtmlDocument;
pub use patches::{ScriptPatch, SitePatch};
pub use progress::{BarProgress, JsonProgress, LogProgress, NullProgress, ProgressSink, ProgressUpdate};
pub use resolver::{Resolution, Resolver};
pub use store::{CapturedResource, ResourceStore};
