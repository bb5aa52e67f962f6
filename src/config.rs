use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CloneError, Result};

/// Longest canonical key accepted before it is replaced by a hashed name.
pub const DEFAULT_MAX_KEY_LEN: usize = 200;

/// An image-optimization endpoint that carries the original image URL in a
/// query parameter, e.g. `/_next/image?url=%2Fphoto.png&w=640`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRule {
    pub path_marker: String,
    pub param: String,
}

impl ProxyRule {
    pub fn new(path_marker: &str, param: &str) -> Self {
        Self {
            path_marker: path_marker.to_string(),
            param: param.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneConfig {
    /// Maximum time allowed for the initial page load.
    pub navigation_timeout_secs: u64,
    /// Extra wait after navigation before the capture phase is declared settled.
    pub settle_delay_ms: u64,
    /// Per-request timeout for sub-resources and harvested assets.
    pub request_timeout_secs: u64,
    /// Parallel fetches allowed while capturing and harvesting.
    pub harvest_concurrency: usize,
    pub user_agent: String,
    pub max_key_len: usize,
    pub proxy_rules: Vec<ProxyRule>,
    /// Substrings marking API/analytics endpoints whose references are stripped.
    pub strip_markers: Vec<String>,
    /// Append the offline runtime shim script to every cloned page.
    pub inject_static_shim: bool,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            navigation_timeout_secs: 60,
            settle_delay_ms: 0,
            request_timeout_secs: 30,
            harvest_concurrency: 4,
            user_agent: "SiteClone/1.0".to_string(),
            max_key_len: DEFAULT_MAX_KEY_LEN,
            proxy_rules: vec![
                ProxyRule::new("/_next/image", "url"),
                ProxyRule::new("/_vercel/image", "url"),
            ],
            strip_markers: vec![
                "/api/".to_string(),
                "gtag/js".to_string(),
                "/_next/webpack-hmr".to_string(),
            ],
            inject_static_shim: true,
        }
    }
}

impl CloneConfig {
    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CloneError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: CloneConfig = serde_json::from_str(&text)
            .map_err(|e| CloneError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.harvest_concurrency == 0 {
            return Err(CloneError::Config("harvest_concurrency must be at least 1".into()));
        }
        // Hashed names need room for `file_` plus a 10-digit hash.
        if self.max_key_len < 32 {
            return Err(CloneError::Config("max_key_len must be at least 32".into()));
        }
        if self.proxy_rules.iter().any(|r| r.path_marker.is_empty() || r.param.is_empty()) {
            return Err(CloneError::Config("proxy rules need a path marker and a parameter".into()));
        }
        Ok(())
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
