//! Post-processing hooks applied to the rewritten document.
//!
//! Each patch decides for itself which sites it applies to, so the rewrite
//! pipeline never branches on a host name.

use tracing::debug;
use url::Url;

use crate::config::CloneConfig;
use crate::html_parser::HtmlDocument;

pub trait SitePatch: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, page: &Url) -> bool;

    fn apply(&self, doc: &mut HtmlDocument);
}

/// Appends an inline `<script>` to `<head>`.
pub struct ScriptPatch {
    name: String,
    /// `None` matches every page.
    host_suffix: Option<String>,
    script: String,
}

impl ScriptPatch {
    pub fn new(name: &str, host_suffix: Option<&str>, script: &str) -> Self {
        Self {
            name: name.to_string(),
            host_suffix: host_suffix.map(|s| s.trim_start_matches('.').to_ascii_lowercase()),
            script: script.to_string(),
        }
    }
}

impl SitePatch for ScriptPatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, page: &Url) -> bool {
        let Some(suffix) = &self.host_suffix else {
            return true;
        };
        let Some(host) = page.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        host == *suffix || host.ends_with(&format!(".{}", suffix))
    }

    fn apply(&self, doc: &mut HtmlDocument) {
        debug!("injecting {} script", self.name);
        doc.append_to_head("script", &[("data-site-clone", self.name.as_str())], &self.script);
    }
}

/// Keeps a cloned single-page app quiet when opened from disk: API calls
/// and proxy images get empty local answers, and chunk-load errors are
/// swallowed.
pub const OFFLINE_SHIM: &str = r#"(function () {
  if (window.location.protocol !== 'file:') return;
  var assets = /\.(css|js|mjs|json|png|jpe?g|gif|svg|webp|avif|ico|woff2?|ttf|otf|eot|mp4|webm|ogg)$/i;
  function blocked(url) {
    try {
      var path = new URL(url, window.location.href).pathname;
      return path.indexOf('/_next/image') !== -1 || !assets.test(path);
    } catch (e) {
      return !assets.test(String(url));
    }
  }
  var originalFetch = window.fetch;
  if (originalFetch) {
    window.fetch = function (input, init) {
      var url = typeof input === 'string' ? input : input && input.url;
      if (blocked(url)) {
        var image = String(url).indexOf('/_next/image') !== -1;
        return Promise.resolve(new Response(image ? new Blob() : '{}', {
          status: 200,
          headers: { 'Content-Type': image ? 'image/png' : 'application/json' }
        }));
      }
      return originalFetch.apply(this, arguments).catch(function () {
        return new Response('{}', { status: 200, headers: { 'Content-Type': 'application/json' } });
      });
    };
  }
  var originalOpen = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, url) {
    if (blocked(url)) {
      var xhr = this;
      setTimeout(function () {
        Object.defineProperty(xhr, 'readyState', { value: 4 });
        Object.defineProperty(xhr, 'status', { value: 200 });
        Object.defineProperty(xhr, 'responseText', { value: '{}' });
        if (xhr.onreadystatechange) xhr.onreadystatechange();
        if (xhr.onload) xhr.onload();
      }, 0);
      return;
    }
    return originalOpen.apply(this, arguments);
  };
  window.addEventListener('error', function (event) {
    var message = event && event.message ? String(event.message) : '';
    if (/Loading (CSS )?chunk/i.test(message)) event.preventDefault();
  }, true);
  window.addEventListener('unhandledrejection', function (event) {
    var reason = event && event.reason ? String(event.reason.message || event.reason) : '';
    if (/Loading (CSS )?chunk|ChunkLoadError/i.test(reason)) event.preventDefault();
  });
  var placeholder = function (img) {
    if (img.src && img.src.indexOf('/_next/image') !== -1) {
      img.src = '__PLACEHOLDER__';
      img.style.opacity = '0.5';
    }
  };
  document.addEventListener('DOMContentLoaded', function () {
    Array.prototype.forEach.call(document.images, placeholder);
  });
})();"#;

/// Answers the image-generation endpoints of raphael.app with a static
/// "Generated Image" tile so the demo UI stays usable offline.
const GENERATOR_MOCK: &str = r#"(function () {
  var tile = 'data:image/svg+xml;base64,PHN2ZyB3aWR0aD0iNTEyIiBoZWlnaHQ9IjUxMiIgeG1sbnM9Imh0dHA6Ly93d3cudzMub3JnLzIwMDAvc3ZnIj48cmVjdCB3aWR0aD0iNTEyIiBoZWlnaHQ9IjUxMiIgZmlsbD0iIzYzNjZmMSIvPjx0ZXh0IHg9IjI1NiIgeT0iMjU2IiBmb250LXNpemU9IjI0IiBmaWxsPSJ3aGl0ZSIgdGV4dC1hbmNob3I9Im1pZGRsZSI+R2VuZXJhdGVkIEltYWdlPC90ZXh0Pjwvc3ZnPg==';
  var originalFetch = window.fetch;
  if (!originalFetch) return;
  window.fetch = function (input) {
    var url = typeof input === 'string' ? input : input && input.url;
    if (/\/api\/generate|\/generate|replicate\.com/.test(String(url))) {
      return Promise.resolve(new Response(JSON.stringify({
        imageUrl: tile,
        success: true,
        message: 'Static clone - generation not available'
      }), { status: 200, headers: { 'Content-Type': 'application/json' } }));
    }
    return originalFetch.apply(this, arguments);
  };
})();"#;

/// Patches installed for every run under `config`.
pub fn default_patches(config: &CloneConfig) -> Vec<Box<dyn SitePatch>> {
    let mut patches: Vec<Box<dyn SitePatch>> = vec![Box::new(ScriptPatch::new(
        "image-generator-mock",
        Some("raphael.app"),
        GENERATOR_MOCK,
    ))];
    if config.inject_static_shim {
        let shim = OFFLINE_SHIM.replace("__PLACEHOLDER__", crate::markup::PLACEHOLDER_IMAGE);
        patches.push(Box::new(ScriptPatch::new("offline-shim", None, &shim)));
    }
    patches
}

/// Apply every patch whose predicate matches `page`. Returns the names applied.
pub fn apply_patches(patches: &[Box<dyn SitePatch>], page: &Url, doc: &mut HtmlDocument) -> Vec<String> {
    patches
        .iter()
        .filter(|patch| patch.applies_to(page))
        .map(|patch| {
            patch.apply(doc);
            patch.name().to_string()
        })
        .collect()
}
