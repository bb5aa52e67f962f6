use clap::Parser;
use std::path::PathBuf;

use crate::config::CloneConfig;
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(
    name = "site-clone",
    about = "Clone a web page and everything it loads into an offline ZIP archive",
    version,
    long_about = "Loads a page, captures every stylesheet, script, image, font and media file it references, rewrites all references to point at local copies and packages the result as a single ZIP that opens offline."
)]
pub struct CloneCommand {
    /// The URL of the page to clone
    #[arg(required = true)]
    pub url: String,

    /// Output archive (defaults to <host>_clone.zip)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Also extract the clone into this directory for local preview
    #[arg(long)]
    pub extract_dir: Option<PathBuf>,

    /// Maximum concurrent external asset downloads
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u64).range(1..))]
    pub concurrency: Option<u64>,

    /// Timeout for individual requests in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Timeout for loading the page itself in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub navigation_timeout: Option<u64>,

    /// User agent string to use for requests
    #[arg(long)]
    pub user_agent: Option<String>,

    /// JSON configuration file; flags given on the command line override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Do not inject the offline runtime shim into the cloned page
    #[arg(long)]
    pub no_shim: bool,

    /// Print progress as JSON lines instead of a progress bar
    #[arg(long)]
    pub progress_json: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl CloneCommand {
    /// Effective configuration: the config file (if any), then flags.
    pub fn to_config(&self) -> Result<CloneConfig> {
        let mut config = match &self.config {
            Some(path) => CloneConfig::from_file(path)?,
            None => CloneConfig::default(),
        };
        if let Some(concurrency) = self.concurrency {
            config.harvest_concurrency = concurrency as usize;
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        if let Some(timeout) = self.navigation_timeout {
            config.navigation_timeout_secs = timeout;
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        if self.no_shim {
            config.inject_static_shim = false;
        }
        config.validate()?;
        Ok(config)
    }
}

/// `<host>_clone.zip`, with anything but ASCII alphanumerics, `-` and `.`
/// replaced by `_`.
pub fn default_archive_name(host: &str) -> String {
    let host: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    let host = if host.is_empty() { "site".to_string() } else { host };
    format!("{}_clone.zip", host)
}
