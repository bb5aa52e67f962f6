use thiserror::Error;

/// Everything that can go wrong during one clone run.
///
/// Only the fatal kinds ever escape [`crate::CloneEngine::run`]; the rest are
/// logged, recorded in the run report and the clone carries on with a
/// degraded copy.
#[derive(Error, Debug)]
pub enum CloneError {
    #[error("failed to load {url}: {reason}")]
    Navigation { url: String, reason: String },

    #[error("could not read captured response for {url}: {reason}")]
    CaptureDecode { url: String, reason: String },

    #[error("no local resource for reference {reference:?}")]
    ReferenceUnresolved { reference: String },

    #[error("failed to fetch external asset {url}: {reason}")]
    ExternalFetch { url: String, reason: String },

    #[error("failed to package archive: {reason}")]
    Packaging { reason: String },

    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CloneError {
    /// Fatal errors abort the run; everything else degrades output quality.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CloneError::Navigation { .. }
                | CloneError::Packaging { .. }
                | CloneError::InvalidUrl { .. }
                | CloneError::Config(_)
        )
    }

    pub(crate) fn packaging(err: impl std::fmt::Display) -> Self {
        CloneError::Packaging {
            reason: err.to_string(),
        }
    }
}

pub type Result<T, E = CloneError> = std::result::Result<T, E>;
