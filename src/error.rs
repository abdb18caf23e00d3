//! Error taxonomy for configuration, fragment fetching and composition.
//!
//! - [`ConfigError`] is fatal at startup; the process refuses to run.
//! - [`RouteNotFound`] becomes a `404` for one request.
//! - [`FetchError`] is scoped to one slot and absorbed when the slot is optional.
//! - [`CompositionFailure`] means a required slot failed; the request gets the
//!   configured failure status.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::router::PatternError;

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("template `{template}`: {source}")]
    Route {
        template: String,
        #[source]
        source: PatternError,
    },

    #[error("fragment route: {0}")]
    FragmentRoute(#[source] PatternError),

    #[error("template id `{0}` is defined more than once")]
    DuplicateTemplate(String),

    #[error("templates `{first}` and `{second}` both claim route `{route}`")]
    DuplicateRoute {
        route: String,
        first: String,
        second: String,
    },

    #[error("template `{template}` defines slot `{slot}` more than once")]
    DuplicateSlot { template: String, slot: String },

    #[error("template `{template}`: optional slot `{slot}` has no fallback")]
    MissingFallback { template: String, slot: String },

    #[error("template `{template}`: slot `{slot}` has a zero timeout")]
    ZeroTimeout { template: String, slot: String },

    #[error("template `{template}`: slot `{slot}` uses invalid method `{method}`")]
    InvalidMethod {
        template: String,
        slot: String,
        method: String,
    },

    #[error("template `{template}`: {reason}")]
    Markup { template: String, reason: String },

    #[error("template `{0}` must set exactly one of `segments` or `html`")]
    AmbiguousBody(String),

    #[error("failure status {0} is not a supported 5xx status")]
    FailureStatus(u16),

    #[error("index route `{0}` must be an absolute path")]
    IndexRoute(String),

    #[error("at most {max} retries are allowed, got {got}")]
    TooManyRetries { max: u32, got: u32 },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// No template is registered for the requested path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no template for route `{path}`")]
pub struct RouteNotFound {
    pub path: String,
}

/// Why a single fragment fetch did not produce a body.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("URL parameter `{name}` is missing from the request")]
    MissingParam { name: String },

    #[error("URL parameter `{name}` would escape its path segment")]
    UnsafeParam { name: String },

    #[error("invalid fragment URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("`{0}` is not a valid HTTP method")]
    InvalidMethod(String),

    #[error("connection to upstream failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("upstream answered with status {0}")]
    Status(u16),

    #[error("request to upstream failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("failed to read upstream body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("fetch task ended without a result")]
    TaskEnded,
}

impl FetchError {
    /// Connection-level failures are the only ones worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Connect(_))
    }
}

/// A required slot could not be filled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("required slot `{slot}` failed: {cause}")]
pub struct CompositionFailure {
    pub slot: String,
    pub cause: String,
}

impl CompositionFailure {
    pub(crate) fn timed_out(slot: &str, after: Duration) -> Self {
        Self {
            slot: slot.to_owned(),
            cause: format!("timed out after {}ms", after.as_millis()),
        }
    }
}
