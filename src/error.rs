// src/error.rs

//! Crate-wide error type and result alias
//!
//! Import failures carry a structured kind plus an optional underlying
//! cause, so callers and tests can match on the kind instead of parsing
//! message strings.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the import pipeline and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// Scratch directory reports no usable space, or cannot be examined at all
    #[error("invalid path: no usable space at {0}")]
    InvalidPath(PathBuf),

    /// The caller declared a content type this source cannot import
    #[error("unsupported content type {0}: this data source only supports disk images")]
    UnsupportedContentType(crate::importer::ContentType),

    /// The format reader stack could not classify the source stream
    #[error("could not classify source stream")]
    ClassificationFailed(#[source] std::io::Error),

    /// The conversion subprocess exited non-zero or failed to launch
    #[error("could not stream/convert image to raw")]
    ConversionFailed(#[source] Box<Error>),

    /// Releasing the format reader stack during close failed
    #[error("failed to release reader stack")]
    ResourceReleaseFailed(#[source] std::io::Error),

    /// A phase operation ran before the pipeline was initialized
    #[error("invalid pipeline state: {0}")]
    InvalidState(&'static str),

    /// The endpoint string could not be parsed into a URL
    #[error("unable to parse endpoint {endpoint:?}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },

    /// Building the HTTP client or loading trust material failed
    #[error("failed to configure HTTP client")]
    HttpClient(#[source] reqwest::Error),

    /// The HTTP request itself failed (connect, TLS, read)
    #[error("HTTP request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The endpoint answered with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// An external process failed to launch, timed out, or exited non-zero
    #[error("{command} failed: {detail}")]
    ProcessFailed { command: String, detail: String },

    /// An environment variable held an undecodable value
    #[error("environment variable {0} is not valid")]
    EnvVar(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
