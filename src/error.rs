//! Error types for target parsing, watching and resolution.

use std::io;
use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;
use tonic::{Code, Status};

/// Result type for resolver operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while resolving a Kubernetes service.
///
/// Only [`Error::InvalidTarget`], [`Error::MissingEnvironment`], [`Error::Namespace`] and
/// [`Error::Runtime`] are returned synchronously from constructors. Everything else is
/// reported through [`Subscriber::on_error`](crate::Subscriber::on_error) and can be
/// recovered from by refreshing the resolver.
#[derive(Debug, Error)]
pub enum Error {
    /// No service name could be extracted from the resolver target.
    #[error("cannot parse service name from target '{0}'")]
    InvalidTarget(String),

    /// A required in-cluster environment variable is not set.
    #[error("{name} env variable not set")]
    MissingEnvironment {
        /// Name of the missing variable.
        name: &'static str,
    },

    /// The mounted namespace file exists but could not be read.
    #[error("failed to read namespace from '{}'", path.display())]
    Namespace {
        /// Path of the namespace file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The API server host is not an absolute `http`/`https` URI.
    #[error("invalid kube-apiserver host '{0}'")]
    InvalidHost(String),

    /// The watch request could not be built, e.g. the URI contains invalid characters.
    #[error("invalid watch request")]
    InvalidRequest(#[source] http::Error),

    /// The CA certificate could not be read or parsed.
    #[error("failed to load CA certificate")]
    CaCertificate(#[source] io::Error),

    /// The CA certificate source held no PEM certificate.
    #[error("no certificate found in CA certificate source")]
    MissingCaCertificate,

    /// The bearer token could not be read.
    #[error("failed to read bearer token")]
    Token(#[source] io::Error),

    /// The HTTP client (including its TLS trust context) could not be built.
    #[error("failed to build kube-apiserver client")]
    Client(#[source] kube::Error),

    /// The watch request could not be sent.
    #[error("watch request to kube-apiserver failed")]
    Request(#[source] kube::Error),

    /// The API server answered with something other than `200 OK`.
    #[error("got HTTP {status} status code in response from kube-apiserver")]
    UnexpectedStatus {
        /// The response status.
        status: StatusCode,
    },

    /// Reading the watch stream failed.
    #[error("failed to read watch stream")]
    Stream(#[source] io::Error),

    /// A line of the watch stream is not a valid watch event.
    #[error("failed to decode watch event")]
    Decode(#[source] serde_json::Error),

    /// The resolver's own runtime could not be started.
    #[error("failed to start resolver runtime")]
    Runtime(#[source] io::Error),
}

impl From<&Error> for Status {
    fn from(error: &Error) -> Self {
        let code = match error {
            Error::UnexpectedStatus { status } => match status.as_u16() {
                401 => Code::Unauthenticated,
                403 => Code::PermissionDenied,
                404 => Code::NotFound,
                429 | 502 | 503 | 504 => Code::Unavailable,
                _ => Code::Unknown,
            },
            Error::Request(_) | Error::Stream(_) => Code::Unavailable,
            Error::Decode(_) => Code::Internal,
            _ => Code::Unknown,
        };

        Status::new(code, error.to_string())
    }
}
