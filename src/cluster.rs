//! In-cluster watcher configuration.
//!
//! Inside a pod the API server address comes from the `KUBERNETES_SERVICE_HOST` and
//! `KUBERNETES_SERVICE_PORT` environment variables, and the namespace, CA certificate and
//! bearer token from the mounted service account.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::transport::AuthSource;
use crate::watcher::EndpointSliceWatcher;

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";

/// Directory where Kubernetes mounts the pod's service account.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Namespace used when neither the target nor the service account names one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A mounted service account directory.
///
/// Files are read on every access, so a rotated token is used by the next watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAccount {
    dir: PathBuf,
}

impl Default for ServiceAccount {
    fn default() -> Self {
        Self::new(SERVICE_ACCOUNT_DIR)
    }
}

impl ServiceAccount {
    /// Uses the service account mounted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the service account directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads the pod's namespace, falling back to [`DEFAULT_NAMESPACE`] if the namespace
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Namespace`] if the file exists but cannot be read.
    pub fn namespace(&self) -> Result<String> {
        let path = self.dir.join("namespace");

        match fs::read_to_string(&path) {
            Ok(namespace) => Ok(namespace.trim().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    "No namespace file at {}, using {DEFAULT_NAMESPACE}",
                    path.display()
                );
                Ok(DEFAULT_NAMESPACE.to_string())
            }
            Err(source) => Err(Error::Namespace { path, source }),
        }
    }
}

impl AuthSource for ServiceAccount {
    fn ca_certificate(&self) -> io::Result<Vec<u8>> {
        fs::read(self.dir.join("ca.crt"))
    }

    fn token(&self) -> io::Result<Vec<u8>> {
        fs::read(self.dir.join("token"))
    }
}

impl EndpointSliceWatcher {
    /// Creates a watcher for the API server of the cluster this process runs in.
    ///
    /// If `namespace` is `None`, the pod's own namespace is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingEnvironment`] outside a cluster, or [`Error::Namespace`] if
    /// the namespace file cannot be read.
    pub fn in_cluster(namespace: Option<String>) -> Result<Self> {
        Self::from_environment(
            |name| env::var(name).ok(),
            ServiceAccount::default(),
            namespace,
        )
    }

    pub(crate) fn from_environment<F>(
        var: F,
        account: ServiceAccount,
        namespace: Option<String>,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = var(SERVICE_HOST_ENV).ok_or(Error::MissingEnvironment {
            name: SERVICE_HOST_ENV,
        })?;
        let port = var(SERVICE_PORT_ENV).ok_or(Error::MissingEnvironment {
            name: SERVICE_PORT_ENV,
        })?;

        let namespace = match namespace {
            Some(namespace) => namespace,
            None => account.namespace()?,
        };

        let host = format!("https://{}", join_host_port(&host, &port));
        Ok(Self::secure(host, namespace, account))
    }
}

/// Joins host and port the way Go's `net.JoinHostPort` does, bracketing IPv6 literals.
fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        return format!("[{host}]:{port}");
    }

    format!("{host}:{port}")
}
