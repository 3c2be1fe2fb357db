//! Streaming watch of `EndpointSlice` resources.
//!
//! [`EndpointSliceWatcher::watch`] issues one long-lived GET against the Kubernetes watch
//! API, decodes the newline-delimited JSON body event by event, and reports to a
//! [`Subscriber`]. The call only returns once the stream has ended or failed.
//!
//! # Example
//!
//! ```ignore
//! use tonic_kube_resolver::{EndpointSliceWatcher, Error, Subscriber, WatchEvent};
//!
//! struct Print;
//!
//! impl Subscriber for Print {
//!     fn on_event(&mut self, event: WatchEvent) {
//!         println!("{:?}", event.kind);
//!     }
//!
//!     fn on_error(self, error: Error) {
//!         eprintln!("watch failed: {error}");
//!     }
//!
//!     fn on_completed(self) {}
//! }
//!
//! let watcher = EndpointSliceWatcher::insecure("http://127.0.0.1:8001", "default");
//! watcher.watch("my-service", Print).await;
//! ```

use std::io;
use std::sync::Arc;

use futures::io::AsyncBufReadExt;
use futures::{Stream, TryStreamExt};
use http::{StatusCode, Uri};
use http_body_util::BodyExt;
use kube::client::Body;

use crate::error::{Error, Result};
use crate::model::WatchEvent;
use crate::transport::{AuthSource, Transport};

/// Receives the outcome of one [`EndpointSliceWatcher::watch`] call.
///
/// Events arrive one at a time in stream order. Exactly one of [`Subscriber::on_error`]
/// or [`Subscriber::on_completed`] follows the last event; both consume the subscriber.
pub trait Subscriber {
    /// Called for every decoded watch event.
    fn on_event(&mut self, event: WatchEvent);

    /// Called once when the watch fails; no further events follow.
    fn on_error(self, error: Error);

    /// Called once when the server ends the stream.
    fn on_completed(self);
}

/// Watches the `EndpointSlice` objects backing a service.
#[derive(Clone, Debug)]
pub struct EndpointSliceWatcher {
    host: String,
    namespace: String,
    transport: Transport,
}

impl EndpointSliceWatcher {
    /// Creates a watcher using plain HTTP without authentication.
    ///
    /// `host` is the base URL of the API server, e.g. `http://127.0.0.1:8001` for
    /// `kubectl proxy`.
    #[must_use]
    pub fn insecure(host: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            transport: Transport::Insecure,
        }
    }

    /// Creates a watcher using HTTPS, trusting the CA certificate and sending the bearer
    /// token supplied by `auth`.
    #[must_use]
    pub fn secure(
        host: impl Into<String>,
        namespace: impl Into<String>,
        auth: impl AuthSource + 'static,
    ) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            transport: Transport::Secure(Arc::new(auth)),
        }
    }

    /// Returns the base URL of the API server.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the namespace being watched.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Watches the slices of `service_name` until the stream ends or fails.
    ///
    /// Every decoded event is passed to [`Subscriber::on_event`]. A failure to connect, a
    /// non-`200` response, a read error or an undecodable line ends the watch with
    /// [`Subscriber::on_error`]; a clean end of stream with [`Subscriber::on_completed`].
    pub async fn watch<S>(&self, service_name: &str, mut subscriber: S)
    where
        S: Subscriber,
    {
        let mut lines = match self.open(service_name).await {
            Ok(lines) => lines,
            Err(e) => return subscriber.on_error(e),
        };

        loop {
            let line = match lines.try_next().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return subscriber.on_error(Error::Stream(e)),
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<WatchEvent>(&line) {
                Ok(event) => subscriber.on_event(event),
                Err(e) => return subscriber.on_error(Error::Decode(e)),
            }
        }

        tracing::debug!(
            "EndpointSlice watch stream for {}/{service_name} finished by server",
            self.namespace
        );
        subscriber.on_completed();
    }

    /// Sends the watch request and returns the response body as a stream of lines.
    async fn open(
        &self,
        service_name: &str,
    ) -> Result<impl Stream<Item = io::Result<String>> + Unpin> {
        let host = self.base_uri()?;
        let request = self.transport.build_request(&self.watch_path(service_name))?;
        let client = self.transport.build_client(&host)?;

        tracing::debug!(
            "Starting EndpointSlice watch for {}/{service_name} at {host}",
            self.namespace
        );

        let response = client
            .send(request.map(Body::from))
            .await
            .map_err(Error::Request)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::UnexpectedStatus { status });
        }

        let body = BodyExt::into_data_stream(response.into_body()).map_err(io::Error::other);
        Ok(body.into_async_read().lines())
    }

    fn base_uri(&self) -> Result<Uri> {
        let uri: Uri = self
            .host
            .parse()
            .map_err(|_| Error::InvalidHost(self.host.clone()))?;

        match (uri.scheme_str(), uri.authority()) {
            (Some("http" | "https"), Some(_)) => Ok(uri),
            _ => Err(Error::InvalidHost(self.host.clone())),
        }
    }

    fn watch_path(&self, service_name: &str) -> String {
        format!(
            "/apis/discovery.k8s.io/v1/watch/namespaces/{}/endpointslices?labelSelector=kubernetes.io/service-name={service_name}",
            self.namespace
        )
    }
}
