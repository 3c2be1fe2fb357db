#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes `EndpointSlice` name resolution for [Tonic](https://docs.rs/tonic) gRPC load
//! balancing.
//!
//! When using gRPC (HTTP/2) with Kubernetes, standard `ClusterIP` services don't load balance
//! effectively because HTTP/2 multiplexes all requests over a single long-lived TCP connection.
//! This crate resolves a service name to the addresses of its ready pods by watching the
//! service's `EndpointSlice` resources, and reports every change to a listener.
//!
//! # Features
//!
//! - **Target parsing**: `service`, `service.namespace:port` and `//namespace/service:port`
//!   style targets, with numeric or named ports
//! - **Streaming watch**: one long-lived request to the Kubernetes watch API per resolution
//!   cycle, authenticated with the pod's service account
//! - **Ready endpoints only**: endpoints whose `ready` condition is `false` are skipped; an
//!   unset condition counts as ready, as the Kubernetes API specifies
//! - **Refresh-driven resolver**: at most one watch in flight; errors are reported to the
//!   listener and a refresh starts the next watch
//! - **Balance channel bridge**: feeds endpoint changes to a user-provided Tonic balance
//!   channel, refreshing with backoff after errors
//!
//! # Usage
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::time::Duration;
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_kube_resolver::{discover, DiscoveryConfig};
//!
//! // Create your own balance channel
//! let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
//!
//! // Start discovery - build function returns Endpoint for each address
//! let config = DiscoveryConfig::from_target("my-grpc-service.my-namespace:grpc")?;
//! let _resolver = discover(config, tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! })?;
//!
//! // Use with your generated gRPC client
//! // let client = MyServiceClient::new(channel);
//! ```
//!
//! To drive resolution yourself, implement [`Listener`] and use a [`KubernetesResolver`]
//! directly, or create one from a full target URI with [`KubernetesResolverProvider`].

mod balance;
mod cluster;
mod error;
mod model;
mod provider;
mod resolver;
mod target;
mod transport;
mod watcher;

#[cfg(test)]
mod test_util;

pub use balance::{DiscoveryConfig, discover};
pub use cluster::{DEFAULT_NAMESPACE, SERVICE_ACCOUNT_DIR, ServiceAccount};
pub use error::{Error, Result};
pub use model::{EndpointRecord, EndpointSliceSnapshot, EventKind, PortRecord, WatchEvent};
pub use provider::{DEFAULT_SCHEME, KubernetesResolverProvider};
pub use resolver::{Attributes, KubernetesResolver, Listener, ResolvedAddressGroup};
pub use target::{Port, ResolverTarget};
pub use transport::AuthSource;
pub use watcher::{EndpointSliceWatcher, Subscriber};
