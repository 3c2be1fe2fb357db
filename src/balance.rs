//! Feeds resolved endpoints to a Tonic balance channel.
//!
//! This module runs a [`KubernetesResolver`] and turns the address sets it reports into
//! endpoint changes on a user-provided channel. Users are responsible for creating their
//! own Tonic channel and endpoints.
//!
//! # How It Works
//!
//! 1. Starts a resolver watching the service's `EndpointSlice` resources
//! 2. Diffs every reported address set against the previously known one
//! 3. Sends `Change::Insert` or `Change::Remove` events to the provided sender
//! 4. When the resolver reports an error, waits with exponential backoff and refreshes it
//!
//! # Example
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
//! let config = DiscoveryConfig::new("my-grpc-service", 50051);
//! let resolver = discover(config, tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! })?;
//!
//! // Use the channel with your gRPC client while `resolver` is alive
//! let client = MyServiceClient::new(channel);
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender};
use tokio_retry::strategy::ExponentialBackoff;
use tonic::Status;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::error::Result;
use crate::resolver::{Attributes, KubernetesResolver, Listener, ResolvedAddressGroup};
use crate::target::{Port, ResolverTarget};

/// Configuration for Kubernetes endpoint discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// The service to resolve.
    pub target: ResolverTarget,

    /// Delay before the first refresh after an error.
    pub initial_backoff: Duration,

    /// Upper bound for the refresh delay.
    pub max_backoff: Duration,
}

impl DiscoveryConfig {
    /// Creates a new discovery configuration.
    ///
    /// The port can be specified as a number (`50051`) or a name (`"grpc"`).
    /// Uses the pod's own namespace.
    #[must_use]
    pub fn new(service_name: impl Into<String>, port: impl Into<Port>) -> Self {
        Self::with_target(ResolverTarget::new(service_name).port(port))
    }

    /// Creates a configuration from a scheme-stripped target such as
    /// `my-service.my-namespace:grpc`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTarget`] if the target names no service.
    pub fn from_target(target: &str) -> Result<Self> {
        ResolverTarget::parse(target).map(Self::with_target)
    }

    fn with_target(target: ResolverTarget) -> Self {
        Self {
            target,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Sets an explicit namespace for the service.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.target = self.target.namespace(namespace);
        self
    }

    /// Sets the refresh backoff after errors.
    #[must_use]
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }
}

/// Starts resolving endpoints and sends changes to the provided sender.
///
/// This function creates an in-cluster resolver on the current Tokio runtime and spawns
/// a background task that sends `Change` events to the provided sender. Discovery runs
/// for as long as the returned resolver is kept alive and the channel is open.
///
/// # Arguments
///
/// * `config` - Discovery configuration specifying the service to watch
/// * `tx` - Sender for endpoint changes (from `Channel::balance_channel()`)
/// * `build` - Function to build an `Endpoint` from a `SocketAddr`
///
/// # Requirements
///
/// - Must be called from within a Tokio runtime
/// - The application must have RBAC permissions to watch `EndpointSlice` resources
///
/// # Errors
///
/// Returns an error if the in-cluster configuration is missing.
pub fn discover<F>(
    config: DiscoveryConfig,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
) -> Result<Arc<KubernetesResolver>>
where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    let resolver = KubernetesResolver::with_handle(Handle::current(), config.target.clone())?;
    Ok(spawn_discovery(Arc::new(resolver), config, tx, build))
}

fn spawn_discovery<F>(
    resolver: Arc<KubernetesResolver>,
    config: DiscoveryConfig,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
) -> Arc<KubernetesResolver>
where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    let (listener, updates) = BalanceListener::new();
    resolver.start(Arc::new(listener));

    tokio::spawn(discovery_loop(
        Arc::downgrade(&resolver),
        updates,
        tx,
        config,
        build,
    ));

    resolver
}

/// What the resolver reported.
#[derive(Debug)]
enum Update {
    Addresses(HashSet<SocketAddr>),
    Failed(Status),
}

/// Forwards resolver callbacks to the discovery loop.
struct BalanceListener {
    tx: UnboundedSender<Update>,
}

impl BalanceListener {
    fn new() -> (Self, UnboundedReceiver<Update>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Listener for BalanceListener {
    fn on_addresses(&self, groups: Vec<ResolvedAddressGroup>, _attributes: Attributes) {
        let addrs = groups
            .iter()
            .flat_map(|group| group.addrs().iter().copied())
            .collect();

        let _ = self.tx.send(Update::Addresses(addrs));
    }

    fn on_error(&self, status: Status) {
        let _ = self.tx.send(Update::Failed(status));
    }
}

/// Background task that turns resolver updates into endpoint changes.
async fn discovery_loop<F>(
    resolver: Weak<KubernetesResolver>,
    mut updates: UnboundedReceiver<Update>,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    config: DiscoveryConfig,
    build: F,
) where
    F: Fn(SocketAddr) -> Endpoint,
{
    let target = &config.target;
    let mut known: HashSet<SocketAddr> = HashSet::new();
    let mut backoff = fresh_backoff(&config);

    tracing::debug!("Starting Kubernetes endpoint discovery for {target}");

    while let Some(update) = updates.recv().await {
        match update {
            Update::Addresses(current) => {
                backoff = fresh_backoff(&config);

                for action in process_update(&current, &mut known) {
                    let change = match action {
                        EndpointAction::Insert(addr) => Change::Insert(addr, build(addr)),
                        EndpointAction::Remove(addr) => Change::Remove(addr),
                    };

                    if tx.send(change).await.is_err() {
                        tracing::warn!("channel closed, stopping Kubernetes discovery");
                        return;
                    }
                }

                tracing::debug!(
                    "Kubernetes discovery: {} endpoints for {target}",
                    known.len()
                );
            }

            Update::Failed(status) => {
                let delay = backoff.next().unwrap_or(config.max_backoff);
                tracing::debug!(
                    "Kubernetes resolution for {target} failed: {}, refreshing in {delay:?}",
                    status.message()
                );

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = tx.closed() => {
                        tracing::warn!("channel closed, stopping Kubernetes discovery");
                        return;
                    }
                }

                let Some(resolver) = resolver.upgrade() else {
                    break;
                };
                resolver.refresh();
            }
        }
    }

    tracing::debug!("Kubernetes resolver for {target} dropped, stopping discovery");
}

/// Represents an endpoint change action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointAction {
    Insert(SocketAddr),
    Remove(SocketAddr),
}

/// Diffs a reported address set against the known one and returns the endpoint actions.
fn process_update(
    current: &HashSet<SocketAddr>,
    known: &mut HashSet<SocketAddr>,
) -> Vec<EndpointAction> {
    let mut actions = Vec::new();

    known.retain(|addr| {
        let keep = current.contains(addr);
        if !keep {
            tracing::debug!("removing endpoint: {addr}");
            actions.push(EndpointAction::Remove(*addr));
        }
        keep
    });

    for addr in current {
        if known.insert(*addr) {
            tracing::debug!("adding endpoint: {addr}");
            actions.push(EndpointAction::Insert(*addr));
        }
    }

    actions
}

/// Refresh delays after errors: `initial_backoff` doubling up to `max_backoff`.
///
/// The initial delay is rounded down to an even number of milliseconds, with a floor of
/// 2 ms. `max_backoff` caps every delay, the first one included.
fn fresh_backoff(config: &DiscoveryConfig) -> ExponentialBackoff {
    let initial_ms = u64::try_from(config.initial_backoff.as_millis()).unwrap_or(u64::MAX);

    ExponentialBackoff::from_millis(2)
        .factor((initial_ms / 2).max(1))
        .max_delay(config.max_backoff)
}
