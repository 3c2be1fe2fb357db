//! Name resolution driven by `EndpointSlice` watches.
//!
//! A [`KubernetesResolver`] runs one watch at a time on a background runtime and reports
//! the ready addresses of the service's slices to a [`Listener`]. It never reconnects on
//! its own: when a watch fails or the server closes it, the listener gets an error and a
//! later [`KubernetesResolver::refresh`] starts the next watch.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::error::{Error, Result};
use crate::model::{EndpointSliceSnapshot, EventKind, PortRecord, WatchEvent};
use crate::target::{Port, ResolverTarget};
use crate::watcher::{EndpointSliceWatcher, Subscriber};

/// The addresses of one endpoint, all reachable on the same port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResolvedAddressGroup {
    addrs: Vec<SocketAddr>,
}

impl ResolvedAddressGroup {
    /// Creates a group, dropping duplicate addresses.
    #[must_use]
    pub fn new(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        let mut group = Vec::new();

        for addr in addrs {
            if !group.contains(&addr) {
                group.push(addr);
            }
        }

        Self { addrs: group }
    }

    /// Returns the addresses of the group.
    #[must_use]
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Returns `true` if the group has no addresses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl fmt::Display for ResolvedAddressGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;

        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{addr}")?;
        }

        f.write_str(")")
    }
}

/// Attributes reported alongside resolved addresses.
///
/// This resolver attaches none, so the value is always empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes(HashMap<String, String>);

impl Attributes {
    /// Returns an empty attribute set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns `true` if no attributes are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Receives resolution results.
///
/// Callbacks run on the resolver's runtime and must not block. By the time
/// [`Listener::on_error`] runs the failed watch no longer counts as in flight, so a
/// [`KubernetesResolver::refresh`] issued from it starts a new one.
pub trait Listener: Send + Sync {
    /// Called with the full current address list, replacing any earlier one.
    ///
    /// Endpoints count as ready when their `ready` condition is `true` or unset; an unset
    /// condition means ready in the Kubernetes API.
    fn on_addresses(&self, groups: Vec<ResolvedAddressGroup>, attributes: Attributes);

    /// Called when a watch fails or the server ends it.
    fn on_error(&self, status: Status);
}

/// Where watch cycles run.
enum Executor {
    /// A runtime created and shut down by the resolver.
    Owned {
        handle: Handle,
        runtime: Mutex<Option<Runtime>>,
    },
    /// A runtime owned by the caller.
    Shared(Handle),
}

impl Executor {
    fn owned() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("kubernetes-resolver")
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;

        Ok(Self::Owned {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    fn handle(&self) -> &Handle {
        match self {
            Self::Owned { handle, .. } | Self::Shared(handle) => handle,
        }
    }

    fn shutdown(&self) {
        if let Self::Owned { runtime, .. } = self {
            let runtime = runtime
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            if let Some(runtime) = runtime {
                runtime.shutdown_background();
            }
        }
    }
}

/// Resolves a Kubernetes service to the addresses of its ready endpoints.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tonic_kube_resolver::{KubernetesResolver, ResolverTarget};
///
/// let target = ResolverTarget::parse("my-service.my-namespace:grpc")?;
/// let resolver = KubernetesResolver::new(target)?;
/// resolver.start(Arc::new(my_listener));
///
/// // After the listener has seen an error:
/// resolver.refresh();
/// ```
pub struct KubernetesResolver {
    target: Arc<ResolverTarget>,
    watcher: Arc<EndpointSliceWatcher>,
    executor: Executor,
    gate: Arc<Semaphore>,
    listener: OnceLock<Arc<dyn Listener>>,
    cancel: CancellationToken,
}

impl fmt::Debug for KubernetesResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubernetesResolver")
            .field("target", &self.target)
            .field("watcher", &self.watcher)
            .field("started", &self.listener.get().is_some())
            .finish_non_exhaustive()
    }
}

impl KubernetesResolver {
    /// Creates a resolver for the cluster this process runs in, with its own
    /// single-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-cluster configuration is missing or the runtime cannot
    /// be started.
    pub fn new(target: ResolverTarget) -> Result<Self> {
        let watcher = EndpointSliceWatcher::in_cluster(target.namespace.clone())?;
        Self::with_watcher(target, watcher, None)
    }

    /// Creates a resolver for the cluster this process runs in, running watches on
    /// `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-cluster configuration is missing.
    pub fn with_handle(handle: Handle, target: ResolverTarget) -> Result<Self> {
        let watcher = EndpointSliceWatcher::in_cluster(target.namespace.clone())?;
        Self::with_watcher(target, watcher, Some(handle))
    }

    /// Creates a resolver using `watcher`.
    ///
    /// Watches run on `handle` if given, otherwise on a runtime owned by the resolver
    /// that [`KubernetesResolver::shutdown`] stops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] if an owned runtime cannot be started.
    pub fn with_watcher(
        target: ResolverTarget,
        watcher: EndpointSliceWatcher,
        handle: Option<Handle>,
    ) -> Result<Self> {
        let executor = match handle {
            Some(handle) => Executor::Shared(handle),
            None => Executor::owned()?,
        };

        Ok(Self {
            target: Arc::new(target),
            watcher: Arc::new(watcher),
            executor,
            gate: Arc::new(Semaphore::new(1)),
            listener: OnceLock::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the target being resolved.
    #[must_use]
    pub fn target(&self) -> &ResolverTarget {
        &self.target
    }

    /// Starts resolution, reporting to `listener`.
    ///
    /// The first watch starts unconditionally. A resolver can only be started once.
    pub fn start(&self, listener: Arc<dyn Listener>) {
        if self.listener.set(listener).is_err() {
            tracing::warn!("Kubernetes resolver for {} already started", self.target);
            return;
        }

        let permit = Arc::clone(&self.gate).try_acquire_owned().ok();
        self.spawn_watch(permit);
    }

    /// Starts a new watch unless one is already running.
    pub fn refresh(&self) {
        if let Ok(permit) = Arc::clone(&self.gate).try_acquire_owned() {
            self.spawn_watch(Some(permit));
        } else {
            tracing::trace!(
                "EndpointSlice watch for {} already in flight, ignoring refresh",
                self.target
            );
        }
    }

    /// Stops the resolver.
    ///
    /// The in-flight watch is abandoned and no further listener calls are made. A runtime
    /// owned by the resolver is shut down; a caller's runtime is left running.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.executor.shutdown();
    }

    /// Returns the service authority, which this resolver does not use.
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn service_authority(&self) -> &'static str {
        ""
    }

    fn spawn_watch(&self, permit: Option<OwnedSemaphorePermit>) {
        let Some(listener) = self.listener.get() else {
            tracing::debug!("Kubernetes resolver for {} not started yet", self.target);
            return;
        };

        if self.cancel.is_cancelled() {
            return;
        }

        let subscriber =
            ResolverSubscriber::new(Arc::clone(&self.target), Arc::clone(listener), permit);
        let watcher = Arc::clone(&self.watcher);
        let target = Arc::clone(&self.target);
        let cancel = self.cancel.clone();

        self.executor.handle().spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("EndpointSlice watch for {target} cancelled");
                }
                () = watcher.watch(&target.service, subscriber) => {}
            }
        });
    }
}

impl Drop for KubernetesResolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Turns the events of one watch into listener calls.
///
/// Addresses are tracked per slice so that services split over several `EndpointSlice`
/// objects report the union of all of them.
struct ResolverSubscriber {
    target: Arc<ResolverTarget>,
    listener: Arc<dyn Listener>,
    slices: BTreeMap<String, Vec<ResolvedAddressGroup>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ResolverSubscriber {
    fn new(
        target: Arc<ResolverTarget>,
        listener: Arc<dyn Listener>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            target,
            listener,
            slices: BTreeMap::new(),
            permit,
        }
    }

    fn all_addresses(&self) -> Vec<ResolvedAddressGroup> {
        let mut all: Vec<ResolvedAddressGroup> = Vec::new();

        for group in self.slices.values().flatten() {
            if !all.contains(group) {
                all.push(group.clone());
            }
        }

        all
    }
}

impl Subscriber for ResolverSubscriber {
    fn on_event(&mut self, event: WatchEvent) {
        if !matches!(
            event.kind,
            EventKind::Added | EventKind::Modified | EventKind::Deleted
        ) {
            tracing::trace!("Unsupported Kubernetes event type {:?}", event.kind);
            return;
        }

        let Some(slice) = event.endpoint_slice else {
            tracing::debug!("No EndpointSlice found in watch event");
            return;
        };

        let name = slice.name().unwrap_or_default().to_string();

        if event.kind == EventKind::Deleted {
            tracing::debug!("EndpointSlice {name} was deleted");
            self.slices.remove(&name);
            return;
        }

        let groups = build_addresses(&slice, self.target.port.as_ref());
        if groups.is_empty() {
            tracing::debug!(
                "No usable addresses found for service {} in EndpointSlice {name}",
                self.target.service
            );
            self.slices.remove(&name);
            return;
        }

        self.slices.insert(name, groups);
        let all = self.all_addresses();

        tracing::debug!(
            "Kubernetes resolution: {} endpoints for {}",
            all.len(),
            self.target
        );
        self.listener.on_addresses(all, Attributes::empty());
    }

    fn on_error(self, error: Error) {
        tracing::debug!(
            "Encountered an error when watching EndpointSlice for {}: {error}",
            self.target
        );
        drop(self.permit);
        self.listener.on_error(Status::from(&error));
    }

    fn on_completed(self) {
        drop(self.permit);
        self.listener
            .on_error(Status::unavailable("EndpointSlice watch finished by server"));
    }
}

/// Finds the port to connect to.
///
/// Without a target port the first port of the slice is used. A numeric target port is
/// used as is; a named one is looked up among the slice's ports.
fn find_port(port: Option<&Port>, ports: &[PortRecord]) -> Option<u16> {
    let number = match port {
        None => ports.first().and_then(|p| p.port),
        Some(Port::Number(n)) => return Some(*n),
        Some(Port::Name(name)) => ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .and_then(|p| p.port),
    };

    number.and_then(|p| u16::try_from(p).ok())
}

/// Builds one address group per ready endpoint of the slice.
///
/// Returns nothing if no port can be resolved.
fn build_addresses(
    slice: &EndpointSliceSnapshot,
    port: Option<&Port>,
) -> Vec<ResolvedAddressGroup> {
    let Some(port_number) = find_port(port, &slice.ports) else {
        tracing::debug!("No matching port found in EndpointSlice {:?}", slice.name());
        return Vec::new();
    };

    slice
        .endpoints
        .iter()
        .filter(|ep| ep.is_ready())
        .map(|ep| {
            ResolvedAddressGroup::new(
                ep.addresses
                    .iter()
                    .filter_map(|addr| addr.parse::<IpAddr>().ok())
                    .map(|ip| SocketAddr::new(ip, port_number)),
            )
        })
        .filter(|group| !group.is_empty())
        .collect()
}
