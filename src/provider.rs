//! Explicit resolver provider.
//!
//! A provider matches full target URIs such as `kubernetes:///my-service:grpc` against
//! its scheme and builds a [`KubernetesResolver`] for them. Nothing is registered
//! globally: callers construct a provider and hand it to whatever registry they use.

use tokio::runtime::Handle;

use crate::error::Result;
use crate::resolver::KubernetesResolver;
use crate::target::ResolverTarget;

/// The scheme handled by [`KubernetesResolverProvider::default`].
pub const DEFAULT_SCHEME: &str = "kubernetes";

/// Builds resolvers for target URIs with a given scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubernetesResolverProvider {
    scheme: String,
}

impl Default for KubernetesResolverProvider {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEME)
    }
}

impl KubernetesResolverProvider {
    /// Creates a provider for a custom scheme.
    #[must_use]
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
        }
    }

    /// Returns the scheme this provider handles.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Whether the provider can be used. Always `true`.
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn is_available(&self) -> bool {
        true
    }

    /// Priority among providers for the same scheme.
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn priority(&self) -> u8 {
        5
    }

    /// Parses `uri` if its scheme matches.
    ///
    /// Returns `Ok(None)` for any other scheme.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTarget`] if the scheme matches but no service name
    /// can be extracted.
    pub fn parse_target(&self, uri: &str) -> Result<Option<ResolverTarget>> {
        match uri.split_once(':') {
            Some((scheme, rest)) if scheme == self.scheme => ResolverTarget::parse(rest).map(Some),
            _ => Ok(None),
        }
    }

    /// Builds a resolver for `uri` if its scheme matches.
    ///
    /// Watches run on `handle` when given, otherwise on a runtime owned by the resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the target is invalid or the resolver cannot be created.
    pub fn new_resolver(
        &self,
        uri: &str,
        handle: Option<Handle>,
    ) -> Result<Option<KubernetesResolver>> {
        let Some(target) = self.parse_target(uri)? else {
            return Ok(None);
        };

        tracing::debug!("Creating Kubernetes resolver for {target}");

        let resolver = match handle {
            Some(handle) => KubernetesResolver::with_handle(handle, target)?,
            None => KubernetesResolver::new(target)?,
        };

        Ok(Some(resolver))
    }
}
