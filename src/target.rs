//! Resolver target parsing.
//!
//! A target names the service to resolve and, optionally, its namespace and port. The
//! scheme (e.g. `kubernetes:`) is stripped by the caller before parsing, which leaves one
//! of the following shapes:
//!
//! | Target                                   | Namespace   | Service        | Port     |
//! |------------------------------------------|-------------|----------------|----------|
//! | `service-name`                           | -           | `service-name` | -        |
//! | `/service-name:8080`                     | -           | `service-name` | `8080`   |
//! | `/service-name:grpc`                     | -           | `service-name` | `grpc`   |
//! | `/service-name.ns.svc.cluster.local:80`  | `ns`        | `service-name` | `80`     |
//! | `//ns/service-name:8080`                 | `ns`        | `service-name` | `8080`   |
//! | `//service-name.ns:8080/`                | `ns`        | `service-name` | `8080`   |

use std::fmt;

use crate::error::{Error, Result};

/// Port specification for the gRPC service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Port {
    /// A numeric port number.
    Number(u16),
    /// A named port (resolved from `EndpointSlice`).
    Name(String),
}

impl Port {
    /// Interprets a port token from a target: a valid port number, or else a port name.
    #[must_use]
    pub fn parse(token: &str) -> Self {
        token
            .parse::<u16>()
            .map_or_else(|_| Self::Name(token.to_string()), Self::Number)
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// A parsed resolver target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverTarget {
    /// The namespace of the service, if the target names one.
    pub namespace: Option<String>,

    /// The Kubernetes service name. Never empty.
    pub service: String,

    /// The port to connect to, if the target names one.
    pub port: Option<Port>,
}

impl ResolverTarget {
    /// Creates a target for a service in the resolver's default namespace.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            namespace: None,
            service: service.into(),
            port: None,
        }
    }

    /// Sets an explicit namespace for the service.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the port, either a number (`50051`) or a name (`"grpc"`).
    #[must_use]
    pub fn port(mut self, port: impl Into<Port>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Parses a scheme-stripped target.
    ///
    /// Without an authority (`service…` or `/service…`) the path is parsed as
    /// `service[.namespace[.anything]][:port]`. With an authority and an empty path
    /// (`//service.namespace:port/`) the authority is parsed the same way. With both
    /// (`//namespace/service:port`) the authority is the namespace and the path supplies
    /// the service and port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTarget`] when no service name can be extracted.
    pub fn parse(target: &str) -> Result<Self> {
        let (authority, path) = match target.strip_prefix("//") {
            Some(rest) => rest.split_once('/').unwrap_or((rest, "")),
            None => ("", target.strip_prefix('/').unwrap_or(target)),
        };

        let parsed = if authority.is_empty() {
            split_target(path)
        } else if path.is_empty() {
            split_target(authority)
        } else {
            Self {
                namespace: Some(authority.to_string()),
                ..split_target(path)
            }
        };

        if parsed.service.is_empty() {
            return Err(Error::InvalidTarget(target.to_string()));
        }

        Ok(parsed)
    }
}

impl fmt::Display for ResolverTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }

        f.write_str(&self.service)?;

        if let Some(port) = &self.port {
            write!(f, ":{port}")?;
        }

        Ok(())
    }
}

/// Splits `service[.namespace[.anything]][:port]`. The port is everything after the last
/// colon, so a service name can never contain one.
fn split_target(s: &str) -> ResolverTarget {
    let (name, port) = match s.rsplit_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (s, None),
    };

    let mut parts = name.splitn(3, '.');
    let service = parts.next().unwrap_or_default().to_string();
    let namespace = parts.next().filter(|ns| !ns.is_empty()).map(String::from);

    ResolverTarget {
        namespace,
        service,
        port: port.filter(|p| !p.is_empty()).map(Port::parse),
    }
}
