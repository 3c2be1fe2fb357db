//! HTTP transports for the `EndpointSlice` watch request.
//!
//! A transport knows how to build the client and the request for one watch. Two variants
//! exist: plain HTTP without authentication, and HTTPS trusting a single CA certificate
//! with a bearer token. Credentials are read from an [`AuthSource`] every time a watch is
//! started, so rotated tokens are picked up on the next refresh.

use std::fmt;
use std::io;
use std::sync::Arc;

use http::header::{ACCEPT, AUTHORIZATION};
use http::{Request, Uri};
use kube::{Client, Config};

use crate::error::{Error, Result};

/// Supplies the credentials for a secure transport.
pub trait AuthSource: Send + Sync {
    /// Returns the PEM-encoded CA certificate of the API server.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate cannot be read.
    fn ca_certificate(&self) -> io::Result<Vec<u8>>;

    /// Returns the bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be read.
    fn token(&self) -> io::Result<Vec<u8>>;
}

/// The closed set of transports a watcher can use.
#[derive(Clone)]
pub(crate) enum Transport {
    Insecure,
    Secure(Arc<dyn AuthSource>),
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insecure => f.write_str("Insecure"),
            Self::Secure(_) => f.write_str("Secure"),
        }
    }
}

impl Transport {
    /// Builds a client talking to `host`.
    ///
    /// The insecure transport trusts no certificate at all, so only `http` hosts work.
    pub(crate) fn build_client(&self, host: &Uri) -> Result<Client> {
        let root_cert = match self {
            Self::Insecure => Vec::new(),
            Self::Secure(auth) => vec![load_ca_certificate(auth.as_ref())?],
        };

        let mut config = Config::new(host.clone());
        config.root_cert = Some(root_cert);
        // Watches stay open until the server ends them.
        config.read_timeout = None;

        Client::try_from(config).map_err(Error::Client)
    }

    /// Builds the GET request for `path_and_query`, relative to the client's host.
    pub(crate) fn build_request(&self, path_and_query: &str) -> Result<Request<Vec<u8>>> {
        let mut builder = Request::get(path_and_query).header(ACCEPT, "application/json");

        if let Self::Secure(auth) = self {
            let token = auth.token().map_err(Error::Token)?;
            let token = String::from_utf8_lossy(&token);
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token.trim()));
        }

        builder.body(Vec::new()).map_err(Error::InvalidRequest)
    }
}

/// Reads the first certificate from the PEM bundle and returns it DER-encoded.
fn load_ca_certificate(auth: &dyn AuthSource) -> Result<Vec<u8>> {
    let pem = auth.ca_certificate().map_err(Error::CaCertificate)?;

    match rustls_pemfile::certs(&mut pem.as_slice()).next() {
        Some(Ok(cert)) => Ok(cert.to_vec()),
        Some(Err(e)) => Err(Error::CaCertificate(e)),
        None => Err(Error::MissingCaCertificate),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const CA_CERT: &[u8] = include_bytes!("../testdata/ca.crt");

    struct StaticAuth {
        ca: Vec<u8>,
        token_reads: AtomicUsize,
    }

    impl StaticAuth {
        fn new(ca: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                ca: ca.to_vec(),
                token_reads: AtomicUsize::new(0),
            })
        }
    }

    impl AuthSource for StaticAuth {
        fn ca_certificate(&self) -> io::Result<Vec<u8>> {
            Ok(self.ca.clone())
        }

        fn token(&self) -> io::Result<Vec<u8>> {
            let n = self.token_reads.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{n}\n").into_bytes())
        }
    }

    struct FailingAuth;

    impl AuthSource for FailingAuth {
        fn ca_certificate(&self) -> io::Result<Vec<u8>> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }

        fn token(&self) -> io::Result<Vec<u8>> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    #[test]
    fn insecure_request_has_accept_header_only() {
        let request = Transport::Insecure.build_request("/apis?x=y").unwrap();

        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri(), "/apis?x=y");
        assert_eq!(request.headers()[ACCEPT], "application/json");
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn secure_request_reads_token_every_time() {
        let auth = StaticAuth::new(CA_CERT);
        let transport = Transport::Secure(auth.clone());

        let first = transport.build_request("/apis").unwrap();
        let second = transport.build_request("/apis").unwrap();

        assert_eq!(first.headers()[AUTHORIZATION], "Bearer token-0");
        assert_eq!(second.headers()[AUTHORIZATION], "Bearer token-1");
        assert_eq!(second.headers()[ACCEPT], "application/json");
        assert_eq!(auth.token_reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn request_with_invalid_uri_fails() {
        let err = Transport::Insecure.build_request("/apis?labelSelector=a b").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn token_read_failure_surfaces() {
        let err = Transport::Secure(Arc::new(FailingAuth))
            .build_request("/apis")
            .unwrap_err();
        assert!(matches!(err, Error::Token(_)));
    }

    #[test]
    fn ca_certificate_is_converted_to_der() {
        let der = load_ca_certificate(StaticAuth::new(CA_CERT).as_ref()).unwrap();
        // DER certificates start with a SEQUENCE tag.
        assert_eq!(der[0], 0x30);
    }

    #[test]
    fn ca_certificate_without_pem_block_fails() {
        let err = load_ca_certificate(StaticAuth::new(b"not a certificate").as_ref()).unwrap_err();
        assert!(matches!(err, Error::MissingCaCertificate));
    }

    #[test]
    fn ca_certificate_read_failure_surfaces() {
        let err = load_ca_certificate(&FailingAuth).unwrap_err();
        assert!(matches!(err, Error::CaCertificate(_)));
    }

    #[tokio::test]
    async fn builds_clients_for_both_variants() {
        let host: Uri = "https://127.0.0.1:6443".parse().unwrap();

        Transport::Insecure.build_client(&host).unwrap();
        Transport::Secure(StaticAuth::new(CA_CERT))
            .build_client(&host)
            .unwrap();
    }

    #[tokio::test]
    async fn client_with_corrupt_ca_fails() {
        let host: Uri = "https://127.0.0.1:6443".parse().unwrap();
        let corrupt = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";

        let transport = Transport::Secure(StaticAuth::new(corrupt));
        let Err(err) = transport.build_client(&host) else {
            panic!("client built with a corrupt CA certificate");
        };
        assert!(matches!(err, Error::Client(_)));
    }
}
