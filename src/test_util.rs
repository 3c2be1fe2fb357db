//! Helpers shared by the unit tests: slice builders, a mock API server and a listener
//! that records what a resolver reports.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};
use k8s_openapi::api::discovery::v1::EndpointConditions;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing_subscriber::EnvFilter;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::model::{EndpointRecord, EndpointSliceSnapshot, PortRecord, WatchEvent};
use crate::resolver::{Attributes, Listener, ResolvedAddressGroup};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Sends test logs to the captured test output. Filter with `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn endpoint(addresses: &[&str], ready: Option<bool>) -> EndpointRecord {
    EndpointRecord {
        addresses: addresses.iter().map(|a| (*a).to_string()).collect(),
        conditions: Some(EndpointConditions {
            ready,
            ..Default::default()
        }),
    }
}

pub(crate) fn port(name: Option<&str>, number: i32) -> PortRecord {
    PortRecord {
        name: name.map(String::from),
        port: Some(number),
    }
}

pub(crate) fn slice(name: &str) -> EndpointSliceSnapshot {
    EndpointSliceSnapshot {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Returns a local address nothing listens on.
pub(crate) async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// What the mock API server answers to every request.
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    /// `200 OK` with one line per entry, then the end of the stream.
    Lines(Vec<String>),
    /// Like `Lines`, but the stream only ends after [`MockApiServer::release`].
    Held(Vec<String>),
    /// The given status code and an empty body.
    Status(u16),
}

impl Reply {
    pub(crate) fn events(events: &[WatchEvent]) -> Self {
        Self::Lines(encode(events))
    }

    pub(crate) fn held_events(events: &[WatchEvent]) -> Self {
        Self::Held(encode(events))
    }
}

fn encode(events: &[WatchEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| serde_json::to_string(e).unwrap())
        .collect()
}

/// A request as seen by the [`MockApiServer`].
#[derive(Clone, Debug)]
pub(crate) struct RecordedRequest {
    pub(crate) method: http::Method,
    pub(crate) path_and_query: String,
    pub(crate) headers: HeaderMap,
}

impl From<&wiremock::Request> for RecordedRequest {
    fn from(request: &wiremock::Request) -> Self {
        let path_and_query = match request.url.query() {
            Some(query) => format!("{}?{query}", request.url.path()),
            None => request.url.path().to_string(),
        };

        Self {
            method: request.method.clone(),
            path_and_query,
            headers: request.headers.clone(),
        }
    }
}

/// Stands in for kube-apiserver.
///
/// Complete replies are served by [`wiremock`]. Held streams need a response body that
/// stays open until the test releases it, so they get a small chunked HTTP/1.1 server.
pub(crate) struct MockApiServer {
    backend: Backend,
    release: CancellationToken,
}

enum Backend {
    Mock(MockServer),
    Held {
        addr: SocketAddr,
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
        task: JoinHandle<()>,
    },
}

impl MockApiServer {
    pub(crate) async fn start(reply: Reply) -> Self {
        init_tracing();

        let release = CancellationToken::new();
        let backend = match reply {
            Reply::Lines(lines) => {
                let body: String = lines.iter().map(|line| format!("{line}\n")).collect();
                let response = ResponseTemplate::new(200).set_body_raw(body, "application/json");
                mock_backend(response).await
            }
            Reply::Status(code) => mock_backend(ResponseTemplate::new(code)).await,
            Reply::Held(lines) => held_backend(lines, release.clone()).await,
        };

        Self { backend, release }
    }

    pub(crate) fn url(&self) -> String {
        match &self.backend {
            Backend::Mock(server) => server.uri(),
            Backend::Held { addr, .. } => format!("http://{addr}"),
        }
    }

    /// Requests received so far, in arrival order.
    pub(crate) async fn requests(&self) -> Vec<RecordedRequest> {
        match &self.backend {
            Backend::Mock(server) => server
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .map(RecordedRequest::from)
                .collect(),
            Backend::Held { requests, .. } => requests.lock().unwrap().clone(),
        }
    }

    /// Ends all held streams, current and future.
    pub(crate) fn release(&self) {
        self.release.cancel();
    }

    pub(crate) async fn wait_for_requests(&self, n: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while self.requests().await.len() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {n} requests"));
    }
}

impl Drop for MockApiServer {
    fn drop(&mut self) {
        if let Backend::Held { task, .. } = &self.backend {
            task.abort();
        }
    }
}

async fn mock_backend(response: ResponseTemplate) -> Backend {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(response)
        .mount(&server)
        .await;
    Backend::Mock(server)
}

async fn held_backend(lines: Vec<String>, release: CancellationToken) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let task = tokio::spawn({
        let requests = Arc::clone(&requests);
        async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_held(
                    stream,
                    lines.clone(),
                    Arc::clone(&requests),
                    release.clone(),
                ));
            }
        }
    });

    Backend::Held {
        addr,
        requests,
        task,
    }
}

async fn serve_held(
    mut stream: TcpStream,
    lines: Vec<String>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    release: CancellationToken,
) {
    let mut head = Vec::new();
    let mut buf = [0_u8; 1024];

    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }

    requests.lock().unwrap().push(parse_head(&head));

    let _ = stream_lines(&mut stream, lines, release).await;
    let _ = stream.shutdown().await;
}

fn parse_head(head: &[u8]) -> RecordedRequest {
    let head = String::from_utf8_lossy(head);
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split(' ');

    let method = request_line.next().unwrap_or_default().parse().unwrap();
    let path_and_query = request_line.next().unwrap_or_default().to_string();

    let mut headers = HeaderMap::new();
    for (name, value) in lines.filter_map(|line| line.split_once(':')) {
        headers.append(
            HeaderName::from_bytes(name.trim().as_bytes()).unwrap(),
            HeaderValue::from_str(value.trim()).unwrap(),
        );
    }

    RecordedRequest {
        method,
        path_and_query,
        headers,
    }
}

async fn stream_lines(
    stream: &mut TcpStream,
    lines: Vec<String>,
    release: CancellationToken,
) -> std::io::Result<()> {
    stream
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n")
        .await?;
    stream
        .write_all(b"transfer-encoding: chunked\r\nconnection: close\r\n\r\n")
        .await?;

    for line in lines {
        let data = format!("{line}\n");
        let chunk = format!("{:x}\r\n{data}\r\n", data.len());
        stream.write_all(chunk.as_bytes()).await?;
    }
    stream.flush().await?;

    release.cancelled().await;

    stream.write_all(b"0\r\n\r\n").await?;
    stream.flush().await
}

/// What a [`RecordingListener`] saw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Notification {
    Addresses(Vec<ResolvedAddressGroup>),
    Error(Code),
}

pub(crate) struct RecordingListener {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Listener for RecordingListener {
    fn on_addresses(&self, groups: Vec<ResolvedAddressGroup>, attributes: Attributes) {
        assert!(attributes.is_empty());
        let _ = self.tx.send(Notification::Addresses(groups));
    }

    fn on_error(&self, status: Status) {
        let _ = self.tx.send(Notification::Error(status.code()));
    }
}

pub(crate) fn recording_listener() -> (
    Arc<dyn Listener>,
    mpsc::UnboundedReceiver<Notification>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingListener { tx }), rx)
}

/// Waits for the next notification.
pub(crate) async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("listener dropped")
}
