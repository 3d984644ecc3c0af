use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::domain::FetchOutcome;
use crate::error::SyncError;
use crate::store;

/// How connectivity failures (DNS resolution, refused connections) are
/// charged against the retry budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectivityRetry {
    /// Connectivity failures consume attempts like any other failure.
    #[default]
    Budgeted,
    /// Keep retrying while the network is unreachable without consuming
    /// attempts.
    UntilOnline,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
    pub connectivity: ConnectivityRetry,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(15),
            connectivity: ConnectivityRetry::Budgeted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connectivity,
    Transient,
}

impl FailureKind {
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_connect() {
            FailureKind::Connectivity
        } else {
            FailureKind::Transient
        }
    }
}

impl RetryPolicy {
    /// Whether a failure of `kind` consumes one of the remaining attempts.
    pub fn charges(&self, kind: FailureKind) -> bool {
        !(kind == FailureKind::Connectivity
            && self.connectivity == ConnectivityRetry::UntilOnline)
    }
}

pub trait Fetcher: Send + Sync {
    /// Page body as text; `NotFound` on HTTP 404.
    fn fetch_page(&self, url: &str) -> Result<FetchOutcome<String>, SyncError>;

    /// Writes the response body to `destination` on HTTP 200 and returns the
    /// byte count; `NotFound` on HTTP 404.
    fn fetch_file(&self, url: &str, destination: &Path) -> Result<FetchOutcome<u64>, SyncError>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    policy: RetryPolicy,
}

enum Attempt {
    Done(Response),
    NotFound,
    Failed(FailureKind, SyncError),
}

impl HttpFetcher {
    pub fn new(policy: RetryPolicy) -> Result<Self, SyncError> {
        Self::build(policy, true)
    }

    /// Same as [`HttpFetcher::new`] but accepts invalid TLS certificates.
    pub fn insecure(policy: RetryPolicy) -> Result<Self, SyncError> {
        Self::build(policy, false)
    }

    fn build(policy: RetryPolicy, verify_tls: bool) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("manifest-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(policy.timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|err| SyncError::Http(err.to_string()))?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn attempt(&self, url: &str) -> Attempt {
        match self.client.get(url).send() {
            Ok(response) => match response.status() {
                StatusCode::OK => Attempt::Done(response),
                StatusCode::NOT_FOUND => Attempt::NotFound,
                status => Attempt::Failed(
                    FailureKind::Transient,
                    SyncError::HttpStatus {
                        url: url.to_string(),
                        status: status.as_u16(),
                    },
                ),
            },
            Err(err) => {
                let kind = FailureKind::classify(&err);
                let error = match kind {
                    FailureKind::Connectivity => SyncError::Connectivity(url.to_string()),
                    FailureKind::Transient => SyncError::Http(err.to_string()),
                };
                Attempt::Failed(kind, error)
            }
        }
    }

    fn send_with_retries(&self, url: &str) -> Result<FetchOutcome<Response>, SyncError> {
        let mut remaining = self.policy.attempts.max(1);
        loop {
            let (kind, error) = match self.attempt(url) {
                Attempt::Done(response) => return Ok(FetchOutcome::Found(response)),
                Attempt::NotFound => return Ok(FetchOutcome::NotFound),
                Attempt::Failed(kind, error) => (kind, error),
            };
            if self.policy.charges(kind) {
                remaining -= 1;
            } else {
                warn!(url, "connection error, retrying");
            }
            if remaining == 0 {
                return Err(error);
            }
            debug!(url, remaining, %error, "retrying request");
            thread::sleep(self.policy.backoff);
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_page(&self, url: &str) -> Result<FetchOutcome<String>, SyncError> {
        let FetchOutcome::Found(response) = self.send_with_retries(url)? else {
            return Ok(FetchOutcome::NotFound);
        };
        let body = response
            .text()
            .map_err(|err| SyncError::Http(err.to_string()))?;
        Ok(FetchOutcome::Found(body))
    }

    fn fetch_file(&self, url: &str, destination: &Path) -> Result<FetchOutcome<u64>, SyncError> {
        let FetchOutcome::Found(response) = self.send_with_retries(url)? else {
            return Ok(FetchOutcome::NotFound);
        };
        let bytes = response
            .bytes()
            .map_err(|err| SyncError::Http(err.to_string()))?;
        store::write_bytes_atomic(destination, &bytes)?;
        Ok(FetchOutcome::Found(bytes.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    /// Answers each request with the next scripted `(status, body)`, repeating
    /// the last one, and counts requests. Every response closes the connection.
    fn serve(listener: TcpListener, script: Vec<(u16, &'static str)>) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else {
                    continue;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = script[index.min(script.len() - 1)];
                let response = format!(
                    "HTTP/1.1 {status} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    reason(status),
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        hits
    }

    fn reason(status: u16) -> &'static str {
        match status {
            200 => "OK",
            404 => "Not Found",
            _ => "Internal Server Error",
        }
    }

    fn start(script: Vec<(u16, &'static str)>) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (addr, serve(listener, script))
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn server_error_uses_whole_budget() {
        let (addr, hits) = start(vec![(500, "down")]);
        let fetcher = HttpFetcher::new(quick_policy()).unwrap();

        let result = fetcher.fetch_page(&format!("http://{addr}/page"));
        assert_matches!(result, Err(SyncError::HttpStatus { status: 500, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn not_found_is_not_retried() {
        let (addr, hits) = start(vec![(404, "")]);
        let fetcher = HttpFetcher::new(quick_policy()).unwrap();

        let outcome = fetcher.fetch_page(&format!("http://{addr}/missing")).unwrap();
        assert_eq!(outcome, FetchOutcome::NotFound);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_error_then_success() {
        let (addr, hits) = start(vec![(503, ""), (200, "<html>ok</html>")]);
        let fetcher = HttpFetcher::new(quick_policy()).unwrap();

        let outcome = fetcher.fetch_page(&format!("http://{addr}/")).unwrap();
        assert_eq!(outcome, FetchOutcome::Found("<html>ok</html>".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn file_written_only_on_success() {
        let temp = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(quick_policy()).unwrap();

        let (addr, _) = start(vec![(200, "jpeg-bytes")]);
        let found = temp.path().join("files").join("1.jpg");
        let outcome = fetcher
            .fetch_file(&format!("http://{addr}/1.jpg"), &found)
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Found(10));
        assert_eq!(std::fs::read(&found).unwrap(), b"jpeg-bytes");

        let (addr, _) = start(vec![(404, "gone")]);
        let missing = temp.path().join("files").join("2.jpg");
        let outcome = fetcher
            .fetch_file(&format!("http://{addr}/2.jpg"), &missing)
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NotFound);
        assert!(!missing.exists());

        let (addr, _) = start(vec![(500, "error page")]);
        let failed = temp.path().join("files").join("3.jpg");
        assert!(fetcher
            .fetch_file(&format!("http://{addr}/3.jpg"), &failed)
            .is_err());
        assert!(!failed.exists());
    }

    #[test]
    fn until_online_outlasts_the_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            let listener = TcpListener::bind(addr).unwrap();
            serve(listener, vec![(200, "back")])
        });

        let fetcher = HttpFetcher::new(RetryPolicy {
            attempts: 1,
            backoff: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
            connectivity: ConnectivityRetry::UntilOnline,
        })
        .unwrap();
        let outcome = fetcher.fetch_page(&format!("http://{addr}/")).unwrap();
        assert_eq!(outcome, FetchOutcome::Found("back".to_string()));
        assert_eq!(server.join().unwrap().load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connectivity_charges_only_when_budgeted() {
        let budgeted = RetryPolicy::default();
        assert!(budgeted.charges(FailureKind::Connectivity));
        assert!(budgeted.charges(FailureKind::Transient));

        let until_online = RetryPolicy {
            connectivity: ConnectivityRetry::UntilOnline,
            ..RetryPolicy::default()
        };
        assert!(!until_online.charges(FailureKind::Connectivity));
        assert!(until_online.charges(FailureKind::Transient));
    }

    #[test]
    fn unreachable_host_fails_after_budget() {
        let fetcher = HttpFetcher::new(RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(2),
            connectivity: ConnectivityRetry::Budgeted,
        })
        .unwrap();
        let result = fetcher.fetch_page("http://127.0.0.1:9/");
        assert!(result.is_err());
    }
}
