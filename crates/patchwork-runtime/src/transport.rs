//! Download primitive.
//!
//! [`Transport`] is the HTTP-capable collaborator: an operation starts a GET
//! with [`Transport::begin`] and then polls it once per tick until it
//! resolves. Polling a resolved request consumes it.
//!
//! Implementations provided here:
//!
//! - [`MemoryTransport`]: serves an in-memory map of URLs, with configurable
//!   latency (in polls) and scripted failures.
//! - [`BlockingTransport`]: adapts any blocking `url -> bytes` function.
//! - [`OfflineTransport`]: fails every request.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::storage::MemoryStorage;

/// Identifies one in-flight request on a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Result of polling a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPoll {
    /// Still in flight; poll again next tick.
    Pending,
    /// The response body.
    Ready(Vec<u8>),
    /// The request failed (network error, non-success status).
    Failed(String),
}

/// Callback-style HTTP GET.
pub trait Transport {
    /// Start fetching `url`.
    fn begin(&mut self, url: &str) -> RequestId;

    /// Check on `request`. Once this returns `Ready` or `Failed` the id is
    /// forgotten; polling it again yields `Failed`.
    fn poll(&mut self, request: RequestId) -> FetchPoll;
}

fn unknown_request(request: RequestId) -> FetchPoll {
    FetchPoll::Failed(format!("unknown request {}", request.0))
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InFlight {
    url: String,
    remaining_polls: u32,
}

#[derive(Debug, Default)]
struct MemoryTransportState {
    files: HashMap<String, Vec<u8>>,
    failures: HashMap<String, u32>,
    in_flight: HashMap<RequestId, InFlight>,
    latency_polls: u32,
    next_id: u64,
    requests: Vec<String>,
}

/// In-memory download server.
///
/// Clones share state, so a test can add files, script failures, and inspect
/// the request log while a [`PatchSystem`](crate::system::PatchSystem) owns
/// another clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryTransportState>>,
}

impl MemoryTransport {
    /// Create a server with no files and zero latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `Pending` polls each request returns before resolving.
    pub fn set_latency(&self, polls: u32) {
        self.state.borrow_mut().latency_polls = polls;
    }

    /// Serve `bytes` at `url`.
    pub fn serve(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.state.borrow_mut().files.insert(url.into(), bytes.into());
    }

    /// Stop serving `url`.
    pub fn withdraw(&self, url: &str) {
        self.state.borrow_mut().files.remove(url);
    }

    /// Serve every file in `storage` under `base_url`.
    pub fn mirror(&self, base_url: &str, storage: &MemoryStorage) {
        let base = base_url.trim_end_matches('/');
        for (path, bytes) in storage.files() {
            self.serve(format!("{base}/{path}"), bytes);
        }
    }

    /// Make the next `times` requests for `url` fail.
    pub fn fail_next(&self, url: impl Into<String>, times: u32) {
        *self.state.borrow_mut().failures.entry(url.into()).or_default() += times;
    }

    /// Every URL requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.state.borrow().requests.clone()
    }
}

impl Transport for MemoryTransport {
    fn begin(&mut self, url: &str) -> RequestId {
        let mut state = self.state.borrow_mut();
        let id = RequestId(state.next_id);
        state.next_id += 1;
        state.requests.push(url.to_owned());
        let remaining_polls = state.latency_polls;
        state.in_flight.insert(
            id,
            InFlight {
                url: url.to_owned(),
                remaining_polls,
            },
        );
        id
    }

    fn poll(&mut self, request: RequestId) -> FetchPoll {
        let mut state = self.state.borrow_mut();
        let Some(flight) = state.in_flight.get_mut(&request) else {
            return unknown_request(request);
        };
        if flight.remaining_polls > 0 {
            flight.remaining_polls -= 1;
            return FetchPoll::Pending;
        }

        let url = flight.url.clone();
        state.in_flight.remove(&request);

        if let Some(remaining) = state.failures.get_mut(&url) {
            if *remaining > 0 {
                *remaining -= 1;
                return FetchPoll::Failed(format!("connection reset while fetching {url}"));
            }
        }
        match state.files.get(&url) {
            Some(bytes) => FetchPoll::Ready(bytes.clone()),
            None => FetchPoll::Failed(format!("404 not found: {url}")),
        }
    }
}

// ---------------------------------------------------------------------------
// BlockingTransport
// ---------------------------------------------------------------------------

/// Adapts a blocking getter: the request runs inside [`Transport::begin`] and
/// the next poll returns its result.
pub struct BlockingTransport<F> {
    fetch: F,
    results: HashMap<RequestId, Result<Vec<u8>, String>>,
    next_id: u64,
}

impl<F> BlockingTransport<F>
where
    F: FnMut(&str) -> Result<Vec<u8>, String>,
{
    /// Wrap `fetch`.
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            results: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<F> Transport for BlockingTransport<F>
where
    F: FnMut(&str) -> Result<Vec<u8>, String>,
{
    fn begin(&mut self, url: &str) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.results.insert(id, (self.fetch)(url));
        id
    }

    fn poll(&mut self, request: RequestId) -> FetchPoll {
        match self.results.remove(&request) {
            Some(Ok(bytes)) => FetchPoll::Ready(bytes),
            Some(Err(message)) => FetchPoll::Failed(message),
            None => unknown_request(request),
        }
    }
}

// ---------------------------------------------------------------------------
// OfflineTransport
// ---------------------------------------------------------------------------

/// Transport used when none is configured: every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineTransport;

impl Transport for OfflineTransport {
    fn begin(&mut self, _url: &str) -> RequestId {
        RequestId(0)
    }

    fn poll(&mut self, _request: RequestId) -> FetchPoll {
        FetchPoll::Failed("no transport configured".to_owned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_transport_serves_after_latency() {
        let mut transport = MemoryTransport::new();
        transport.serve("mem://a", b"bytes".to_vec());
        transport.set_latency(2);

        let id = transport.begin("mem://a");
        assert_eq!(transport.poll(id), FetchPoll::Pending);
        assert_eq!(transport.poll(id), FetchPoll::Pending);
        assert_eq!(transport.poll(id), FetchPoll::Ready(b"bytes".to_vec()));
        assert!(matches!(transport.poll(id), FetchPoll::Failed(_)));
    }

    #[test]
    fn memory_transport_missing_url_fails() {
        let mut transport = MemoryTransport::new();
        let id = transport.begin("mem://missing");
        match transport.poll(id) {
            FetchPoll::Failed(msg) => assert!(msg.contains("404")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn scripted_failures_are_consumed() {
        let mut transport = MemoryTransport::new();
        transport.serve("mem://a", b"x".to_vec());
        transport.fail_next("mem://a", 1);

        let first = transport.begin("mem://a");
        assert!(matches!(transport.poll(first), FetchPoll::Failed(_)));
        let second = transport.begin("mem://a");
        assert_eq!(transport.poll(second), FetchPoll::Ready(b"x".to_vec()));
        assert_eq!(transport.requests(), vec!["mem://a", "mem://a"]);
    }

    #[test]
    fn mirror_serves_storage_under_base_url() {
        let storage = MemoryStorage::new();
        storage.insert("k1", b"one".to_vec());
        let mut transport = MemoryTransport::new();
        transport.mirror("mem://cdn/", &storage);

        let id = transport.begin("mem://cdn/k1");
        assert_eq!(transport.poll(id), FetchPoll::Ready(b"one".to_vec()));
    }

    #[test]
    fn blocking_transport_resolves_on_first_poll() {
        let mut transport = BlockingTransport::new(|url: &str| {
            if url.ends_with("ok") {
                Ok(url.as_bytes().to_vec())
            } else {
                Err("500".to_owned())
            }
        });
        let ok = transport.begin("x/ok");
        let bad = transport.begin("x/bad");
        assert_eq!(transport.poll(ok), FetchPoll::Ready(b"x/ok".to_vec()));
        assert_eq!(transport.poll(bad), FetchPoll::Failed("500".to_owned()));
    }

    #[test]
    fn offline_transport_always_fails() {
        let mut transport = OfflineTransport;
        let id = transport.begin("anything");
        assert!(matches!(transport.poll(id), FetchPoll::Failed(_)));
    }
}
