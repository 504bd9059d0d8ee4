//! Mock HTTP destination for testing delivery scenarios
//!
//! This module provides a configurable mock destination that can:
#![allow(dead_code)] // Test utility module - not all methods used in every test
//! - Answer with scripted status codes, one per request, then a default
//! - Emit redirects with a `Location` header
//! - Delay responses to test timeout handling
//! - Refuse a request on its headers alone, before any body is read
//! - Track received requests for verification
//!
//! Requests carrying `Expect: 100-continue` get an interim `100 Continue`
//! before their body is read, unless the scripted response refuses them.
//!
//! Every response closes the connection, so each request arrives on a fresh
//! connection and is read in full before it is answered.
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_server::MockDestination;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MockDestination::builder()
//!     .respond(503)              // first request fails
//!     .redirect(301, "/moved/")  // second is redirected
//!     .default_status(204)       // everything after that succeeds
//!     .build()
//!     .await?;
//!
//! let base = server.url("/in");
//! # Ok(())
//! # }
//! ```

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinHandle,
    time::timeout,
};

/// Request received by the mock destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Scripted response
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub location: Option<String>,
    pub delay: Option<Duration>,
    /// Answer as soon as the headers are in, without reading the body
    pub before_body: bool,
}

impl MockResponse {
    const fn status(status: u16) -> Self {
        Self {
            status,
            location: None,
            delay: None,
            before_body: false,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut response = format!("HTTP/1.1 {} Mock\r\n", self.status);
        if let Some(location) = &self.location {
            response.push_str(&format!("Location: {location}\r\n"));
        }
        response.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");
        response.into_bytes()
    }
}

struct MockState {
    script: VecDeque<MockResponse>,
    default: MockResponse,
    received: Vec<ReceivedRequest>,
}

/// Mock HTTP destination for testing
pub struct MockDestination {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    request_count: Arc<AtomicUsize>,
    accept_loop: JoinHandle<()>,
}

impl MockDestination {
    /// Create a new builder for configuring the mock destination
    #[must_use]
    pub fn builder() -> MockDestinationBuilder {
        MockDestinationBuilder::new()
    }

    /// Get the address the server is listening on
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL for `path` on this server
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Get all requests received by the server
    pub async fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.lock().await.received.clone()
    }

    /// Get the number of requests answered
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Queue more scripted responses
    pub async fn push_response(&self, response: MockResponse) {
        self.state.lock().await.script.push_back(response);
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        self.accept_loop.abort();
    }

    async fn handle_client(
        stream: TcpStream,
        state: Arc<Mutex<MockState>>,
        request_count: Arc<AtomicUsize>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        // Request line
        if timeout(Duration::from_secs(10), reader.read_line(&mut line)).await?? == 0 {
            return Ok(());
        }
        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        // Headers
        let mut headers = Vec::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);
        let expects_continue = headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("expect") && value.eq_ignore_ascii_case("100-continue")
        });

        let response = {
            let mut state = state.lock().await;
            state
                .script
                .pop_front()
                .unwrap_or_else(|| state.default.clone())
        };

        let mut body = Vec::new();
        if !response.before_body {
            if expects_continue {
                reader
                    .get_mut()
                    .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                    .await?;
            }
            body.resize(content_length, 0);
            reader.read_exact(&mut body).await?;
        }

        state.lock().await.received.push(ReceivedRequest {
            method,
            path,
            headers,
            body,
        });

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }

        let mut stream = reader.into_inner();
        stream.write_all(&response.to_bytes()).await?;
        stream.flush().await?;
        request_count.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }
}

impl Drop for MockDestination {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

/// Builder for configuring a `MockDestination`
pub struct MockDestinationBuilder {
    script: VecDeque<MockResponse>,
    default: MockResponse,
}

impl MockDestinationBuilder {
    fn new() -> Self {
        Self {
            script: VecDeque::new(),
            default: MockResponse::status(204),
        }
    }

    /// Answer the next request with `status`
    #[must_use]
    pub fn respond(mut self, status: u16) -> Self {
        self.script.push_back(MockResponse::status(status));
        self
    }

    /// Answer the next request with a redirect to `location`
    #[must_use]
    pub fn redirect(mut self, status: u16, location: impl Into<String>) -> Self {
        self.script.push_back(MockResponse {
            location: Some(location.into()),
            ..MockResponse::status(status)
        });
        self
    }

    /// Answer the next request with `status` after `delay`
    #[must_use]
    pub fn respond_after(mut self, status: u16, delay: Duration) -> Self {
        self.script.push_back(MockResponse {
            delay: Some(delay),
            ..MockResponse::status(status)
        });
        self
    }

    /// Answer the next request with `status` before reading its body
    #[must_use]
    pub fn refuse_before_body(mut self, status: u16) -> Self {
        self.script.push_back(MockResponse {
            before_body: true,
            ..MockResponse::status(status)
        });
        self
    }

    /// Status used once the script runs out
    #[must_use]
    pub fn default_status(mut self, status: u16) -> Self {
        self.default = MockResponse::status(status);
        self
    }

    /// Bind to an ephemeral port and start serving
    ///
    /// # Errors
    ///
    /// If the listener cannot be bound
    pub async fn build(self) -> std::io::Result<MockDestination> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(Mutex::new(MockState {
            script: self.script,
            default: self.default,
            received: Vec::new(),
        }));
        let request_count = Arc::new(AtomicUsize::new(0));

        let accept_state = Arc::clone(&state);
        let accept_count = Arc::clone(&request_count);
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                let count = Arc::clone(&accept_count);
                tokio::spawn(async move {
                    if let Err(e) = MockDestination::handle_client(stream, state, count).await {
                        tracing::debug!("Mock destination connection error: {e}");
                    }
                });
            }
        });

        Ok(MockDestination {
            addr,
            state,
            request_count,
            accept_loop,
        })
    }
}
