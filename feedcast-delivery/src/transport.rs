//! Outbound transfer seam
//!
//! The scheduler hands a [`DeliveryRequest`] to a [`Transport`] and gets back
//! an [`AttemptOutcome`]. Failures are values here; nothing a destination does
//! can make `deliver` return early with an error.
//!
//! Spooled payloads are streamed from disk rather than loaded. A request that
//! carries `Expect: 100-continue` holds its body back for up to the continue
//! timeout; a destination that answers with a final status inside that window
//! never receives the body.

use std::{io::Read, path::PathBuf, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use feedcast_common::outgoing;
use flate2::read::GzDecoder;
use futures_util::{Stream, stream};
use reqwest::{
    Body, Method,
    header::{CONTENT_LENGTH, LOCATION},
    redirect::Policy,
};
use serde::Serialize;
use tokio::io::AsyncReadExt;

use crate::{
    destination::{Credentials, DeliveryMethod},
    error::{DeliveryError, SystemError},
    task::DeliveryTask,
};

pub const PUBLISH_ID_HEADER: &str = "X-Feedcast-Publish-Id";
pub const ON_BEHALF_OF_HEADER: &str = "X-Feedcast-On-Behalf-Of";
pub const META_HEADER: &str = "X-Feedcast-Meta";

/// Publisher headers that are never forwarded as-is.
const SKIPPED_HEADERS: &[&str] = &["content-type", "content-length", "host", "transfer-encoding"];

/// Read size when streaming a payload from disk.
const CHUNK_SIZE: usize = 64 * 1024;

const DEFAULT_CONTINUE_TIMEOUT: Duration = Duration::from_secs(1);

/// JSON carried in [`META_HEADER`].
#[derive(Serialize)]
struct MetaHeader<'a> {
    publish_id: &'a str,
    feed_id: Option<&'a str>,
    file_id: &'a str,
    content_type: &'a str,
    headers: &'a [(String, String)],
}

/// What goes after the request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    Bytes(Vec<u8>),
    /// A spooled payload, read from disk while the request is sent
    File { path: PathBuf, len: u64 },
}

impl RequestBody {
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The body, if it is held in memory.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Empty => Some(&[][..]),
            Self::Bytes(bytes) => Some(bytes.as_slice()),
            Self::File { .. } => None,
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// A fully assembled outbound request.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub method: DeliveryMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub credentials: Option<Credentials>,
}

impl DeliveryRequest {
    /// Assemble the request for `task` with the spooled `payload`.
    ///
    /// A payload that has to be inflated must be passed in memory.
    ///
    /// # Errors
    /// If the payload has to be inflated and is not valid gzip, or the
    /// metadata header cannot be encoded.
    pub fn for_task(task: &DeliveryTask, payload: RequestBody) -> Result<Self, DeliveryError> {
        let destination = task.destination();
        let metadata = task.metadata();
        let flags = destination.flags;
        let inflate = task.inflates();

        let meta = serde_json::to_string(&MetaHeader {
            publish_id: &metadata.publish_id,
            feed_id: metadata.feed_id.as_deref(),
            file_id: &metadata.file_id,
            content_type: &metadata.content_type,
            headers: &metadata.headers,
        })
        .map_err(SystemError::from)?;

        let mut headers = vec![
            ("Content-Type".to_string(), metadata.content_type.clone()),
            (PUBLISH_ID_HEADER.to_string(), metadata.publish_id.clone()),
            (META_HEADER.to_string(), meta),
        ];

        if let Some(user) = &metadata.on_behalf_of {
            headers.push((ON_BEHALF_OF_HEADER.to_string(), user.clone()));
        }

        if flags.use_100_continue {
            headers.push(("Expect".to_string(), "100-continue".to_string()));
        }

        headers.extend(
            metadata
                .headers
                .iter()
                .filter(|(name, _)| {
                    !SKIPPED_HEADERS
                        .iter()
                        .any(|skipped| name.eq_ignore_ascii_case(skipped))
                })
                .filter(|(name, _)| !(inflate && name.eq_ignore_ascii_case("content-encoding")))
                .cloned(),
        );

        let body = if flags.metadata_only {
            RequestBody::Empty
        } else if inflate {
            match payload {
                RequestBody::Bytes(bytes) => RequestBody::Bytes(gunzip(&bytes)?),
                RequestBody::Empty => RequestBody::Empty,
                RequestBody::File { path, .. } => {
                    return Err(SystemError::Decompress(format!(
                        "{} has to be read before it can be inflated",
                        path.display()
                    ))
                    .into());
                }
            }
        } else {
            payload
        };

        Ok(Self {
            method: destination.method,
            url: task.target_url(),
            headers,
            body,
            credentials: destination.credentials.clone(),
        })
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the body waits for the destination's go-ahead.
    #[must_use]
    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"))
    }
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, DeliveryError> {
    let mut inflated = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut inflated)
        .map_err(|e| SystemError::Decompress(e.to_string()))?;
    Ok(inflated)
}

/// What a destination did with one request.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// 2xx.
    Delivered { status: u16 },
    /// 3xx with a `Location`.
    Redirected { status: u16, location: String },
    Failed(DeliveryError),
}

impl AttemptOutcome {
    /// Classify a response status. A 3xx without a location is a failure.
    #[must_use]
    pub fn from_status(status: u16, location: Option<String>) -> Self {
        match (status, location) {
            (200..=299, _) => Self::Delivered { status },
            (300..=399, Some(location)) => Self::Redirected { status, location },
            _ => Self::Failed(DeliveryError::from_status(status)),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn deliver(&self, request: DeliveryRequest) -> AttemptOutcome;
}

/// HTTP(S) transport. Redirects are never followed here; they are reported
/// back so the queue can learn them.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    continue_timeout: Duration,
}

impl HttpTransport {
    /// # Errors
    /// If the TLS backend cannot be initialised.
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .redirect(Policy::none())
            .user_agent(concat!("feedcast/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            continue_timeout: DEFAULT_CONTINUE_TIMEOUT,
        })
    }

    /// How long a body is held back for requests that expect `100-continue`.
    #[must_use]
    pub const fn with_continue_timeout(mut self, timeout: Duration) -> Self {
        self.continue_timeout = timeout;
        self
    }

    /// The body to send, held back by `hold` before the first byte.
    async fn body(payload: RequestBody, hold: Option<Duration>) -> std::io::Result<Option<Body>> {
        match (payload, hold) {
            (RequestBody::Empty, _) => Ok(None),
            (RequestBody::Bytes(bytes), None) => Ok(Some(Body::from(bytes))),
            (RequestBody::Bytes(bytes), Some(wait)) => {
                Ok(Some(Body::wrap_stream(stream::once(async move {
                    tokio::time::sleep(wait).await;
                    Ok::<_, std::io::Error>(Bytes::from(bytes))
                }))))
            }
            (RequestBody::File { path, .. }, hold) => {
                let file = tokio::fs::File::open(&path).await?;
                Ok(Some(Body::wrap_stream(file_chunks(file, hold))))
            }
        }
    }
}

fn file_chunks(
    file: tokio::fs::File,
    hold: Option<Duration>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    stream::try_unfold((file, hold), |(mut file, hold)| async move {
        if let Some(wait) = hold {
            tokio::time::sleep(wait).await;
        }

        let mut chunk = BytesMut::with_capacity(CHUNK_SIZE);
        if file.read_buf(&mut chunk).await? == 0 {
            return Ok(None);
        }
        Ok::<_, std::io::Error>(Some((chunk.freeze(), (file, None))))
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, request: DeliveryRequest) -> AttemptOutcome {
        let method = match request.method {
            DeliveryMethod::Put => Method::PUT,
            DeliveryMethod::Post => Method::POST,
        };

        let len = request.body.len();
        let hold = (request.expects_continue() && len > 0).then_some(self.continue_timeout);

        outgoing!(level = DEBUG, "{method} {} ({len} bytes)", request.url);

        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.user, Some(&credentials.password));
        }

        match Self::body(request.body, hold).await {
            Ok(Some(body)) => builder = builder.header(CONTENT_LENGTH, len).body(body),
            Ok(None) => {}
            Err(e) => return AttemptOutcome::Failed(SystemError::from(e).into()),
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return AttemptOutcome::Failed(e.into()),
        };

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        outgoing!(level = DEBUG, "{} answered {status}", request.url);

        AttemptOutcome::from_status(status, location)
    }
}
