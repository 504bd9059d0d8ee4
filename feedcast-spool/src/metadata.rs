use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Sidecar record stored next to every spooled payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolMetadata {
    /// Publisher-assigned id of the file
    pub publish_id: String,
    /// Feed the file was published to
    pub feed_id: Option<String>,
    /// Feed-relative file name, appended to the destination URL
    pub file_id: String,
    /// Content type supplied by the publisher
    pub content_type: String,
    /// Identity the publish was made on behalf of
    pub on_behalf_of: Option<String>,
    /// Arbitrary publisher headers, forwarded verbatim
    pub headers: Vec<(String, String)>,
    /// When this node accepted the file (milliseconds since the epoch)
    pub received_at_ms: u64,
}

impl SpoolMetadata {
    /// Metadata for a file accepted now, with the file id defaulting to the publish id.
    #[must_use]
    pub fn new(publish_id: impl Into<String>, content_type: impl Into<String>) -> Self {
        let publish_id = publish_id.into();
        Self {
            file_id: publish_id.clone(),
            publish_id,
            feed_id: None,
            content_type: content_type.into(),
            on_behalf_of: None,
            headers: Vec::new(),
            received_at_ms: feedcast_common::time::now_millis(),
        }
    }

    #[must_use]
    pub fn with_feed(mut self, feed_id: impl Into<String>) -> Self {
        self.feed_id = Some(feed_id.into());
        self
    }

    #[must_use]
    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = file_id.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_on_behalf_of(mut self, user: impl Into<String>) -> Self {
        self.on_behalf_of = Some(user.into());
        self
    }

    #[must_use]
    pub const fn received_at(mut self, millis: u64) -> Self {
        self.received_at_ms = millis;
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// # Errors
    /// If the record cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// # Errors
    /// If the bytes are not a valid sidecar record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (metadata, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(metadata)
    }
}
