use std::{cmp::Ordering, hash::Hash, sync::Arc};

use feedcast_spool::{PublishId, SpoolEntry, SpoolMetadata};
use reqwest::Url;

use crate::destination::DestinationInfo;

/// One delivery attempt for one spool entry.
///
/// Built fresh by [`crate::queue::DeliveryQueue::get_next`] and discarded once
/// its outcome has been recorded. Tasks compare, order and hash by publish id
/// alone.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    entry: SpoolEntry,
    destination: Arc<DestinationInfo>,
    metadata: SpoolMetadata,
    attempt: u32,
    /// Base URL before any learned redirect: the destination URL, or its
    /// relayed form when the destination is reached through another node.
    primary_base: String,
    /// Base URL this attempt is sent to.
    target_base: String,
    redirects: u32,
}

impl DeliveryTask {
    #[must_use]
    pub fn new(
        entry: SpoolEntry,
        destination: Arc<DestinationInfo>,
        metadata: SpoolMetadata,
        attempt: u32,
        primary_base: String,
        target_base: String,
    ) -> Self {
        Self {
            entry,
            destination,
            metadata,
            attempt,
            primary_base,
            target_base,
            redirects: 0,
        }
    }

    #[must_use]
    pub const fn publish_id(&self) -> &PublishId {
        self.entry.publish_id()
    }

    #[must_use]
    pub const fn entry(&self) -> &SpoolEntry {
        &self.entry
    }

    #[must_use]
    pub fn destination(&self) -> &DestinationInfo {
        &self.destination
    }

    #[must_use]
    pub const fn metadata(&self) -> &SpoolMetadata {
        &self.metadata
    }

    /// 1 for the first attempt after the destination last succeeded.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn primary_base(&self) -> &str {
        &self.primary_base
    }

    #[must_use]
    pub fn target_base(&self) -> &str {
        &self.target_base
    }

    /// Redirects followed so far in this attempt.
    #[must_use]
    pub const fn redirects(&self) -> u32 {
        self.redirects
    }

    /// Whether this attempt goes to a learned redirect target.
    #[must_use]
    pub fn from_redirect(&self) -> bool {
        self.target_base != self.primary_base
    }

    /// Whether the spooled gzip payload is inflated before sending.
    #[must_use]
    pub fn inflates(&self) -> bool {
        let flags = self.destination.flags;
        flags.decompress
            && !flags.metadata_only
            && self
                .metadata
                .header("content-encoding")
                .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"))
    }

    /// Full URL of the file: the target base followed by the file id.
    #[must_use]
    pub fn target_url(&self) -> String {
        join_file(&self.target_base, &self.metadata.file_id)
    }

    /// The base URL a redirect `location` points at, or `None` when the
    /// location does not name this file or is not an http(s) URL.
    ///
    /// Relative locations are resolved against [`DeliveryTask::target_url`].
    #[must_use]
    pub fn redirect_base(&self, location: &str) -> Option<String> {
        let current = Url::parse(&self.target_url()).ok()?;
        let resolved = current.join(location).ok()?;
        if !matches!(resolved.scheme(), "http" | "https") {
            return None;
        }

        let base = resolved
            .as_str()
            .strip_suffix(self.metadata.file_id.as_str())?
            .strip_suffix('/')?;

        Url::parse(base).ok().map(|_| base.to_string())
    }

    /// The same task, sent to `base` as the next step of a redirect chain.
    #[must_use]
    pub fn redirected_to(&self, base: String) -> Self {
        Self {
            target_base: base,
            redirects: self.redirects.saturating_add(1),
            ..self.clone()
        }
    }
}

impl PartialEq for DeliveryTask {
    fn eq(&self, other: &Self) -> bool {
        self.publish_id() == other.publish_id()
    }
}

impl Eq for DeliveryTask {}

impl Hash for DeliveryTask {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.publish_id().hash(state);
    }
}

impl Ord for DeliveryTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.publish_id().cmp(other.publish_id())
    }
}

impl PartialOrd for DeliveryTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `base` with its host replaced by the relay node `via`.
#[must_use]
pub fn relay_base(base: &str, via: &str) -> Option<String> {
    let mut url = Url::parse(base).ok()?;
    url.set_host(Some(via)).ok()?;
    Some(url.to_string())
}

fn join_file(base: &str, file_id: &str) -> String {
    format!("{}/{file_id}", base.trim_end_matches('/'))
}
