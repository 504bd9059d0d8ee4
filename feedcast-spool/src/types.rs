use std::{
    cmp::Ordering,
    fmt,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};

use crate::error::{Result, SpoolError};

/// Suffix of the metadata sidecar that accompanies every payload file.
pub const METADATA_SUFFIX: &str = ".M";

/// Prefix of files that are still being written.
pub const STAGING_PREFIX: &str = ".tmp_";

/// Suffix of files that are halfway through removal.
pub const DELETED_SUFFIX: &str = ".deleted";

/// Width of generated sequence tokens. Twenty digits holds any `u64`, so
/// generated names always sort lexically in numeric order.
const TOKEN_WIDTH: usize = 20;

/// Publisher-assigned identifier of one published file.
///
/// Publish ids appear verbatim in spool file names, so anything that could
/// escape the spool directory or collide with the naming scheme is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublishId(String);

impl PublishId {
    /// Validate a publish id.
    ///
    /// # Errors
    /// Rejects empty ids, path separators, `..`, leading dots, whitespace and
    /// ids that end with the metadata or removal suffix.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        let invalid = id.is_empty()
            || id.starts_with('.')
            || id.contains('/')
            || id.contains('\\')
            || id.contains("..")
            || id.chars().any(|c| c.is_whitespace() || c.is_control())
            || id.ends_with(METADATA_SUFFIX)
            || id.ends_with(DELETED_SUFFIX);

        if invalid {
            return Err(SpoolError::InvalidName(id));
        }

        Ok(Self(id))
    }

    /// Publish id for a file originated on this node: `<millis>.<ulid>`.
    #[must_use]
    pub fn generate() -> Self {
        let id = ulid::Ulid::new();
        Self(format!("{}.{id}", id.timestamp_ms()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublishId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PublishId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One file queued for delivery: `<sequenceToken>.<publishId>` plus its
/// `<sequenceToken>.<publishId>.M` sidecar.
///
/// Entries order by their full file name, which is arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpoolEntry {
    token: String,
    publish_id: PublishId,
    name: String,
}

impl SpoolEntry {
    #[must_use]
    pub fn new(token: &str, publish_id: PublishId) -> Self {
        Self {
            name: format!("{token}.{publish_id}"),
            token: token.to_string(),
            publish_id,
        }
    }

    /// Parse a payload file name. Returns `None` for anything that is not a
    /// spool payload (sidecars, staging files, removal leftovers, strays).
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.starts_with(STAGING_PREFIX)
            || name.ends_with(DELETED_SUFFIX)
            || name.ends_with(METADATA_SUFFIX)
        {
            return None;
        }

        let (token, publish_id) = name.split_once('.')?;
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let publish_id = PublishId::new(publish_id).ok()?;
        Some(Self::new(token, publish_id))
    }

    /// Parse a metadata sidecar file name into the entry it describes.
    #[must_use]
    pub fn from_metadata_name(name: &str) -> Option<Self> {
        Self::from_file_name(name.strip_suffix(METADATA_SUFFIX)?)
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub const fn publish_id(&self) -> &PublishId {
        &self.publish_id
    }

    /// Payload file name.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.name
    }

    /// Metadata sidecar file name.
    #[must_use]
    pub fn metadata_name(&self) -> String {
        format!("{}{METADATA_SUFFIX}", self.name)
    }
}

impl Ord for SpoolEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl PartialOrd for SpoolEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SpoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Monotonic sequence token source for one spool directory.
///
/// Tokens start from the wall clock in microseconds so they keep increasing
/// across restarts, and never go below one past the highest token already on
/// disk.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    #[must_use]
    pub fn starting_after(highest_seen: Option<u64>) -> Self {
        let clock = feedcast_common::time::now_millis().saturating_mul(1000);
        let floor = highest_seen.map_or(0, |h| h.saturating_add(1));
        Self {
            next: AtomicU64::new(clock.max(floor)),
        }
    }

    /// Allocate the next token, zero padded so lexical order is numeric order.
    pub fn next_token(&self) -> String {
        let value = self.next.fetch_add(1, AtomicOrdering::SeqCst);
        format!("{value:0width$}", width = TOKEN_WIDTH)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_id_validation() {
        assert!(PublishId::new("pub1").is_ok());
        assert!(PublishId::new("1367332435566.dr-node-1").is_ok());

        assert!(PublishId::new("").is_err());
        assert!(PublishId::new("../etc/passwd").is_err());
        assert!(PublishId::new("foo/bar").is_err());
        assert!(PublishId::new("foo\\bar").is_err());
        assert!(PublishId::new(".hidden").is_err());
        assert!(PublishId::new("with space").is_err());
        assert!(PublishId::new("pub1.M").is_err());
        assert!(PublishId::new("pub1.deleted").is_err());
    }

    #[test]
    fn test_generated_publish_ids_are_valid() {
        let id = PublishId::generate();
        assert!(PublishId::new(id.as_str()).is_ok());
    }

    #[test]
    fn test_entry_names() {
        let entry = SpoolEntry::from_file_name("00001.pub1").unwrap();
        assert_eq!(entry.token(), "00001");
        assert_eq!(entry.publish_id().as_str(), "pub1");
        assert_eq!(entry.file_name(), "00001.pub1");
        assert_eq!(entry.metadata_name(), "00001.pub1.M");

        let relayed = SpoolEntry::from_file_name("00042.1367332435566.dr-node-1").unwrap();
        assert_eq!(relayed.publish_id().as_str(), "1367332435566.dr-node-1");

        let from_meta = SpoolEntry::from_metadata_name("00001.pub1.M").unwrap();
        assert_eq!(from_meta, entry);
    }

    #[test]
    fn test_non_entries_are_ignored() {
        assert!(SpoolEntry::from_file_name("00001.pub1.M").is_none());
        assert!(SpoolEntry::from_file_name(".tmp_00001.pub1").is_none());
        assert!(SpoolEntry::from_file_name("00001.pub1.deleted").is_none());
        assert!(SpoolEntry::from_file_name("abc.pub1").is_none());
        assert!(SpoolEntry::from_file_name("00001").is_none());
        assert!(SpoolEntry::from_file_name(".pub1").is_none());
        assert!(SpoolEntry::from_metadata_name("00001.pub1").is_none());
    }

    #[test]
    fn test_entries_sort_by_file_name() {
        let mut entries = vec![
            SpoolEntry::from_file_name("00002.pub2").unwrap(),
            SpoolEntry::from_file_name("00001.pub9").unwrap(),
            SpoolEntry::from_file_name("00001.pub1").unwrap(),
        ];
        entries.sort();
        let names: Vec<_> = entries.iter().map(SpoolEntry::file_name).collect();
        assert_eq!(names, ["00001.pub1", "00001.pub9", "00002.pub2"]);
    }

    #[test]
    fn test_sequence_tokens_are_monotonic_and_sortable() {
        let generator = SequenceGenerator::starting_after(None);
        let tokens: Vec<String> = (0..100).map(|_| generator.next_token()).collect();

        assert!(tokens.iter().all(|t| t.len() == TOKEN_WIDTH));
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sequence_tokens_skip_past_existing() {
        let generator = SequenceGenerator::starting_after(Some(u64::MAX - 10));
        let token: u64 = generator.next_token().parse().unwrap();
        assert_eq!(token, u64::MAX - 9);
    }
}
