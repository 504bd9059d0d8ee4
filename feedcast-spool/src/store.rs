use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use feedcast_common::internal;
use feedcast_tracing::traced;
use tokio::fs;

use crate::{
    error::{Result, SpoolError, ValidationError},
    metadata::SpoolMetadata,
    types::{
        DELETED_SUFFIX, METADATA_SUFFIX, PublishId, STAGING_PREFIX, SequenceGenerator, SpoolEntry,
    },
};

/// File-based spool for one destination
///
/// Each pending delivery is a pair of files in the destination's directory:
/// - Payload: `{token}.{publish_id}`, the file body exactly as published
/// - Metadata: `{token}.{publish_id}.M`, a bincode [`SpoolMetadata`] sidecar
///
/// The sequence token is a zero-padded decimal number, so lexical order of
/// file names is arrival order and therefore delivery order.
///
/// # Atomicity
/// Writes go to `.tmp_`-prefixed files first. [`SpoolStore::commit`] renames
/// the payload into place before the sidecar, and scans only report entries
/// whose sidecar *and* payload both exist, so a half-written entry is never
/// visible. Removal runs the other way: the payload is renamed to `.deleted`
/// first, so a concurrent scan stops reporting the entry immediately.
///
/// Crash leftovers (`.deleted` files and stale `.tmp_` files) are removed by
/// [`SpoolStore::open`].
#[derive(Debug, Clone)]
pub struct SpoolStore {
    path: PathBuf,
    sequence: Arc<SequenceGenerator>,
}

/// A payload and sidecar written to staging files but not yet visible.
#[derive(Debug)]
#[must_use = "a staged entry is invisible until committed"]
pub struct StagedEntry {
    entry: SpoolEntry,
}

impl StagedEntry {
    pub const fn entry(&self) -> &SpoolEntry {
        &self.entry
    }
}

impl SpoolStore {
    /// Open (creating if needed) the spool directory at `path`.
    ///
    /// # Errors
    /// - If the path contains `..` components
    /// - If the path exists but is not a directory
    /// - If the directory cannot be created or scanned
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        Self::validate_path(&path)?;

        if !path.try_exists()? {
            internal!("{} does not exist, creating...", path.display());
            std::fs::create_dir_all(&path)?;
        } else if !path.is_dir() {
            return Err(ValidationError::NotDirectory(path.display().to_string()).into());
        }

        let highest = Self::cleanup_and_find_highest(&path)?;

        Ok(Self {
            path,
            sequence: Arc::new(SequenceGenerator::starting_after(highest)),
        })
    }

    fn validate_path(path: &Path) -> Result<()> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentTraversal(path.display().to_string()).into());
        }
        Ok(())
    }

    /// Remove orphans from interrupted writes/removals and return the highest
    /// numeric sequence token present.
    fn cleanup_and_find_highest(path: &Path) -> Result<Option<u64>> {
        let mut cleaned = 0;
        let mut highest = None;

        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.ends_with(DELETED_SUFFIX) || name.starts_with(STAGING_PREFIX) {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => cleaned += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            if let Some(parsed) = SpoolEntry::from_file_name(&name)
                .and_then(|e| e.token().parse::<u64>().ok())
            {
                highest = highest.max(Some(parsed));
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from spool {}",
                path.display()
            );
        }

        Ok(highest)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn payload_path(&self, entry: &SpoolEntry) -> PathBuf {
        self.path.join(entry.file_name())
    }

    #[must_use]
    pub fn metadata_path(&self, entry: &SpoolEntry) -> PathBuf {
        self.path.join(entry.metadata_name())
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{STAGING_PREFIX}{name}"))
    }

    /// Write a payload and its sidecar to staging files.
    ///
    /// # Errors
    /// If either staging file cannot be written or the metadata cannot be encoded.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, metadata, payload), fields(publish_id = %publish_id)), timing(precision = "ms"))]
    pub async fn stage(
        &self,
        publish_id: &PublishId,
        metadata: &SpoolMetadata,
        payload: &[u8],
    ) -> Result<StagedEntry> {
        let entry = SpoolEntry::new(&self.sequence.next_token(), publish_id.clone());

        let payload_path = self.payload_path(&entry);
        if fs::try_exists(&payload_path).await? {
            return Err(SpoolError::AlreadyExists(entry.file_name().to_string()));
        }

        fs::write(self.staging_path(entry.file_name()), payload).await?;
        fs::write(self.staging_path(&entry.metadata_name()), metadata.encode()?).await?;

        Ok(StagedEntry { entry })
    }

    /// Make a staged entry visible to delivery.
    ///
    /// # Errors
    /// If either rename fails.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(entry = %staged.entry)), timing(precision = "ms"))]
    pub async fn commit(&self, staged: StagedEntry) -> Result<SpoolEntry> {
        let entry = staged.entry;

        fs::rename(
            self.staging_path(entry.file_name()),
            self.payload_path(&entry),
        )
        .await?;
        fs::rename(
            self.staging_path(&entry.metadata_name()),
            self.metadata_path(&entry),
        )
        .await?;

        internal!(level = DEBUG, "Spooled {entry} in {}", self.path.display());

        Ok(entry)
    }

    /// Stage and commit in one step.
    ///
    /// # Errors
    /// See [`SpoolStore::stage`] and [`SpoolStore::commit`].
    pub async fn deposit(
        &self,
        publish_id: &PublishId,
        metadata: &SpoolMetadata,
        payload: &[u8],
    ) -> Result<SpoolEntry> {
        let staged = self.stage(publish_id, metadata, payload).await?;
        self.commit(staged).await
    }

    /// All committed entries, oldest first.
    ///
    /// The directory listing is read in full before any entry is reported, so
    /// entries committed during the scan show up on the next scan rather than
    /// half-way through this one.
    ///
    /// # Errors
    /// If the directory cannot be read.
    #[traced(instrument(level = tracing::Level::TRACE, skip(self)), timing(precision = "ms"))]
    pub async fn list_pending(&self) -> Result<Vec<SpoolEntry>> {
        let mut dir = fs::read_dir(&self.path).await?;
        let mut names = HashSet::new();

        while let Some(entry) = dir.next_entry().await? {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }

        let mut entries: Vec<SpoolEntry> = names
            .iter()
            .filter(|name| name.ends_with(METADATA_SUFFIX))
            .filter_map(|name| SpoolEntry::from_metadata_name(name))
            .filter(|entry| names.contains(entry.file_name()))
            .collect();

        entries.sort();

        Ok(entries)
    }

    /// Entries carrying the given publish id, oldest first.
    ///
    /// # Errors
    /// If the directory cannot be read.
    pub async fn find(&self, publish_id: &PublishId) -> Result<Vec<SpoolEntry>> {
        Ok(self
            .list_pending()
            .await?
            .into_iter()
            .filter(|entry| entry.publish_id() == publish_id)
            .collect())
    }

    /// Whether both files of the entry are still present.
    pub async fn contains(&self, entry: &SpoolEntry) -> bool {
        fs::try_exists(self.payload_path(entry)).await.unwrap_or(false)
            && fs::try_exists(self.metadata_path(entry))
                .await
                .unwrap_or(false)
    }

    /// # Errors
    /// If the sidecar is missing or undecodable.
    pub async fn read_metadata(&self, entry: &SpoolEntry) -> Result<SpoolMetadata> {
        let bytes = fs::read(self.metadata_path(entry)).await?;
        SpoolMetadata::decode(&bytes)
    }

    /// # Errors
    /// If the payload is missing or unreadable.
    pub async fn read_payload(&self, entry: &SpoolEntry) -> Result<Vec<u8>> {
        Ok(fs::read(self.payload_path(entry)).await?)
    }

    /// Size of the payload in bytes.
    ///
    /// # Errors
    /// If the payload is missing or cannot be inspected.
    pub async fn payload_len(&self, entry: &SpoolEntry) -> Result<u64> {
        Ok(fs::metadata(self.payload_path(entry)).await?.len())
    }

    /// Delete both files of an entry.
    ///
    /// Removing an entry that is already gone is not an error. Returns whether
    /// this call removed anything.
    ///
    /// Uses a two-phase delete: both files are renamed to `.deleted` (payload
    /// first), then unlinked. A crash between the phases leaves `.deleted`
    /// files that scans ignore and [`SpoolStore::open`] removes.
    ///
    /// # Errors
    /// If a rename or unlink fails for a reason other than the file being absent.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(entry = %entry)), timing(precision = "ms"))]
    pub async fn remove(&self, entry: &SpoolEntry) -> Result<bool> {
        let payload = self.payload_path(entry);
        let metadata = self.metadata_path(entry);
        let deleted_payload = self.path.join(format!("{}{DELETED_SUFFIX}", entry.file_name()));
        let deleted_metadata = self
            .path
            .join(format!("{}{DELETED_SUFFIX}", entry.metadata_name()));

        let mut removed = false;
        for (from, to) in [(&payload, &deleted_payload), (&metadata, &deleted_metadata)] {
            match fs::rename(from, to).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        for path in [&deleted_payload, &deleted_metadata] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if removed {
            internal!(level = DEBUG, "Removed {entry} from {}", self.path.display());
        }

        Ok(removed)
    }
}
