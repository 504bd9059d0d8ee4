//! Learned redirects, keyed by `(subscriber, primary URL)`.
//!
//! The cache is an in-memory index over an append-only JSON-lines log:
//!
//! ```text
//! {"op":"learn","sub":"42","from":"https://a/in","to":"https://b/in","at":1367332435566}
//! {"op":"forget","sub":"42","from":"https://a/in"}
//! ```
//!
//! Replaying the log in order rebuilds the index. Expired entries are dropped
//! from memory when looked up but stay in the log until the next compaction,
//! which rewrites the log with live entries only. Compaction runs on open and
//! whenever more than `compact_threshold` superseded records pile up.
//!
//! The index lock only ever covers map updates. Log appends and compaction
//! run under a separate async writer lock, so lookups never wait on disk.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use ahash::AHashMap;
use feedcast_common::{internal, time};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::RedirectError;

const fn default_ttl_secs() -> u64 {
    86_400 // 24 hours
}

const fn default_compact_threshold() -> usize {
    1_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectConfig {
    /// Log location; defaults to `redirects.log` under the spool root
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// How long a learned redirect stays usable
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Superseded log records tolerated before the log is rewritten
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: usize,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_secs: default_ttl_secs(),
            compact_threshold: default_compact_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEntry {
    pub target: String,
    pub learned_at: SystemTime,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogRecord {
    Learn {
        sub: String,
        from: String,
        to: String,
        at: u64,
    },
    Forget {
        sub: String,
        from: String,
    },
}

impl LogRecord {
    fn learn(sub: &str, from: &str, entry: &RedirectEntry) -> Self {
        Self::Learn {
            sub: sub.to_string(),
            from: from.to_string(),
            to: entry.target.clone(),
            at: time::to_millis(entry.learned_at),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, RedirectError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

type RedirectKey = (String, String);
type Index = AHashMap<RedirectKey, RedirectEntry>;

#[derive(Debug)]
struct RedirectLog {
    path: PathBuf,
    file: tokio::fs::File,
    /// Records currently in the file
    records: usize,
}

impl RedirectLog {
    async fn append(&mut self, record: &LogRecord) -> Result<(), RedirectError> {
        self.file.write_all(&record.encode()?).await?;
        self.file.flush().await?;
        self.records += 1;
        Ok(())
    }
}

/// Persistent `(subscriber, primary URL) -> redirect URL` mapping with expiry.
#[derive(Debug)]
pub struct RedirectCache {
    ttl: Duration,
    compact_threshold: usize,
    entries: Mutex<Index>,
    log: Option<tokio::sync::Mutex<RedirectLog>>,
}

impl RedirectCache {
    /// A cache that forgets everything on restart.
    #[must_use]
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            ttl,
            compact_threshold: usize::MAX,
            entries: Mutex::new(AHashMap::new()),
            log: None,
        }
    }

    /// Open (creating if needed) the log at `path`, replay it and compact it.
    ///
    /// Unparsable lines, such as a line cut short by a crash, are skipped.
    ///
    /// # Errors
    /// If the log cannot be read or rewritten.
    pub fn open(
        path: impl Into<PathBuf>,
        ttl: Duration,
        compact_threshold: usize,
        now: SystemTime,
    ) -> Result<Self, RedirectError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entries = AHashMap::new();
        match File::open(&path) {
            Ok(file) => {
                for (number, line) in BufReader::new(file).lines().enumerate() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LogRecord>(&line) {
                        Ok(record) => apply(&mut entries, record),
                        Err(e) => internal!(
                            level = WARN,
                            "Skipping redirect log line {} in {}: {e}",
                            number + 1,
                            path.display()
                        ),
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        entries.retain(|_, entry: &mut RedirectEntry| !is_expired(entry, ttl, now));

        let staging = staging_path(&path);
        {
            let mut file = File::create(&staging)?;
            file.write_all(&encode_index(&entries)?)?;
            file.sync_all()?;
        }
        fs::rename(&staging, &path)?;

        let file = OpenOptions::new().append(true).open(&path)?;
        internal!(
            level = INFO,
            "Loaded {} redirects from {}",
            entries.len(),
            path.display()
        );

        Ok(Self {
            ttl,
            compact_threshold,
            log: Some(tokio::sync::Mutex::new(RedirectLog {
                path,
                file: tokio::fs::File::from_std(file),
                records: entries.len(),
            })),
            entries: Mutex::new(entries),
        })
    }

    /// Remember that `original` for `sub` now lives at `target`.
    ///
    /// The in-memory index is updated even if the log append fails.
    ///
    /// # Errors
    /// If the record cannot be persisted.
    pub async fn redirect(
        &self,
        sub: &str,
        original: &str,
        target: &str,
        now: SystemTime,
    ) -> Result<(), RedirectError> {
        let entry = RedirectEntry {
            target: target.to_string(),
            learned_at: now,
        };
        let record = LogRecord::learn(sub, original, &entry);

        let mut log = self.writer().await;
        self.entries
            .lock()
            .insert((sub.to_string(), original.to_string()), entry);

        internal!(level = DEBUG, "Learned redirect for {sub}: {original} -> {target}");
        self.persist(log.as_deref_mut(), &record).await
    }

    /// Drop the redirect for `(sub, original)`. Returns whether one existed.
    ///
    /// # Errors
    /// If the tombstone cannot be persisted.
    pub async fn forget(&self, sub: &str, original: &str) -> Result<bool, RedirectError> {
        let mut log = self.writer().await;
        let removed = self
            .entries
            .lock()
            .remove(&(sub.to_string(), original.to_string()));
        if removed.is_none() {
            return Ok(false);
        }

        internal!(level = DEBUG, "Forgot redirect for {sub}: {original}");
        let record = LogRecord::Forget {
            sub: sub.to_string(),
            from: original.to_string(),
        };
        self.persist(log.as_deref_mut(), &record).await?;
        Ok(true)
    }

    /// The learned target for `(sub, original)`, if present and unexpired.
    pub fn learned(&self, sub: &str, original: &str, now: SystemTime) -> Option<String> {
        let key = (sub.to_string(), original.to_string());
        let mut entries = self.entries.lock();

        let entry = entries.get(&key)?;
        if is_expired(entry, self.ttl, now) {
            entries.remove(&key);
            return None;
        }

        Some(entry.target.clone())
    }

    /// The learned target for `(sub, original)`, or `original` itself.
    pub fn lookup(&self, sub: &str, original: &str, now: SystemTime) -> String {
        self.learned(sub, original, now)
            .unwrap_or_else(|| original.to_string())
    }

    /// Entries held in memory, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Records currently in the persisted log, if there is one.
    pub async fn log_records(&self) -> Option<usize> {
        Some(self.writer().await?.records)
    }

    /// Rewrite the log with live entries only.
    ///
    /// # Errors
    /// If the rewritten log cannot be written or renamed into place.
    pub async fn compact(&self) -> Result<(), RedirectError> {
        match self.writer().await {
            Some(mut log) => self.compact_into(&mut log).await,
            None => Ok(()),
        }
    }

    async fn writer(&self) -> Option<tokio::sync::MutexGuard<'_, RedirectLog>> {
        match &self.log {
            Some(log) => Some(log.lock().await),
            None => None,
        }
    }

    async fn persist(
        &self,
        log: Option<&mut RedirectLog>,
        record: &LogRecord,
    ) -> Result<(), RedirectError> {
        let Some(log) = log else {
            return Ok(());
        };

        log.append(record).await?;

        let live = self.entries.lock().len();
        if log.records.saturating_sub(live) > self.compact_threshold {
            self.compact_into(log).await?;
        }

        Ok(())
    }

    /// Atomically replace the log with one `learn` record per live entry and
    /// reopen it for appending.
    async fn compact_into(&self, log: &mut RedirectLog) -> Result<(), RedirectError> {
        let (contents, records) = {
            let entries = self.entries.lock();
            (encode_index(&entries)?, entries.len())
        };

        let staging = staging_path(&log.path);
        {
            let mut file = tokio::fs::File::create(&staging).await?;
            file.write_all(&contents).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&staging, &log.path).await?;

        log.file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&log.path)
            .await?;
        log.records = records;

        internal!(
            level = DEBUG,
            "Compacted redirect log {} to {records} records",
            log.path.display()
        );
        Ok(())
    }
}

fn is_expired(entry: &RedirectEntry, ttl: Duration, now: SystemTime) -> bool {
    now.duration_since(entry.learned_at)
        .is_ok_and(|age| age >= ttl)
}

fn apply(entries: &mut Index, record: LogRecord) {
    match record {
        LogRecord::Learn { sub, from, to, at } => {
            entries.insert(
                (sub, from),
                RedirectEntry {
                    target: to,
                    learned_at: time::from_millis(at),
                },
            );
        }
        LogRecord::Forget { sub, from } => {
            entries.remove(&(sub, from));
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    path.with_extension("compacting")
}

fn encode_index(entries: &Index) -> Result<Vec<u8>, RedirectError> {
    let mut contents = Vec::new();
    for ((sub, from), entry) in entries {
        contents.extend(LogRecord::learn(sub, from, entry).encode()?);
    }
    Ok(contents)
}
