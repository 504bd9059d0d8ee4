use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// What sits behind a destination URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationKind {
    /// A subscriber endpoint, identified by its subscription id.
    Subscriber(String),
    /// A peer node; files for it may need relaying through another node.
    Node(String),
}

impl DestinationKind {
    /// Subscription id or node name.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Subscriber(id) | Self::Node(id) => id,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMethod {
    #[default]
    Put,
    /// Used by log-shipping destinations.
    Post,
}

#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationFlags {
    /// Send the metadata only, with an empty body.
    #[serde(default)]
    pub metadata_only: bool,

    /// Ask for `100-continue` before sending the body.
    #[serde(default)]
    pub use_100_continue: bool,

    /// Dispatch ahead of ordinary destinations.
    #[serde(default)]
    pub privileged: bool,

    /// Learn and use 3xx redirect targets.
    #[serde(default)]
    pub follow_redirects: bool,

    /// Inflate gzip payloads before sending.
    #[serde(default)]
    pub decompress: bool,
}

const fn default_retryable() -> bool {
    true
}

/// One delivery target, as provisioned. Replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationInfo {
    /// Logical name; also the default spool directory name
    pub name: String,

    pub kind: DestinationKind,

    /// Base URL; the file id is appended per delivery
    pub url: String,

    /// Spool directory, relative to the node's spool root unless absolute
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,

    #[serde(default)]
    pub credentials: Option<Credentials>,

    #[serde(default)]
    pub flags: DestinationFlags,

    #[serde(default)]
    pub method: DeliveryMethod,

    /// When false, a 4xx rejection drops the entry instead of retrying it
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

impl DestinationInfo {
    #[must_use]
    pub fn subscriber(name: impl Into<String>, sub_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_kind(name, DestinationKind::Subscriber(sub_id.into()), url)
    }

    #[must_use]
    pub fn node(name: impl Into<String>, node: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_kind(name, DestinationKind::Node(node.into()), url)
    }

    fn with_kind(name: impl Into<String>, kind: DestinationKind, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            url: url.into(),
            spool_dir: None,
            credentials: None,
            flags: DestinationFlags::default(),
            method: DeliveryMethod::default(),
            retryable: true,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: DestinationFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    #[must_use]
    pub const fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    #[must_use]
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    /// Where this destination's spool lives under `root`.
    #[must_use]
    pub fn spool_path(&self, root: &Path) -> PathBuf {
        match &self.spool_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.join(&self.name),
        }
    }

    /// Key under which redirects for this destination are remembered.
    #[must_use]
    pub fn redirect_key(&self) -> &str {
        self.kind.id()
    }

    /// Node destinations may be relayed; subscribers never are.
    #[must_use]
    pub fn relay_node(&self) -> Option<&str> {
        match &self.kind {
            DestinationKind::Node(node) => Some(node),
            DestinationKind::Subscriber(_) => None,
        }
    }
}
