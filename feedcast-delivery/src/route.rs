//! Relay routing between nodes.
//!
//! Provisioning declares hops `(from, to, via)`: traffic leaving `from` for
//! `to` must be handed to `via`. The resolver keeps only the hops leaving the
//! local node and answers "who do I hand this to" in O(1). It does not search
//! the graph; provisioning is expected to supply the next relay directly.
//!
//! Node names match exactly. A trailing `+` on a name is an ordinary character.

use std::fmt;

use ahash::{AHashMap, AHashSet};
use feedcast_common::internal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One hop declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hop {
    pub from: String,
    pub to: String,
    pub via: String,
}

impl Hop {
    pub fn new(from: impl Into<String>, to: impl Into<String>, via: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            via: via.into(),
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{} via {}", self.from, self.to, self.via)
    }
}

/// A hop that was ignored while building the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("Hop {hop}: unknown node {node}")]
    UnknownNode { hop: Hop, node: String },

    #[error("Hop {hop}: destination equals via-hop")]
    ViaIsDestination { hop: Hop },

    #[error("Hop {hop}: duplicate route, keeping via {kept}")]
    DuplicateRoute { hop: Hop, kept: String },
}

impl RouteError {
    #[must_use]
    pub const fn hop(&self) -> &Hop {
        match self {
            Self::UnknownNode { hop, .. }
            | Self::ViaIsDestination { hop }
            | Self::DuplicateRoute { hop, .. } => hop,
        }
    }
}

/// Next-hop table for the local node.
#[derive(Debug, Clone, Default)]
pub struct RouteResolver {
    local: String,
    next_hop: AHashMap<String, String>,
}

impl RouteResolver {
    /// Validate `hops` against `known` and record the ones leaving `local`.
    ///
    /// Invalid hops are skipped and reported; building never fails.
    pub fn build<S: AsRef<str>>(
        local: &str,
        known: &[S],
        hops: &[Hop],
    ) -> (Self, Vec<RouteError>) {
        let known: AHashSet<&str> = known.iter().map(AsRef::as_ref).collect();
        let mut seen: AHashMap<(&str, &str), &str> = AHashMap::new();
        let mut next_hop = AHashMap::new();
        let mut errors = Vec::new();

        for hop in hops {
            let unknown = [&hop.from, &hop.to, &hop.via]
                .into_iter()
                .find(|node| !known.contains(node.as_str()));

            if let Some(node) = unknown {
                errors.push(RouteError::UnknownNode {
                    hop: hop.clone(),
                    node: node.clone(),
                });
                continue;
            }

            if hop.to == hop.via {
                errors.push(RouteError::ViaIsDestination { hop: hop.clone() });
                continue;
            }

            if let Some(kept) = seen.get(&(hop.from.as_str(), hop.to.as_str())) {
                errors.push(RouteError::DuplicateRoute {
                    hop: hop.clone(),
                    kept: (*kept).to_string(),
                });
                continue;
            }

            seen.insert((hop.from.as_str(), hop.to.as_str()), hop.via.as_str());
            if hop.from == local {
                next_hop.insert(hop.to.clone(), hop.via.clone());
            }
        }

        for error in &errors {
            internal!(level = WARN, "Ignoring route: {error}");
        }

        (
            Self {
                local: local.to_string(),
                next_hop,
            },
            errors,
        )
    }

    /// Next hop toward `destination`, or `""` when the local node sends to it
    /// directly (including when `destination` is unknown).
    #[must_use]
    pub fn get_path(&self, destination: &str) -> &str {
        self.next_hop.get(destination).map_or("", String::as_str)
    }

    /// As [`RouteResolver::get_path`], but `None` instead of `""`.
    #[must_use]
    pub fn next_hop(&self, destination: &str) -> Option<&str> {
        self.next_hop.get(destination).map(String::as_str)
    }

    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.next_hop.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.next_hop.is_empty()
    }
}
