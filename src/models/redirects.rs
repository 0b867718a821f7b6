//! Redirects discovered while fetching one registration.
//!
//! Two mechanisms feed the accumulator: the multi-value
//! `Attribution-Reporting-Redirect` response header (list type) and the
//! standard `Location` header on 3xx responses (location type). The
//! accumulator lives for one fetch attempt and is consumed immediately by
//! the queue runner to spawn new pending rows; it is never persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a redirect URI was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectType {
    /// From the multi-value `Attribution-Reporting-Redirect` header
    List,
    /// From the standard `Location` header alongside a 3xx code
    Location,
}

impl fmt::Display for RedirectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List => write!(f, "list"),
            Self::Location => write!(f, "location"),
        }
    }
}

/// Ordered, deduplicated redirect URIs grouped by discovery mechanism.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Redirects {
    list: Vec<String>,
    location: Vec<String>,
}

impl Redirects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a URI, keeping first-occurrence order and dropping duplicates
    /// within the same type. Merging across fetch hops goes through here.
    pub fn push(&mut self, redirect_type: RedirectType, uri: impl Into<String>) {
        let uri = uri.into();
        let bucket = match redirect_type {
            RedirectType::List => &mut self.list,
            RedirectType::Location => &mut self.location,
        };
        if !bucket.contains(&uri) {
            bucket.push(uri);
        }
    }

    pub fn get(&self, redirect_type: RedirectType) -> &[String] {
        match redirect_type {
            RedirectType::List => &self.list,
            RedirectType::Location => &self.location,
        }
    }

    /// All discovered URIs, list-type first, in discovery order.
    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.list.iter().chain(self.location.iter()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.list.len() + self.location.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty() && self.location.is_empty()
    }

    pub fn merge(&mut self, other: Redirects) {
        for uri in other.list {
            self.push(RedirectType::List, uri);
        }
        for uri in other.location {
            self.push(RedirectType::Location, uri);
        }
    }
}
