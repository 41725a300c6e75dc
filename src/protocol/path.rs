//! Topic paths: slash-delimited prefix hierarchies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A topic path such as `/foo/bar`.
///
/// The first segment is the partition: all messages under `/foo/*` share
/// partition `foo`, the unit of id assignment and on-disk storage.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(String);

impl Path {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The partition this path belongs to: the first segment, without the
    /// leading slash. `/foo/bar` -> `foo`.
    pub fn partition(&self) -> &str {
        let trimmed = self.0.trim_start_matches('/');
        match trimmed.find('/') {
            Some(pos) => &trimmed[..pos],
            None => trimmed,
        }
    }

    /// The path without its leading slash, as used in list responses.
    pub fn without_leading_slash(&self) -> &str {
        self.0.strip_prefix('/').unwrap_or(&self.0)
    }

    /// Prefix match with a segment boundary: `self` matches `route` iff
    /// `self` starts with `route` and either both are equal or the next
    /// character in `self` is `/`. Thus `/a/b` matches `/a` but not `/ab`.
    pub fn matches(&self, route: &Path) -> bool {
        let message = self.0.as_bytes();
        let route = route.0.as_bytes();
        message.starts_with(route)
            && (message.len() == route.len() || message[route.len()] == b'/')
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({:?})", self.0)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Self(s)
    }
}
