//! Access-control seam for subscribe and publish checks.

use std::fmt;

use crate::protocol::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Read => write!(f, "read"),
            AccessType::Write => write!(f, "write"),
        }
    }
}

/// Decides whether a user may read from or publish to a path.
pub trait AccessManager: Send + Sync {
    fn is_allowed(&self, access: AccessType, user_id: &str, path: &Path) -> bool;
}

/// Permits everything; the default for unrestricted deployments.
pub struct AllowAll;

impl AccessManager for AllowAll {
    fn is_allowed(&self, _access: AccessType, _user_id: &str, _path: &Path) -> bool {
        true
    }
}
