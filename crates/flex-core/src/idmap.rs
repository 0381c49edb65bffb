//! Subordinate uid/gid ranges delegated to unprivileged containers.
//!
//! The ranges come from the shadow-utils tables (`/etc/subuid` and
//! `/etc/subgid`), one `owner:start:length` entry per line. The owner field
//! is either a user name or a numeric uid.
//!
//! An `IdMap` is resolved once when the daemon starts and never changes
//! afterwards; every container created by the daemon gets the same mapping.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::{getuid, User};
use thiserror::Error;
use tracing::{debug, trace};

/// Default table of subordinate user IDs.
pub const DEFAULT_SUBUID_PATH: &str = "/etc/subuid";

/// Default table of subordinate group IDs.
pub const DEFAULT_SUBGID_PATH: &str = "/etc/subgid";

/// Errors raised while resolving an ID mapping.
#[derive(Error, Debug)]
pub enum IdMapError {
    /// A range table could not be opened or read
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The user has no usable entry in a range table
    #[error("User {user:?} has no range assigned in {path}")]
    NoRangeAssigned { path: PathBuf, user: String },

    /// A range with zero length was supplied
    #[error("Empty {kind} range starting at {start}")]
    EmptyRange { kind: &'static str, start: u32 },

    /// The running uid has no passwd entry
    #[error("No user entry for uid {uid}")]
    UnknownUser { uid: u32 },

    /// The passwd lookup itself failed
    #[error("User lookup failed: {0}")]
    UserLookup(String),
}

/// A contiguous block of subordinate IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: u32,
    pub length: u32,
}

impl IdRange {
    /// Creates a range; `length` must be non-zero.
    pub const fn new(start: u32, length: u32) -> Self {
        Self { start, length }
    }

    fn is_usable(&self) -> bool {
        self.length > 0 && self.start.checked_add(self.length).is_some()
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start, self.length)
    }
}

/// The user whose ranges are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdOwner {
    pub name: String,
    pub uid: u32,
}

impl IdOwner {
    pub fn new(name: impl Into<String>, uid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
        }
    }

    /// Returns the user running this process.
    pub fn current() -> Result<Self, IdMapError> {
        let uid = getuid();
        let user = User::from_uid(uid)
            .map_err(|e| IdMapError::UserLookup(e.to_string()))?
            .ok_or(IdMapError::UnknownUser { uid: uid.as_raw() })?;
        Ok(Self::new(user.name, uid.as_raw()))
    }

    fn matches(&self, field: &str) -> bool {
        field == self.name || field.parse::<u32>().is_ok_and(|uid| uid == self.uid)
    }
}

/// Immutable uid/gid mapping handed to container creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    uid: IdRange,
    gid: IdRange,
}

impl IdMap {
    /// Builds a mapping from explicit ranges.
    ///
    /// # Errors
    ///
    /// Returns `IdMapError::EmptyRange` if either range has zero length.
    pub fn new(uid: IdRange, gid: IdRange) -> Result<Self, IdMapError> {
        if uid.length == 0 {
            return Err(IdMapError::EmptyRange {
                kind: "uid",
                start: uid.start,
            });
        }
        if gid.length == 0 {
            return Err(IdMapError::EmptyRange {
                kind: "gid",
                start: gid.start,
            });
        }
        Ok(Self { uid, gid })
    }

    /// Resolves the ranges of `owner` from the system tables.
    pub fn resolve(owner: &IdOwner) -> Result<Self, IdMapError> {
        Self::resolve_from(
            Path::new(DEFAULT_SUBUID_PATH),
            Path::new(DEFAULT_SUBGID_PATH),
            owner,
        )
    }

    /// Resolves the ranges of `owner` from the given tables.
    ///
    /// # Errors
    ///
    /// - `IdMapError::Io` if a table cannot be read
    /// - `IdMapError::NoRangeAssigned` if a table has no usable entry for the owner
    pub fn resolve_from(
        subuid: &Path,
        subgid: &Path,
        owner: &IdOwner,
    ) -> Result<Self, IdMapError> {
        let uid = read_table(subuid, owner)?;
        let gid = read_table(subgid, owner)?;
        debug!(user = %owner.name, uid = %uid, gid = %gid, "Resolved ID map");
        Self::new(uid, gid)
    }

    pub fn uid_min(&self) -> u32 {
        self.uid.start
    }

    pub fn uid_range(&self) -> u32 {
        self.uid.length
    }

    pub fn gid_min(&self) -> u32 {
        self.gid.start
    }

    pub fn gid_range(&self) -> u32 {
        self.gid.length
    }
}

fn read_table(path: &Path, owner: &IdOwner) -> Result<IdRange, IdMapError> {
    let contents = fs::read_to_string(path).map_err(|source| IdMapError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    find_range(&contents, owner).ok_or_else(|| IdMapError::NoRangeAssigned {
        path: path.to_path_buf(),
        user: owner.name.clone(),
    })
}

/// Returns the first usable range of `owner` in a table.
///
/// Lines with malformed numbers or an empty range are skipped.
fn find_range(table: &str, owner: &IdOwner) -> Option<IdRange> {
    table.lines().find_map(|line| {
        let mut fields = line.trim().split(':');
        let who = fields.next()?;
        if !owner.matches(who) {
            return None;
        }
        let start = fields.next()?.trim().parse::<u32>();
        let length = fields.next()?.trim().parse::<u32>();
        match (start, length) {
            (Ok(start), Ok(length)) => {
                let range = IdRange::new(start, length);
                if range.is_usable() {
                    Some(range)
                } else {
                    trace!(line, "Skipping unusable range");
                    None
                }
            }
            _ => {
                trace!(line, "Skipping malformed range");
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn owner() -> IdOwner {
        IdOwner::new("alice", 1000)
    }

    #[test]
    fn test_find_range_first_match_wins() {
        let table = "bob:100000:65536\nalice:165536:65536\nalice:231072:1000\n";
        let range = find_range(table, &owner()).unwrap();
        assert_eq!(range, IdRange::new(165536, 65536));
    }

    #[test]
    fn test_find_range_skips_malformed_line() {
        let table = "alice:abc:65536\nalice:165536:\nalice:200000:5000\n";
        let range = find_range(table, &owner()).unwrap();
        assert_eq!(range, IdRange::new(200000, 5000));
    }

    #[test]
    fn test_find_range_skips_zero_length() {
        let table = "alice:100000:0\nalice:300000:10\n";
        assert_eq!(find_range(table, &owner()), Some(IdRange::new(300000, 10)));
    }

    #[test]
    fn test_find_range_is_case_sensitive() {
        assert_eq!(find_range("ALICE:100000:65536\n", &owner()), None);
    }

    #[test]
    fn test_find_range_accepts_numeric_owner() {
        let table = "1000:400000:65536\n";
        assert_eq!(find_range(table, &owner()), Some(IdRange::new(400000, 65536)));
    }

    #[test]
    fn test_find_range_rejects_overflow() {
        assert_eq!(find_range("alice:4294967295:2\n", &owner()), None);
    }

    #[test]
    fn test_new_rejects_empty_range() {
        let err = IdMap::new(IdRange::new(100000, 0), IdRange::new(100000, 65536)).unwrap_err();
        assert!(matches!(err, IdMapError::EmptyRange { kind: "uid", .. }));
    }

    #[test]
    fn test_resolve_from_tables() {
        let dir = tempfile::tempdir().unwrap();
        let subuid = dir.path().join("subuid");
        let subgid = dir.path().join("subgid");
        fs::File::create(&subuid)
            .unwrap()
            .write_all(b"alice:100000:65536\n")
            .unwrap();
        fs::File::create(&subgid)
            .unwrap()
            .write_all(b"alice:200000:1000\n")
            .unwrap();

        let map = IdMap::resolve_from(&subuid, &subgid, &owner()).unwrap();
        assert_eq!(map.uid_min(), 100000);
        assert_eq!(map.uid_range(), 65536);
        assert_eq!(map.gid_min(), 200000);
        assert_eq!(map.gid_range(), 1000);
    }

    #[test]
    fn test_resolve_from_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let subuid = dir.path().join("subuid");
        let subgid = dir.path().join("subgid");
        fs::write(&subuid, "alice:100000:65536\n").unwrap();
        fs::write(&subgid, "bob:100000:65536\n").unwrap();

        let err = IdMap::resolve_from(&subuid, &subgid, &owner()).unwrap_err();
        match err {
            IdMapError::NoRangeAssigned { path, user } => {
                assert_eq!(path, subgid);
                assert_eq!(user, "alice");
            }
            other => panic!("Expected NoRangeAssigned, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_from_unreadable_table() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = IdMap::resolve_from(&missing, &missing, &owner()).unwrap_err();
        assert!(matches!(err, IdMapError::Io { .. }));
        assert!(err.to_string().contains("nope"));
    }
}
