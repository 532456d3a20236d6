//! Remote transport capability shared by the FTP and SCP/SFTP backends.
//!
//! A `RemoteSession` is a single authenticated connection to one peripheral.
//! It is intentionally expressed as a trait object rather than an enum with
//! shared base behavior: the two backends share almost no code below the
//! path-handling helpers in this module, and a tagged variant selected once
//! at construction time (see `open`) is all the polymorphism this needs.

pub mod ftp;
pub mod scp;

use std::path::Path;

use crate::error::{PermError, RemoteOpError, TransportError};
use crate::model::{ConnectionParams, Protocol};

/// One entry returned by `list_remote`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Capability set a peripheral worker needs from its remote connection.
/// Implemented by `ftp::FtpSession` and `scp::ScpSession`.
pub trait RemoteSession: Send {
    fn disconnect(&mut self);

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<(), RemoteOpError>;
    fn download_file(&mut self, remote: &str, local: &Path) -> Result<(), RemoteOpError>;

    /// Ensures `remote_dir` exists, creating missing path segments. Best
    /// effort: an error creating an already-existing segment is swallowed,
    /// matching the source system's per-segment "ignore if it already
    /// exists" mkdir discipline.
    fn ensure_remote_dir(&mut self, remote_dir: &str) -> Result<(), RemoteOpError>;

    fn list_remote(&mut self, remote_dir: &str) -> Result<Vec<RemoteEntry>, RemoteOpError>;

    fn delete_file(&mut self, remote: &str) -> Result<(), PermError>;

    /// Deletes a remote directory tree. Attempts continue past individual
    /// failures; the returned error (if any) reflects whether the overall
    /// deletion succeeded.
    fn delete_path(&mut self, remote: &str) -> Result<(), PermError>;
}

/// Opens a session for `params`, dispatching to the backend named by
/// `params.protocol`. This is the one place the tagged-variant selection
/// happens; everything above this layer only sees `dyn RemoteSession`.
pub fn open(params: &ConnectionParams) -> Result<Box<dyn RemoteSession>, TransportError> {
    match params.protocol {
        Protocol::Ftp => Ok(Box::new(ftp::FtpSession::connect(params)?)),
        Protocol::Scp => Ok(Box::new(scp::ScpSession::connect(params)?)),
    }
}

/// Normalizes a remote path: backslashes become forward slashes, repeated
/// slashes collapse to one, and a trailing slash is stripped unless the
/// whole path is the root `/`. Idempotent.
pub fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut collapsed = String::with_capacity(unified.len());
    let mut last_was_slash = false;
    for c in unified.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        collapsed.push(c);
    }
    if collapsed.len() > 1 && collapsed.ends_with('/') {
        collapsed.pop();
    }
    collapsed
}

/// Joins a normalized `base` and `part`, stripping the trailing slash from
/// `base` and the leading slash from `part`, then concatenating with a
/// single `/`. An empty `base` yields a root-prefixed result.
pub fn join(base: &str, part: &str) -> String {
    let base = normalize(base);
    let part = normalize(part);
    let base_trimmed = base.trim_end_matches('/');
    let part_trimmed = part.trim_start_matches('/');
    if base_trimmed.is_empty() {
        format!("/{part_trimmed}")
    } else if part_trimmed.is_empty() {
        base_trimmed.to_string()
    } else {
        format!("{base_trimmed}/{part_trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_converts_backslashes_and_collapses_slashes() {
        assert_eq!(normalize(r"a\\b//c\\\\d"), "a/b/c/d");
    }

    #[test]
    fn normalize_strips_trailing_slash_except_root() {
        assert_eq!(normalize("/a/b/"), "/a/b");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn normalize_is_idempotent() {
        for p in ["/a/b/", r"a\\b//c", "/", "a"] {
            let once = normalize(p);
            let twice = normalize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn join_handles_empty_base() {
        assert_eq!(join("", "sub/a.bin"), "/sub/a.bin");
    }

    #[test]
    fn join_strips_duplicate_slash_at_seam() {
        assert_eq!(join("/srv/", "/sub/a.bin"), "/srv/sub/a.bin");
        assert_eq!(join("/srv", "sub/a.bin"), "/srv/sub/a.bin");
    }

    #[test]
    fn join_result_ends_with_normalized_part() {
        let joined = join("/srv", "sub//a.bin");
        assert!(joined.ends_with(&normalize("sub//a.bin")));
    }
}
