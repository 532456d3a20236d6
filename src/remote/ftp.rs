//! FTP-backed `RemoteSession`. Prefers machine-readable `MLSD` listings and
//! falls back to parsing classic `LIST` output (both Unix and Windows
//! flavors) when the server doesn't support it, mirroring the dual-path
//! listing logic this gateway's predecessor used.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use suppaftp::{FileType, FtpStream, Mode};

use crate::error::{PermError, RemoteOpError, TransportError};
use crate::model::ConnectionParams;
use crate::remote::{EntryKind, RemoteEntry, RemoteSession};

pub struct FtpSession {
    stream: FtpStream,
}

impl FtpSession {
    pub fn connect(params: &ConnectionParams) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", params.host, params.port);
        let mut stream =
            FtpStream::connect(&addr).map_err(|_| TransportError::Connect(addr.clone()))?;
        stream
            .login(&params.user, &params.password)
            .map_err(|_| TransportError::Auth(addr.clone()))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|_| TransportError::Handshake(addr.clone()))?;
        stream.set_mode(if params.passive { Mode::Passive } else { Mode::Active });
        Ok(FtpSession { stream })
    }
}

impl RemoteSession for FtpSession {
    fn disconnect(&mut self) {
        let _ = self.stream.quit();
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<(), RemoteOpError> {
        let data = fs::read(local)
            .map_err(|e| RemoteOpError::new(local.display().to_string(), e.to_string()))?;
        let mut reader = Cursor::new(data);
        if self.stream.put_file(remote, &mut reader).is_err() {
            // retry once: ensure the parent directory exists, then STOR again
            // by basename after cwd'ing into it, matching the single-retry
            // discipline used for SCP uploads.
            if let Some(parent) = Path::new(remote).parent().and_then(|p| p.to_str()) {
                if !parent.is_empty() {
                    let _ = self.ensure_remote_dir(parent);
                    let _ = self.stream.cwd(parent);
                }
            }
            let basename = Path::new(remote)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(remote);
            reader.set_position(0);
            self.stream
                .put_file(basename, &mut reader)
                .map_err(|e| RemoteOpError::new(remote.to_string(), e.to_string()))?;
        }
        Ok(())
    }

    fn download_file(&mut self, remote: &str, local: &Path) -> Result<(), RemoteOpError> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RemoteOpError::new(local.display().to_string(), e.to_string()))?;
        }
        let mut cursor = self
            .stream
            .retr_as_buffer(remote)
            .map_err(|e| RemoteOpError::new(remote.to_string(), e.to_string()))?;
        fs::write(local, cursor.get_mut())
            .map_err(|e| RemoteOpError::new(local.display().to_string(), e.to_string()))?;
        Ok(())
    }

    fn ensure_remote_dir(&mut self, remote_dir: &str) -> Result<(), RemoteOpError> {
        let mut cur = String::new();
        for part in remote_dir.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
            cur = if cur.is_empty() { format!("/{part}") } else { format!("{cur}/{part}") };
            // best-effort: mkd failing almost always means the directory
            // already exists, which is not an error for our purposes.
            let _ = self.stream.mkdir(&cur);
        }
        Ok(())
    }

    fn list_remote(&mut self, remote_dir: &str) -> Result<Vec<RemoteEntry>, RemoteOpError> {
        let lines = match self.stream.mlsd(Some(remote_dir)) {
            Ok(lines) => lines,
            Err(_) => self
                .stream
                .list(Some(remote_dir))
                .map_err(|e| RemoteOpError::new(remote_dir.to_string(), e.to_string()))?,
        };
        let mut out = Vec::new();
        for line in lines {
            if let Some(entry) = parse_listing_line(&line, remote_dir) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn delete_file(&mut self, remote: &str) -> Result<(), PermError> {
        self.stream
            .rm(remote)
            .map_err(|e| PermError { path: remote.to_string(), reason: e.to_string() })
    }

    fn delete_path(&mut self, remote: &str) -> Result<(), PermError> {
        let entries = match self.list_remote(remote) {
            Ok(e) => e,
            Err(e) => return Err(PermError { path: remote.to_string(), reason: e.to_string() }),
        };
        let mut failed = false;
        for entry in entries {
            let result = match entry.kind {
                EntryKind::Directory => self.delete_path(&entry.path),
                EntryKind::File => self.delete_file(&entry.path),
            };
            if result.is_err() {
                failed = true;
            }
        }
        if failed {
            return Err(PermError {
                path: remote.to_string(),
                reason: "one or more children failed to delete".to_string(),
            });
        }
        self.stream
            .rmdir(remote)
            .map_err(|e| PermError { path: remote.to_string(), reason: e.to_string() })
    }
}

/// Parses one line of either an MLSD fact listing (`type=file;size=123; name`)
/// or a classic Unix/Windows `LIST` listing, returning `None` for `.`/`..`
/// or unparsable lines. Hidden (dot-prefixed) names are excluded.
fn parse_listing_line(line: &str, remote_dir: &str) -> Option<RemoteEntry> {
    if line.contains("type=") && line.contains(';') {
        return parse_mlsd_line(line, remote_dir);
    }
    parse_unix_list_line(line, remote_dir).or_else(|| parse_windows_list_line(line, remote_dir))
}

fn parse_mlsd_line(line: &str, remote_dir: &str) -> Option<RemoteEntry> {
    let (facts, name) = line.rsplit_once(' ')?;
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." || name.starts_with('.') {
        return None;
    }
    let mut kind = EntryKind::File;
    let mut size = None;
    for fact in facts.split(';') {
        let Some((key, value)) = fact.split_once('=') else { continue };
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                kind = if value.eq_ignore_ascii_case("dir") || value.eq_ignore_ascii_case("cdir") {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
            }
            "size" => size = value.parse().ok(),
            _ => {}
        }
    }
    Some(RemoteEntry {
        path: format!("{}/{}", remote_dir.trim_end_matches('/'), name),
        name: name.to_string(),
        kind,
        size,
    })
}

fn parse_unix_list_line(line: &str, remote_dir: &str) -> Option<RemoteEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let perms = fields[0];
    let is_dir = perms.starts_with('d');
    let size: Option<u64> = fields[4].parse().ok();
    let name = fields[8..].join(" ");
    if name.is_empty() || name == "." || name == ".." || name.starts_with('.') {
        return None;
    }
    Some(RemoteEntry {
        path: format!("{}/{}", remote_dir.trim_end_matches('/'), name),
        name,
        kind: if is_dir { EntryKind::Directory } else { EntryKind::File },
        size,
    })
}

fn parse_windows_list_line(line: &str, remote_dir: &str) -> Option<RemoteEntry> {
    // MM-DD-YY  HH:MMAM/PM  <DIR>          name
    // MM-DD-YY  HH:MMAM/PM      12345      name
    let fields: Vec<&str> = line.splitn(4, char::is_whitespace).collect();
    if fields.len() < 4 {
        return None;
    }
    let rest = fields[3].trim_start();
    let (marker, name) = rest.split_once(char::is_whitespace)?;
    let name = name.trim();
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    let (kind, size) = if marker.eq_ignore_ascii_case("<DIR>") {
        (EntryKind::Directory, None)
    } else {
        (EntryKind::File, marker.parse().ok())
    };
    Some(RemoteEntry {
        path: format!("{}/{}", remote_dir.trim_end_matches('/'), name),
        name: name.to_string(),
        kind,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mlsd_line() {
        let entry = parse_listing_line("type=file;size=42;modify=20240101000000; a.bin", "/srv")
            .expect("parsed");
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, Some(42));
        assert_eq!(entry.path, "/srv/a.bin");
    }

    #[test]
    fn parses_unix_list_line_directory() {
        let entry = parse_listing_line(
            "drwxr-xr-x  2 user group 4096 Jan  1 00:00 sub",
            "/srv",
        )
        .expect("parsed");
        assert_eq!(entry.kind, EntryKind::Directory);
        assert_eq!(entry.name, "sub");
    }

    #[test]
    fn skips_hidden_and_dot_entries() {
        assert!(parse_listing_line(
            "drwxr-xr-x  2 user group 4096 Jan  1 00:00 .",
            "/srv"
        )
        .is_none());
        assert!(parse_listing_line(
            "-rw-r--r--  1 user group 4 Jan  1 00:00 .hidden",
            "/srv"
        )
        .is_none());
    }

    #[test]
    fn parses_windows_list_line() {
        let entry =
            parse_listing_line("01-01-24  12:00AM       <DIR>          sub", "/srv").unwrap();
        assert_eq!(entry.kind, EntryKind::Directory);
        assert_eq!(entry.name, "sub");
    }
}
