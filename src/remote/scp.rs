//! SSH/SFTP-backed `RemoteSession`, grounded on the session-management and
//! SFTP-adapter pattern this crate's transfer layer already used for
//! one-shot CLI copies, now driven persistently by a peripheral worker.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use crate::error::{PermError, RemoteOpError, TransportError};
use crate::model::ConnectionParams;
use crate::remote::{EntryKind, RemoteEntry, RemoteSession};

pub struct ScpSession {
    session: ssh2::Session,
    addr: String,
}

impl ScpSession {
    pub fn connect(params: &ConnectionParams) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", params.host, params.port);
        let tcp = TcpStream::connect(&addr).map_err(|_| TransportError::Connect(addr.clone()))?;
        tcp.set_read_timeout(Some(Duration::from_secs(params.timeout)))
            .map_err(|_| TransportError::Connect(addr.clone()))?;
        tcp.set_write_timeout(Some(Duration::from_secs(params.timeout)))
            .map_err(|_| TransportError::Connect(addr.clone()))?;

        let mut session =
            ssh2::Session::new().map_err(|_| TransportError::Connect(addr.clone()))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|_| TransportError::Handshake(addr.clone()))?;

        try_authenticate(&mut session, params).map_err(|_| TransportError::Auth(addr.clone()))?;

        Ok(ScpSession { session, addr })
    }

    fn sftp(&self) -> Result<ssh2::Sftp, RemoteOpError> {
        self.session
            .sftp()
            .map_err(|e| RemoteOpError::new(self.addr.clone(), format!("sftp channel: {e}")))
    }
}

/// Tries key-based authentication first (id_ed25519, id_rsa, id_ecdsa, in
/// that order), falling back to password authentication when a password was
/// configured and no key succeeded.
fn try_authenticate(session: &mut ssh2::Session, params: &ConnectionParams) -> Result<(), ()> {
    if let Some(home) = dirs::home_dir() {
        for key_name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
            let key_path = home.join(".ssh").join(key_name);
            if key_path.exists()
                && session
                    .userauth_pubkey_file(&params.user, None, &key_path, None)
                    .is_ok()
            {
                return Ok(());
            }
        }
    }
    if !params.password.is_empty()
        && session.userauth_password(&params.user, &params.password).is_ok()
    {
        return Ok(());
    }
    Err(())
}

impl RemoteSession for ScpSession {
    fn disconnect(&mut self) {
        let _ = self.session.disconnect(None, "bye", None);
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<(), RemoteOpError> {
        let sftp = self.sftp()?;
        let mut data = Vec::new();
        fs::File::open(local)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(|e| RemoteOpError::new(local.display().to_string(), e.to_string()))?;

        let write_once = |sftp: &ssh2::Sftp| -> Result<(), ssh2::Error> {
            let mut remote_file = sftp.create(Path::new(remote))?;
            remote_file.write_all(&data).map_err(ssh2::Error::from)?;
            Ok(())
        };

        if write_once(&sftp).is_err() {
            // retry once after ensuring the parent directory exists, mirroring
            // the single-retry discipline the FTP backend also follows.
            if let Some(parent) = Path::new(remote).parent().and_then(|p| p.to_str()) {
                let _ = self.ensure_remote_dir(parent);
            }
            let sftp = self.sftp()?;
            write_once(&sftp)
                .map_err(|e| RemoteOpError::new(remote.to_string(), e.to_string()))?;
        }
        Ok(())
    }

    fn download_file(&mut self, remote: &str, local: &Path) -> Result<(), RemoteOpError> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RemoteOpError::new(local.display().to_string(), e.to_string()))?;
        }
        let sftp = self.sftp()?;
        let mut remote_file = sftp
            .open(Path::new(remote))
            .map_err(|e| RemoteOpError::new(remote.to_string(), e.to_string()))?;
        let mut buf = Vec::new();
        remote_file
            .read_to_end(&mut buf)
            .map_err(|e| RemoteOpError::new(remote.to_string(), e.to_string()))?;
        fs::write(local, buf)
            .map_err(|e| RemoteOpError::new(local.display().to_string(), e.to_string()))?;
        Ok(())
    }

    fn ensure_remote_dir(&mut self, remote_dir: &str) -> Result<(), RemoteOpError> {
        let sftp = self.sftp()?;
        let mut cur = String::new();
        for part in remote_dir.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
            cur = if cur.is_empty() { format!("/{part}") } else { format!("{cur}/{part}") };
            if sftp.mkdir(Path::new(&cur), 0o755).is_err() {
                // directory probably exists already; only treat it as fatal
                // if stat also fails.
                if sftp.stat(Path::new(&cur)).is_err() {
                    return Err(RemoteOpError::new(cur.clone(), "mkdir failed".to_string()));
                }
            }
        }
        Ok(())
    }

    fn list_remote(&mut self, remote_dir: &str) -> Result<Vec<RemoteEntry>, RemoteOpError> {
        let sftp = self.sftp()?;
        let entries = sftp
            .readdir(Path::new(remote_dir))
            .map_err(|e| RemoteOpError::new(remote_dir.to_string(), e.to_string()))?;
        let mut out = Vec::new();
        for (path, stat) in entries {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) if !n.starts_with('.') => n.to_string(),
                _ => continue,
            };
            let kind = if stat.is_dir() { EntryKind::Directory } else { EntryKind::File };
            out.push(RemoteEntry {
                path: format!("{}/{}", remote_dir.trim_end_matches('/'), name),
                name,
                kind,
                size: stat.size,
            });
        }
        Ok(out)
    }

    fn delete_file(&mut self, remote: &str) -> Result<(), PermError> {
        let sftp = self
            .sftp()
            .map_err(|e| PermError { path: remote.to_string(), reason: e.to_string() })?;
        sftp.unlink(Path::new(remote))
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
        let sftp = self
            .sftp()
            .map_err(|e| PermError { path: remote.to_string(), reason: e.to_string() })?;
        sftp.rmdir(Path::new(remote))
            .map_err(|e| PermError { path: remote.to_string(), reason: e.to_string() })
    }
}
