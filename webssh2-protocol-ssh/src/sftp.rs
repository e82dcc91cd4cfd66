//! Remote-side SFTP operations over an opened `sftp` subsystem channel.
//! The WebSocket-facing transfer state machines live in the socket
//! adapter; this layer only talks to the server.

use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use webssh2_common::Webssh2Error;

use crate::client::SshClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SftpEntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One directory entry / stat result as sent to the browser.
#[derive(Debug, Clone, Serialize)]
pub struct SftpEntry {
    pub name: String,
    pub path: String,
    pub kind: SftpEntryKind,
    pub size: u64,
    pub modified: Option<i64>,
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

pub struct SftpService {
    session: SftpSession,
}

fn validate_path(path: &str) -> Result<(), Webssh2Error> {
    if path.is_empty() {
        return Err(Webssh2Error::Validation("path must not be empty".into()));
    }
    if path.contains('\0') {
        return Err(Webssh2Error::Validation(
            "path contains a null byte".into(),
        ));
    }
    Ok(())
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

impl SftpService {
    pub fn new(session: SftpSession) -> Self {
        Self { session }
    }

    pub async fn list(&self, path: &str) -> Result<Vec<SftpEntry>, SshClientError> {
        validate_path(path)?;
        let read_dir = self.session.read_dir(path).await?;

        let mut entries = vec![];
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let metadata = entry.metadata();
            let kind = if metadata.is_dir() {
                SftpEntryKind::Directory
            } else if metadata.is_symlink() {
                SftpEntryKind::Symlink
            } else if metadata.is_regular() {
                SftpEntryKind::File
            } else {
                SftpEntryKind::Other
            };
            entries.push(SftpEntry {
                path: join_path(path, &name),
                name,
                kind,
                size: metadata.size.unwrap_or(0),
                modified: metadata.mtime.map(|t| t as i64),
                permissions: metadata.permissions,
                uid: metadata.uid,
                gid: metadata.gid,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> Result<SftpEntry, SshClientError> {
        validate_path(path)?;
        let metadata = self.session.metadata(path).await?;
        let kind = if metadata.is_dir() {
            SftpEntryKind::Directory
        } else if metadata.is_symlink() {
            SftpEntryKind::Symlink
        } else if metadata.is_regular() {
            SftpEntryKind::File
        } else {
            SftpEntryKind::Other
        };
        let name = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(path)
            .to_string();
        Ok(SftpEntry {
            name,
            path: path.to_string(),
            kind,
            size: metadata.size.unwrap_or(0),
            modified: metadata.mtime.map(|t| t as i64),
            permissions: metadata.permissions,
            uid: metadata.uid,
            gid: metadata.gid,
        })
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), SshClientError> {
        validate_path(path)?;
        self.session.create_dir(path).await?;
        Ok(())
    }

    /// Removes a file, or an (empty) directory.
    pub async fn remove(&self, path: &str) -> Result<(), SshClientError> {
        validate_path(path)?;
        let metadata = self.session.metadata(path).await?;
        if metadata.is_dir() {
            self.session.remove_dir(path).await?;
        } else {
            self.session.remove_file(path).await?;
        }
        Ok(())
    }

    /// Opens a remote file for a chunked download; returns the handle and
    /// its size.
    pub async fn open_read(&self, path: &str) -> Result<(File, u64), SshClientError> {
        validate_path(path)?;
        let size = self.session.metadata(path).await?.size.unwrap_or(0);
        let file = self.session.open(path).await?;
        Ok((file, size))
    }

    /// Opens (creating) a remote file for a chunked upload.
    pub async fn open_write(&self, path: &str, overwrite: bool) -> Result<File, SshClientError> {
        validate_path(path)?;
        if !overwrite && self.session.metadata(path).await.is_ok() {
            return Err(SshClientError::Webssh2(Webssh2Error::Validation(format!(
                "remote file already exists: {path}"
            ))));
        }
        let file = self
            .session
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await?;
        Ok(file)
    }

    /// Reads up to `chunk_size` bytes; `None` at end of file.
    pub async fn read_chunk(
        file: &mut File,
        chunk_size: usize,
    ) -> Result<Option<Vec<u8>>, SshClientError> {
        let mut buffer = vec![0u8; chunk_size];
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| SshClientError::other(e))?;
        if n == 0 {
            return Ok(None);
        }
        buffer.truncate(n);
        Ok(Some(buffer))
    }

    pub async fn close(self) -> Result<(), SshClientError> {
        self.session.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_validation() {
        assert!(validate_path("/home/user").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/tmp/\0evil").is_err());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/home", "f.txt"), "/home/f.txt");
        assert_eq!(join_path("/home/", "f.txt"), "/home/f.txt");
    }
}
