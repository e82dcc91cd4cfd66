//! Upload/download state machines between the WebSocket protocol and the
//! remote SFTP service. Transfer ids are always server-generated; chunk
//! sequence numbers must arrive in order; downloads honor outbound
//! backpressure by awaiting capacity on the bounded frame queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use data_encoding::BASE64;
use russh_sftp::client::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::*;
use uuid::Uuid;
use webssh2_common::consts::SFTP_CHUNK_SIZE;
use webssh2_protocol_ssh::sftp::SftpService;

use super::messages::{ServerMessage, SftpProgressPayload};

const PROGRESS_EVERY_CHUNKS: u64 = 32;

struct UploadTransfer {
    file: File,
    path: String,
    expected_seq: u64,
    bytes: u64,
    total: u64,
}

pub struct SftpSubsystem {
    service: SftpService,
    uploads: HashMap<Uuid, UploadTransfer>,
    downloads: HashMap<Uuid, Arc<AtomicBool>>,
    max_file_size: u64,
}

impl SftpSubsystem {
    pub fn new(service: SftpService, max_file_size: u64) -> Self {
        Self {
            service,
            uploads: HashMap::new(),
            downloads: HashMap::new(),
            max_file_size,
        }
    }

    pub fn service(&self) -> &SftpService {
        &self.service
    }

    /// Starts an upload: opens the remote file and hands the client its
    /// transfer id and chunk size.
    pub async fn begin_upload(
        &mut self,
        remote_path: &str,
        file_name: &str,
        file_size: u64,
        overwrite: bool,
    ) -> Result<ServerMessage, String> {
        if file_size > self.max_file_size {
            return Err(format!(
                "file size {file_size} exceeds the {} byte limit",
                self.max_file_size
            ));
        }
        let path = if remote_path.ends_with('/') {
            format!("{remote_path}{file_name}")
        } else {
            format!("{remote_path}/{file_name}")
        };
        let file = self
            .service
            .open_write(&path, overwrite)
            .await
            .map_err(|e| e.to_string())?;

        let transfer_id = Uuid::new_v4();
        self.uploads.insert(
            transfer_id,
            UploadTransfer {
                file,
                path,
                expected_seq: 0,
                bytes: 0,
                total: file_size,
            },
        );
        Ok(ServerMessage::SftpUploadReady {
            transfer_id,
            chunk_size: SFTP_CHUNK_SIZE,
        })
    }

    /// Applies one upload chunk. Returns the frames to emit (ack, maybe
    /// progress, maybe complete).
    pub async fn upload_chunk(
        &mut self,
        transfer_id: Uuid,
        seq: u64,
        data_base64: &str,
    ) -> Result<Vec<ServerMessage>, String> {
        let (expected_seq, bytes_so_far, total, path) = {
            let transfer = self
                .uploads
                .get(&transfer_id)
                .ok_or_else(|| format!("unknown transfer {transfer_id}"))?;
            (
                transfer.expected_seq,
                transfer.bytes,
                transfer.total,
                transfer.path.clone(),
            )
        };

        if seq != expected_seq {
            self.abort_upload(transfer_id).await;
            return Err(format!(
                "out-of-order chunk {seq} (expected {expected_seq})"
            ));
        }

        let chunk = BASE64
            .decode(data_base64.as_bytes())
            .map_err(|e| format!("chunk {seq} is not valid base64: {e}"))?;

        if bytes_so_far + chunk.len() as u64 > total {
            self.abort_upload(transfer_id).await;
            return Err(format!("upload to {path} exceeds its declared size"));
        }

        let transfer = self
            .uploads
            .get_mut(&transfer_id)
            .ok_or_else(|| format!("unknown transfer {transfer_id}"))?;
        transfer
            .file
            .write_all(&chunk)
            .await
            .map_err(|e| format!("remote write failed: {e}"))?;
        transfer.expected_seq += 1;
        transfer.bytes += chunk.len() as u64;

        let mut frames = vec![ServerMessage::SftpUploadAck { transfer_id, seq }];
        if transfer.expected_seq % PROGRESS_EVERY_CHUNKS == 0 {
            frames.push(ServerMessage::SftpProgress(SftpProgressPayload {
                transfer_id,
                bytes: transfer.bytes,
                total: transfer.total,
            }));
        }

        if transfer.bytes >= transfer.total {
            if let Some(mut transfer) = self.uploads.remove(&transfer_id) {
                transfer
                    .file
                    .flush()
                    .await
                    .map_err(|e| format!("remote flush failed: {e}"))?;
                let _ = transfer.file.shutdown().await;
                info!(path=%transfer.path, bytes=transfer.bytes, "Upload complete");
                frames.push(ServerMessage::SftpComplete {
                    transfer_id,
                    bytes: transfer.bytes,
                });
            }
        }
        Ok(frames)
    }

    pub async fn abort_upload(&mut self, transfer_id: Uuid) {
        if let Some(mut transfer) = self.uploads.remove(&transfer_id) {
            let _ = transfer.file.shutdown().await;
            debug!(path=%transfer.path, "Upload aborted");
        }
    }

    /// Starts a download: announces size and mime type, then streams
    /// chunks from a task that blocks on the outbound queue when the
    /// socket cannot drain fast enough.
    pub async fn begin_download(
        &mut self,
        remote_path: &str,
        out: mpsc::Sender<ServerMessage>,
    ) -> Result<ServerMessage, String> {
        let (mut file, size) = self
            .service
            .open_read(remote_path)
            .await
            .map_err(|e| e.to_string())?;

        let transfer_id = Uuid::new_v4();
        let mime_type = mime_guess::from_path(remote_path)
            .first_or_octet_stream()
            .to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        self.downloads.insert(transfer_id, cancel.clone());

        tokio::spawn(async move {
            let mut seq = 0u64;
            let mut bytes = 0u64;
            loop {
                if cancel.load(Ordering::Relaxed) {
                    debug!(%transfer_id, "Download cancelled");
                    break;
                }
                match SftpService::read_chunk(&mut file, SFTP_CHUNK_SIZE).await {
                    Ok(Some(chunk)) => {
                        bytes += chunk.len() as u64;
                        let frame = ServerMessage::SftpDownloadChunk {
                            transfer_id,
                            seq,
                            data: BASE64.encode(&chunk),
                        };
                        // Backpressure: waits for room in the outbound
                        // queue instead of reading ahead.
                        if out.send(frame).await.is_err() {
                            break;
                        }
                        seq += 1;
                        if seq % PROGRESS_EVERY_CHUNKS == 0 {
                            let _ = out
                                .send(ServerMessage::SftpProgress(SftpProgressPayload {
                                    transfer_id,
                                    bytes,
                                    total: size,
                                }))
                                .await;
                        }
                    }
                    Ok(None) => {
                        let _ = out
                            .send(ServerMessage::SftpComplete { transfer_id, bytes })
                            .await;
                        break;
                    }
                    Err(error) => {
                        let _ = out
                            .send(ServerMessage::SftpError {
                                transfer_id: Some(transfer_id),
                                message: error.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(ServerMessage::SftpDownloadReady {
            transfer_id,
            size,
            mime_type,
        })
    }

    pub fn cancel_download(&mut self, transfer_id: Uuid) {
        if let Some(cancel) = self.downloads.remove(&transfer_id) {
            cancel.store(true, Ordering::Relaxed);
        }
    }

    /// Socket teardown: cancels every in-flight transfer.
    pub async fn cancel_all(&mut self) {
        for (_, cancel) in self.downloads.drain() {
            cancel.store(true, Ordering::Relaxed);
        }
        let ids: Vec<Uuid> = self.uploads.keys().copied().collect();
        for id in ids {
            self.abort_upload(id).await;
        }
    }
}
