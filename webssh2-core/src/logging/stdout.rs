use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::LogError;

/// Non-blocking stdout writer. Lines queue up to `max_queue_size`; a
/// single drain task preserves publication order across backpressure
/// recovery. Overflow surfaces as [`LogError::Backpressure`].
pub struct StdoutTransport {
    tx: mpsc::Sender<String>,
    max_queue_size: usize,
    dropped: Arc<AtomicU64>,
}

impl StdoutTransport {
    pub fn start(max_queue_size: usize) -> Self {
        Self::start_with_writer(max_queue_size, tokio::io::stdout())
    }

    pub fn start_with_writer<W>(max_queue_size: usize, mut writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(max_queue_size.max(1));
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
            }
            let _ = writer.flush().await;
        });
        Self {
            tx,
            max_queue_size,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn enqueue(&self, line: String) -> Result<(), LogError> {
        match self.tx.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(LogError::Backpressure(self.max_queue_size))
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_lines_written_in_order() {
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let transport = StdoutTransport::start_with_writer(100, writer);
        for i in 0..50 {
            transport.enqueue(format!("line-{i}")).unwrap();
        }
        drop(transport);

        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        let lines: Vec<&str> = buf.lines().collect();
        assert_eq!(lines.len(), 50);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("line-{i}"));
        }
    }

    #[tokio::test]
    async fn test_overflow_returns_backpressure_error() {
        // A 1-byte pipe nobody reads: the drain task wedges on the first
        // line and the queue fills behind it.
        let (writer, _reader) = tokio::io::duplex(1);
        let transport = StdoutTransport::start_with_writer(4, writer);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut saw_backpressure = false;
        for i in 0..16 {
            if let Err(LogError::Backpressure(size)) = transport.enqueue(format!("entry-{i}")) {
                assert_eq!(size, 4);
                saw_backpressure = true;
            }
        }
        assert!(saw_backpressure);
        assert!(transport.dropped_count() > 0);
    }
}
