//! One-directional byte copy that honours a cancellation signal

use crate::error::{ProxyError, Result};
use crate::session::StreamCloser;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Chunk size for relaying
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Copy from `reader` to `writer` until EOF, an error, or cancellation
///
/// `cancel` is checked before every read, so an already running read is not
/// interrupted by it. Closing `closer` is what aborts a read or write that
/// is in flight. Returns the bytes copied together with the outcome; a clean
/// EOF is `Ok(())`.
pub async fn copy_with_cancel<R, W>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
    closer: &StreamCloser,
) -> (u64, Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return (total, Err(ProxyError::Cancelled));
        }

        let n = match closer.guard(reader.read(&mut buffer)).await {
            Ok(0) => return (total, Ok(())),
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };

        let chunk = &buffer[..n];
        let written = closer
            .guard(async {
                writer.write_all(chunk).await?;
                writer.flush().await
            })
            .await;
        if let Err(e) = written {
            return (total, Err(e));
        }

        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_copies_until_eof() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = data.as_slice();
        let mut out = Vec::new();

        let (bytes, result) = copy_with_cancel(
            &mut reader,
            &mut out,
            &CancellationToken::new(),
            &StreamCloser::new(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_cancelled_before_read() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut reader: &[u8] = b"never read";
        let mut out = Vec::new();
        let (bytes, result) =
            copy_with_cancel(&mut reader, &mut out, &cancel, &StreamCloser::new()).await;

        assert_eq!(bytes, 0);
        assert!(matches!(result, Err(ProxyError::Cancelled)));
        assert!(out.is_empty());
        assert_eq!(reader, b"never read");
    }

    #[tokio::test]
    async fn test_close_aborts_blocked_read() {
        let (_peer, stream) = tokio::io::duplex(64);
        let (mut reader, _writer) = tokio::io::split(stream);
        let closer = StreamCloser::new();

        let task = {
            let closer = closer.clone();
            tokio::spawn(async move {
                let mut out = Vec::new();
                copy_with_cancel(&mut reader, &mut out, &CancellationToken::new(), &closer).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        closer.close();
        let (bytes, result) = task.await.unwrap();
        assert_eq!(bytes, 0);
        assert!(matches!(result, Err(ProxyError::Closed)));
    }

    #[tokio::test]
    async fn test_cancel_is_cooperative() {
        let (mut peer, stream) = tokio::io::duplex(64);
        let (mut reader, _writer) = tokio::io::split(stream);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut out = Vec::new();
                let outcome =
                    copy_with_cancel(&mut reader, &mut out, &cancel, &StreamCloser::new()).await;
                (outcome, out)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        // The read already in progress still completes.
        peer.write_all(b"late").await.unwrap();

        let ((bytes, result), out) = task.await.unwrap();
        assert_eq!(bytes, 4);
        assert_eq!(out, b"late");
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }
}
