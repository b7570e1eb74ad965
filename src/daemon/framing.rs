use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size. Oversize frames close the connection; the
/// length prefix alone never desynchronizes the stream.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Size of the big-endian length prefix.
const PREFIX_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    TooLarge(u32),

    #[error("stream ended mid-frame")]
    Truncated,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Write one `[u32 BE length][body]` frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered frame reader over a byte stream.
///
/// The internal buffer also absorbs bytes pulled in by
/// [`FrameReader::hangup_or_data`], so probing for client disconnect never
/// loses pipelined input.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read the next frame body. Returns `Ok(None)` on a clean end of
    /// stream at a frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if !self.fill(PREFIX_LEN).await? {
            return if self.buf.is_empty() {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }

        let total = PREFIX_LEN + len as usize;
        if !self.fill(total).await? {
            return Err(FrameError::Truncated);
        }

        let body = self.buf[PREFIX_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(body))
    }

    /// Wait for more bytes or end of stream. Returns `true` on hang-up;
    /// any data read is kept for the next [`Self::read_frame`].
    ///
    /// Used while a request is in flight so that a client disconnect
    /// cancels the work instead of computing a response nobody reads.
    pub async fn hangup_or_data(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match self.reader.read(&mut chunk).await {
            Ok(0) | Err(_) => true,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                false
            }
        }
    }

    /// Ensure at least `n` buffered bytes; `false` means EOF came first.
    async fn fill(&mut self, n: usize) -> Result<bool, FrameError> {
        let mut chunk = [0u8; 8192];
        while self.buf.len() < n {
            let read = self.reader.read(&mut chunk).await?;
            if read == 0 {
                return Ok(false);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips() {
        let body = br#"{"jsonrpc":"2.0","method":"ping","id":1}"#;
        let mut wire = Vec::new();
        write_frame(&mut wire, body).await.unwrap();
        assert_eq!(&wire[..4], &(body.len() as u32).to_be_bytes());

        let mut reader = FrameReader::new(wire.as_slice());
        let decoded = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(decoded, body);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multiple_frames_in_one_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").await.unwrap();
        write_frame(&mut wire, b"second").await.unwrap();

        let mut reader = FrameReader::new(wire.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"first");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"second");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn embedded_newlines_survive() {
        let body = b"{\"text\": \"line one\nline two\r\nline three\"}";
        let mut wire = Vec::new();
        write_frame(&mut wire, body).await.unwrap();

        let mut reader = FrameReader::new(wire.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), body);
    }

    #[tokio::test]
    async fn oversize_length_is_rejected_before_reading_body() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        wire.extend_from_slice(b"whatever");

        let mut reader = FrameReader::new(wire.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&10u32.to_be_bytes());
        wire.extend_from_slice(b"only5");

        let mut reader = FrameReader::new(wire.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn empty_body_is_a_valid_frame() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"").await.unwrap();

        let mut reader = FrameReader::new(wire.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"");
    }
}
