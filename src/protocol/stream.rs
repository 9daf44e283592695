use crate::utils::error::Result;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// 32KB keeps syscall counts low on bulk transfers without hurting
// handshake latency
const READ_CHUNK: usize = 32 * 1024;

/// Stateful transform applied to bytes produced by a [`ProxyReader`].
/// Installed mid-stream by protocols that re-frame payload data after the
/// handshake (one-time-auth chunk verification).
pub trait StreamDecoder: Send {
    /// Consume raw input and return whatever decoded bytes are available.
    /// May buffer internally when the input ends mid-frame.
    fn transform(&mut self, input: &[u8]) -> Result<Bytes>;
}

/// Counterpart of [`StreamDecoder`] for a [`ProxyWriter`]: wraps each
/// payload into its on-wire framing.
pub trait StreamEncoder: Send {
    fn wrap(&mut self, payload: &[u8]) -> Bytes;
}

/// Find the first occurrence of `needle` in `haystack`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Buffered reader over an inbound byte stream.
///
/// All handshake parsing goes through this adapter: it offers exact reads,
/// delimiter reads and opportunistic reads, and carries the decoder chain
/// that transforms payload bytes once a protocol installs one.
pub struct ProxyReader<R> {
    inner: R,
    buf: BytesMut,
    decoders: Vec<Box<dyn StreamDecoder>>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> ProxyReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            decoders: Vec::new(),
            eof: false,
        }
    }

    /// Read exactly `n` bytes.
    pub async fn read_n(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            if self.eof {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended mid-handshake",
                )
                .into());
            }
            self.fill().await?;
        }
        Ok(self.buf.split_to(n).freeze())
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        let byte = self.read_n(1).await?;
        Ok(byte[0])
    }

    /// Read up to and including `delim`.
    pub async fn read_until(&mut self, delim: &[u8]) -> Result<Bytes> {
        let mut searched = 0;
        loop {
            if let Some(pos) = find_subsequence(&self.buf[searched..], delim) {
                return Ok(self.buf.split_to(searched + pos + delim.len()).freeze());
            }
            // a partial delimiter may straddle the fill boundary
            searched = self.buf.len().saturating_sub(delim.len() - 1);
            if self.eof {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended before delimiter",
                )
                .into());
            }
            self.fill().await?;
        }
    }

    /// Read whatever is available; an empty result signals EOF.
    pub async fn read_some(&mut self) -> Result<Bytes> {
        while self.buf.is_empty() && !self.eof {
            self.fill().await?;
        }
        Ok(self.buf.split().freeze())
    }

    /// Append a decoder to the chain. Bytes already buffered have not seen
    /// the new decoder, so they are re-fed through it once.
    pub fn push_decoder(&mut self, mut decoder: Box<dyn StreamDecoder>) -> Result<()> {
        if !self.buf.is_empty() {
            let pending = self.buf.split().freeze();
            let reprocessed = decoder.transform(&pending)?;
            self.buf.extend_from_slice(&reprocessed);
        }
        self.decoders.push(decoder);
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
            return Ok(());
        }
        if self.decoders.is_empty() {
            self.buf.extend_from_slice(&chunk[..n]);
            return Ok(());
        }
        let mut data = Bytes::copy_from_slice(&chunk[..n]);
        for decoder in &mut self.decoders {
            data = decoder.transform(&data)?;
        }
        self.buf.extend_from_slice(&data);
        Ok(())
    }
}

/// Writer over an outbound byte stream with an encoder chain.
pub struct ProxyWriter<W> {
    inner: W,
    encoders: Vec<Box<dyn StreamEncoder>>,
}

impl<W: AsyncWrite + Unpin> ProxyWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            encoders: Vec::new(),
        }
    }

    /// Write `data` through the encoder chain. Empty writes are elided.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.encoders.is_empty() {
            self.inner.write_all(data).await?;
            return Ok(());
        }
        let mut framed = Bytes::copy_from_slice(data);
        for encoder in &mut self.encoders {
            framed = encoder.wrap(&framed);
            if framed.is_empty() {
                return Ok(());
            }
        }
        self.inner.write_all(&framed).await?;
        Ok(())
    }

    pub async fn drain(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn push_encoder(&mut self, encoder: Box<dyn StreamEncoder>) {
        self.encoders.push(encoder);
    }
}
