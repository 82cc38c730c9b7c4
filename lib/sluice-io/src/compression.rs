//! Payload compression.

use std::io;

use async_compression::{tokio::write::GzipEncoder, Level};
use bytes::Bytes;
use http::HeaderValue;
use tokio::io::AsyncWriteExt as _;

static CONTENT_ENCODING_GZIP: HeaderValue = HeaderValue::from_static("gzip");

/// Compression schemes supported by [`PayloadCompressor`].
#[derive(Copy, Clone, Debug)]
pub enum CompressionScheme {
    /// No compression.
    Noop,

    /// Gzip.
    Gzip(Level),
}

impl CompressionScheme {
    /// No compression.
    pub const fn noop() -> Self {
        Self::Noop
    }

    /// Gzip compression, using the default compression level.
    pub const fn gzip_default() -> Self {
        Self::Gzip(Level::Default)
    }

    /// Returns `true` if this scheme actually compresses data.
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Noop)
    }

    /// Returns the value of the `Content-Encoding` header describing payloads produced with this scheme.
    pub fn content_encoding(&self) -> Option<HeaderValue> {
        match self {
            Self::Noop => None,
            Self::Gzip(_) => Some(CONTENT_ENCODING_GZIP.clone()),
        }
    }
}

/// A reusable payload compressor.
///
/// Each call to [`compress`][Self::compress] produces one complete, self-contained compressed stream. The output
/// buffer is owned by the compressor and is cleared rather than reallocated between calls, so steady-state
/// compression only allocates for the returned `Bytes`. The gzip encoder wrapping that buffer is rebuilt on each call,
/// as a finished `GzipEncoder` cannot be reset.
pub struct PayloadCompressor {
    scheme: CompressionScheme,
    scratch: Vec<u8>,
}

impl PayloadCompressor {
    /// Creates a new `PayloadCompressor` for the given scheme.
    pub fn new(scheme: CompressionScheme) -> Self {
        Self {
            scheme,
            scratch: Vec::new(),
        }
    }

    /// Returns the compression scheme in use.
    pub fn scheme(&self) -> CompressionScheme {
        self.scheme
    }

    /// Returns the value of the `Content-Encoding` header for payloads produced by this compressor.
    pub fn content_encoding(&self) -> Option<HeaderValue> {
        self.scheme.content_encoding()
    }

    /// Compresses `payload`.
    ///
    /// With [`CompressionScheme::Noop`], the payload is returned untouched.
    ///
    /// # Errors
    ///
    /// If the encoder fails to write or finalize the compressed stream, an error is returned. The caller must not fall
    /// back to the uncompressed payload in that case, since the receiving side expects the advertised encoding.
    pub async fn compress(&mut self, payload: Bytes) -> io::Result<Bytes> {
        let level = match self.scheme {
            CompressionScheme::Noop => return Ok(payload),
            CompressionScheme::Gzip(level) => level,
        };

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();

        let mut encoder = GzipEncoder::with_quality(scratch, level);
        let result = async {
            encoder.write_all(&payload).await?;
            encoder.shutdown().await
        }
        .await;

        // Take the buffer back regardless of the outcome so the allocation survives a failed call.
        let mut scratch = encoder.into_inner();
        let compressed = result.map(|()| Bytes::copy_from_slice(&scratch));
        scratch.clear();
        self.scratch = scratch;

        compressed
    }
}

#[cfg(test)]
mod tests {
    use async_compression::tokio::write::GzipDecoder;

    use super::*;

    async fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut decoder = GzipDecoder::new(Vec::new());
        decoder.write_all(data).await.expect("should not fail to write compressed data");
        decoder.shutdown().await.expect("should not fail to finish decoding");
        decoder.into_inner()
    }

    #[tokio::test]
    async fn noop_passes_payload_through() {
        let mut compressor = PayloadCompressor::new(CompressionScheme::noop());
        let payload = Bytes::from_static(b"cpu load=1");

        let output = compressor.compress(payload.clone()).await.unwrap();
        assert_eq!(output, payload);
        assert!(compressor.content_encoding().is_none());
    }

    #[tokio::test]
    async fn gzip_streams_are_independent_across_calls() {
        let mut compressor = PayloadCompressor::new(CompressionScheme::gzip_default());
        assert_eq!(compressor.content_encoding(), Some(HeaderValue::from_static("gzip")));

        // Every call must yield a complete gzip stream on its own, even though the scratch buffer is shared.
        for payload in [&b"first payload"[..], &b"second, somewhat longer payload"[..], &b""[..]] {
            let compressed = compressor.compress(Bytes::copy_from_slice(payload)).await.unwrap();
            assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
            assert_eq!(gunzip(&compressed).await, payload);
        }
    }

    #[tokio::test]
    async fn output_buffer_is_reused_across_calls() {
        let mut compressor = PayloadCompressor::new(CompressionScheme::gzip_default());

        let large = (0..8192u32).map(|i| (i * 31 % 251) as u8).collect::<Vec<_>>();
        compressor.compress(Bytes::from(large)).await.unwrap();
        let capacity = compressor.scratch.capacity();
        let ptr = compressor.scratch.as_ptr();
        assert!(capacity > 0);

        let compressed = compressor.compress(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(gunzip(&compressed).await, b"x");
        assert_eq!(compressor.scratch.capacity(), capacity);
        assert_eq!(compressor.scratch.as_ptr(), ptr);
        assert!(compressor.scratch.is_empty());
    }
}
