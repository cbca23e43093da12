//! Per-message deflate compression (RFC 7692)
//!
//! Messages are compressed as raw DEFLATE streams flushed with an empty
//! stored block; the trailing `00 00 FF FF` is stripped before framing and
//! restored before inflating. Context takeover keeps the LZ77 window across
//! messages unless the handshake negotiated otherwise.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Trailer removed after compression and re-appended before decompression
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Chunk size for the inflate/deflate working buffer
const CHUNK: usize = 4096;

/// Parameters negotiated by the upgrade layer
#[derive(Debug, Clone)]
pub struct DeflateConfig {
    /// Reset the compression context after every outgoing message
    pub server_no_context_takeover: bool,
    /// Reset the decompression context after every incoming message
    pub client_no_context_takeover: bool,
    /// Compression level (0-9)
    pub compression_level: u32,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            compression_level: 6,
        }
    }
}

/// Compressor for outgoing messages
pub struct DeflateEncoder {
    compress: Compress,
    no_context_takeover: bool,
}

impl DeflateEncoder {
    /// Create a new encoder
    pub fn new(no_context_takeover: bool, level: u32) -> Self {
        Self {
            compress: Compress::new(Compression::new(level), false),
            no_context_takeover,
        }
    }

    /// Compress a whole message payload and strip the sync-flush trailer.
    pub fn compress(&mut self, data: &[u8]) -> Result<Bytes> {
        if self.no_context_takeover {
            self.compress.reset();
        }

        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        let mut chunk = [0u8; CHUNK];
        let mut consumed = 0usize;

        loop {
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();

            let status = self
                .compress
                .compress(&data[consumed..], &mut chunk, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate: {}", e)))?;

            consumed += (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);

            if status == Status::StreamEnd {
                break;
            }
            // Sync flush is complete once all input is consumed and the
            // output chunk was not filled to the brim.
            if consumed == data.len() && produced < CHUNK {
                break;
            }
        }

        if out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }

        Ok(Bytes::from(out))
    }

    /// Reset the compression context
    pub fn reset(&mut self) {
        self.compress.reset();
    }
}

/// Decompressor for incoming messages
pub struct DeflateDecoder {
    decompress: Decompress,
    no_context_takeover: bool,
}

impl DeflateDecoder {
    /// Create a new decoder
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            decompress: Decompress::new(false),
            no_context_takeover,
        }
    }

    /// Decompress a whole message payload, restoring the sync-flush
    /// trailer first. Fails once the inflated size exceeds `max_size`.
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        if self.no_context_takeover {
            self.decompress.reset(false);
        }

        let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let mut out = Vec::with_capacity(data.len().saturating_mul(2).max(256));
        let mut chunk = [0u8; CHUNK];
        let mut consumed = 0usize;

        loop {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();

            let status = self
                .decompress
                .decompress(&input[consumed..], &mut chunk, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate: {}", e)))?;

            consumed += (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);

            if out.len() > max_size {
                return Err(Error::MessageTooLarge);
            }

            if status == Status::StreamEnd {
                break;
            }
            if consumed == input.len() && produced < CHUNK {
                break;
            }
            if produced == 0 && consumed == input.len() {
                break;
            }
        }

        Ok(Bytes::from(out))
    }

    /// Reset the decompression context
    pub fn reset(&mut self) {
        self.decompress.reset(false);
    }
}

/// Encoder/decoder pair for one server-side connection
pub struct DeflateContext {
    /// Encoder for outgoing messages
    pub encoder: DeflateEncoder,
    /// Decoder for incoming messages
    pub decoder: DeflateDecoder,
}

impl DeflateContext {
    /// Create a context for the server role
    pub fn server(config: &DeflateConfig) -> Self {
        Self {
            encoder: DeflateEncoder::new(
                config.server_no_context_takeover,
                config.compression_level,
            ),
            decoder: DeflateDecoder::new(config.client_no_context_takeover),
        }
    }

    /// Split into the send-path and receive-path halves
    pub fn split(self) -> (DeflateEncoder, DeflateDecoder) {
        (self.encoder, self.decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DeflateContext {
        DeflateContext::server(&DeflateConfig::default())
    }

    #[test]
    fn compress_decompress_roundtrip() {
        let mut ctx = context();
        let original = b"Hello, World! This is a message long enough to shrink under deflate, deflate, deflate.";

        let compressed = ctx.encoder.compress(original).unwrap();
        assert!(compressed.len() < original.len());
        assert!(!compressed.ends_with(&DEFLATE_TRAILER));

        let restored = ctx.decoder.decompress(&compressed, 1024).unwrap();
        assert_eq!(&restored[..], &original[..]);
    }

    #[test]
    fn empty_message_roundtrip() {
        let mut ctx = context();
        let compressed = ctx.encoder.compress(b"").unwrap();
        let restored = ctx.decoder.decompress(&compressed, 1024).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn context_takeover_shrinks_repeats() {
        let mut ctx = context();
        let msg = b"repeated payload repeated payload repeated payload";

        let first = ctx.encoder.compress(msg).unwrap();
        let second = ctx.encoder.compress(msg).unwrap();
        // The second message references the first via the shared window.
        assert!(second.len() <= first.len());

        // Decoding must track the same window.
        assert_eq!(&ctx.decoder.decompress(&first, 1024).unwrap()[..], &msg[..]);
        assert_eq!(&ctx.decoder.decompress(&second, 1024).unwrap()[..], &msg[..]);
    }

    #[test]
    fn no_context_takeover_is_stateless() {
        let config = DeflateConfig {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            ..Default::default()
        };
        let mut ctx = DeflateContext::server(&config);
        let msg = b"repeated payload repeated payload repeated payload";

        let first = ctx.encoder.compress(msg).unwrap();
        let second = ctx.encoder.compress(msg).unwrap();
        assert_eq!(first, second);

        assert_eq!(&ctx.decoder.decompress(&second, 1024).unwrap()[..], &msg[..]);
    }

    #[test]
    fn decompress_enforces_size_cap() {
        let mut ctx = context();
        let big = vec![0u8; 64 * 1024];
        let compressed = ctx.encoder.compress(&big).unwrap();
        assert!(matches!(
            ctx.decoder.decompress(&compressed, 1024),
            Err(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn garbage_input_fails() {
        let mut ctx = context();
        assert!(ctx
            .decoder
            .decompress(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02], 1024)
            .is_err());
    }
}
