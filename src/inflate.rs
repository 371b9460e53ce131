//! Bounded zlib inflation for pack payloads.
//!
//! Pack object payloads are zlib streams that may span multiple cache
//! windows, so inflation is driven incrementally: the window cursor feeds
//! whatever contiguous bytes are currently resident into an [`Inflater`]
//! and asks for more input only when the stream is not yet finished.
//!
//! # Scope
//! - Strict output caps; corrupt streams can never allocate unboundedly.
//! - No checksum verification; pack trailers are handled elsewhere.
//!
//! # Caller Expectations
//! - `reset` must be called between streams when an `Inflater` is reused.
//! - On error the output may hold a partial prefix; callers discard it.

use std::fmt;

use flate2::{Decompress, FlushDecompress, Status};

/// Internal inflate chunk size.
const INFLATE_BUF_SIZE: usize = 16 * 1024;

/// Inflate error taxonomy.
#[derive(Debug, PartialEq, Eq)]
pub enum InflateError {
    /// Output would exceed the configured cap.
    LimitExceeded,
    /// Stream ended before producing the expected bytes.
    TruncatedInput,
    /// Decompressor made no progress on non-empty input.
    Stalled,
    /// zlib-level failure (bad stream data).
    Backend,
}

impl fmt::Display for InflateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LimitExceeded => write!(f, "inflate limit exceeded"),
            Self::TruncatedInput => write!(f, "truncated deflate stream"),
            Self::Stalled => write!(f, "inflate stalled"),
            Self::Backend => write!(f, "inflate backend error"),
        }
    }
}

impl std::error::Error for InflateError {}

/// Progress report from one [`Inflater::step`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    /// Input bytes consumed from the slice passed to `step`.
    pub consumed: usize,
    /// True once the zlib stream reached its end marker.
    pub finished: bool,
}

/// Reusable zlib decompressor with an owned scratch buffer.
///
/// One `Inflater` lives inside each window cursor, so decode loops never
/// allocate a fresh decompressor per object.
pub struct Inflater {
    raw: Decompress,
    buf: Box<[u8; INFLATE_BUF_SIZE]>,
}

impl Inflater {
    /// Creates an inflater expecting zlib-wrapped streams.
    #[must_use]
    pub fn new() -> Self {
        Self {
            raw: Decompress::new(true),
            buf: Box::new([0u8; INFLATE_BUF_SIZE]),
        }
    }

    /// Resets stream state so the inflater can decode a fresh stream.
    pub fn reset(&mut self) {
        self.raw.reset(true);
    }

    /// Feeds one contiguous input chunk, appending output to `out`.
    ///
    /// Returns how much of `input` was consumed and whether the stream is
    /// complete. A `finished == false` return with all input consumed means
    /// the stream continues in the next chunk.
    ///
    /// # Errors
    /// - `LimitExceeded` if output would pass `max_out`.
    /// - `Stalled` if no progress is possible on non-empty input.
    /// - `Backend` on zlib stream corruption.
    pub fn step(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        max_out: usize,
    ) -> Result<Step, InflateError> {
        let mut in_pos = 0usize;

        loop {
            let before_in = self.raw.total_in() as usize;
            let before_out = self.raw.total_out() as usize;

            let status = self
                .raw
                .decompress(&input[in_pos..], &mut self.buf[..], FlushDecompress::None)
                .map_err(|_| InflateError::Backend)?;

            let consumed = self.raw.total_in() as usize - before_in;
            let produced = self.raw.total_out() as usize - before_out;
            in_pos += consumed;

            if produced != 0 {
                if out.len() + produced > max_out {
                    return Err(InflateError::LimitExceeded);
                }
                out.extend_from_slice(&self.buf[..produced]);
            }

            match status {
                Status::StreamEnd => {
                    return Ok(Step {
                        consumed: in_pos,
                        finished: true,
                    })
                }
                Status::Ok => {
                    if consumed == 0 && produced == 0 {
                        if in_pos >= input.len() {
                            return Ok(Step {
                                consumed: in_pos,
                                finished: false,
                            });
                        }
                        return Err(InflateError::Stalled);
                    }
                }
                Status::BufError => {
                    if in_pos >= input.len() {
                        return Ok(Step {
                            consumed: in_pos,
                            finished: false,
                        });
                    }
                }
            }
        }
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Inflater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inflater")
            .field("total_in", &self.raw.total_in())
            .field("total_out", &self.raw.total_out())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn single_chunk_stream() {
        let payload = b"hello pack world";
        let compressed = compress(payload);

        let mut inflater = Inflater::new();
        let mut out = Vec::new();
        let step = inflater.step(&compressed, &mut out, 1024).unwrap();

        assert!(step.finished);
        assert_eq!(step.consumed, compressed.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn split_stream_resumes_across_chunks() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let compressed = compress(&payload);
        let (a, b) = compressed.split_at(compressed.len() / 2);

        let mut inflater = Inflater::new();
        let mut out = Vec::new();

        let step = inflater.step(a, &mut out, payload.len()).unwrap();
        assert!(!step.finished);
        assert_eq!(step.consumed, a.len());

        let step = inflater.step(b, &mut out, payload.len()).unwrap();
        assert!(step.finished);
        assert_eq!(out, payload);
    }

    #[test]
    fn output_cap_is_enforced() {
        let compressed = compress(&[0x7fu8; 1000]);

        let mut inflater = Inflater::new();
        let mut out = Vec::new();
        let err = inflater.step(&compressed, &mut out, 100).unwrap_err();
        assert_eq!(err, InflateError::LimitExceeded);
    }

    #[test]
    fn garbage_input_is_a_backend_error() {
        let mut inflater = Inflater::new();
        let mut out = Vec::new();
        let err = inflater
            .step(&[0xff, 0xfe, 0xfd, 0xfc], &mut out, 64)
            .unwrap_err();
        assert_eq!(err, InflateError::Backend);
    }

    #[test]
    fn reset_allows_reuse() {
        let payload = b"first stream";
        let compressed = compress(payload);

        let mut inflater = Inflater::new();
        let mut out = Vec::new();
        inflater.step(&compressed, &mut out, 64).unwrap();
        assert_eq!(out, payload);

        inflater.reset();
        let payload2 = b"second stream, reused state";
        let compressed2 = compress(payload2);
        let mut out2 = Vec::new();
        let step = inflater.step(&compressed2, &mut out2, 64).unwrap();
        assert!(step.finished);
        assert_eq!(out2, payload2);
    }
}
