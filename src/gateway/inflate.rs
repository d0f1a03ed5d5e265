use flate2::{Decompress, FlushDecompress, Status};

use crate::error::{GatewayError, Result};

/// Trailer the server appends after every complete logical message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Upper bound on buffered compressed bytes for one logical message.
pub const MAX_BUFFERED: usize = 16 * 1024 * 1024;

const CHUNK: usize = 32 * 1024;

/// Reassembles a connection's zlib-stream into JSON messages.
///
/// The inflate state spans the whole connection, so one instance must be
/// used for exactly one socket and replaced on reconnect.
pub struct FrameDecompressor {
    stream: Decompress,
    buffer: Vec<u8>,
    limit: usize,
}

impl FrameDecompressor {
    pub fn new() -> Self {
        Self::with_limit(MAX_BUFFERED)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            stream: Decompress::new(true),
            buffer: Vec::new(),
            limit,
        }
    }

    /// Feed one binary fragment. Returns the decoded message once the
    /// accumulated buffer ends with [`ZLIB_SUFFIX`].
    pub fn push(&mut self, fragment: &[u8]) -> Result<Option<String>> {
        if self.buffer.len() + fragment.len() > self.limit {
            self.buffer.clear();
            return Err(GatewayError::Decompress(format!(
                "message exceeds {} buffered bytes",
                self.limit
            )));
        }
        self.buffer.extend_from_slice(fragment);

        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let inflated = self.inflate();
        self.buffer.clear();
        let text = String::from_utf8(inflated?)
            .map_err(|e| GatewayError::Decompress(format!("payload is not utf-8: {e}")))?;
        Ok(Some(text))
    }

    /// Bytes waiting for the rest of their message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn inflate(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.buffer.len().saturating_mul(4).max(CHUNK));
        let mut input = &self.buffer[..];

        loop {
            if out.len() == out.capacity() {
                out.reserve(CHUNK);
            }

            let in_before = self.stream.total_in();
            let out_before = self.stream.total_out();
            let status = self
                .stream
                .decompress_vec(input, &mut out, FlushDecompress::Sync)?;
            let consumed = (self.stream.total_in() - in_before) as usize;
            let produced = self.stream.total_out() - out_before;
            input = &input[consumed..];

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    // Output space left over means everything available was flushed.
                    if input.is_empty() && out.len() < out.capacity() {
                        break;
                    }
                    if consumed == 0 && produced == 0 && out.len() < out.capacity() {
                        return Err(GatewayError::Decompress(
                            "inflate stalled on trailing input".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(out)
    }
}

impl Default for FrameDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Server-side half of a zlib-stream: every `frame` call emits the bytes
    /// for one message, ending in a sync flush.
    struct StreamCompressor {
        encoder: ZlibEncoder<Vec<u8>>,
        taken: usize,
    }

    impl StreamCompressor {
        fn new() -> Self {
            Self {
                encoder: ZlibEncoder::new(Vec::new(), Compression::default()),
                taken: 0,
            }
        }

        fn frame(&mut self, json: &str) -> Vec<u8> {
            self.encoder.write_all(json.as_bytes()).unwrap();
            self.encoder.flush().unwrap();
            let out = self.encoder.get_ref()[self.taken..].to_vec();
            self.taken = self.encoder.get_ref().len();
            out
        }
    }

    #[test]
    fn test_single_frame() {
        let mut server = StreamCompressor::new();
        let frame = server.frame(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
        assert!(frame.ends_with(&ZLIB_SUFFIX));

        let mut inflater = FrameDecompressor::new();
        let text = inflater.push(&frame).unwrap().unwrap();
        assert_eq!(text, r#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
        assert_eq!(inflater.pending(), 0);
    }

    #[test]
    fn test_split_points_do_not_matter() {
        let json = r#"{"op":0,"s":1,"t":"READY","d":{"session_id":"abc","v":9}}"#;
        let frame = StreamCompressor::new().frame(json);

        for split in 1..frame.len() {
            let (head, tail) = frame.split_at(split);
            // A head ending in the suffix would be a message boundary of its own.
            if head.ends_with(&ZLIB_SUFFIX) {
                continue;
            }
            let mut inflater = FrameDecompressor::new();
            assert!(
                inflater.push(head).unwrap().is_none(),
                "split at {split} completed early"
            );
            assert_eq!(inflater.push(tail).unwrap().as_deref(), Some(json));
        }
    }

    #[test]
    fn test_three_way_split_matches_whole() {
        let json = r#"{"op":0,"s":5,"t":"TYPING_START","d":{"user_id":"1","channel_id":"2","timestamp":0}}"#;
        let frame = StreamCompressor::new().frame(json);
        let whole = FrameDecompressor::new().push(&frame).unwrap();

        let a = frame.len() / 3;
        let b = 2 * frame.len() / 3;
        let mut inflater = FrameDecompressor::new();
        assert!(inflater.push(&frame[..a]).unwrap().is_none());
        assert!(inflater.push(&frame[a..b]).unwrap().is_none());
        assert_eq!(inflater.push(&frame[b..]).unwrap(), whole);
    }

    #[test]
    fn test_byte_at_a_time() {
        let json = r#"{"op":11}"#;
        let frame = StreamCompressor::new().frame(json);
        let mut inflater = FrameDecompressor::new();
        let mut decoded = Vec::new();
        for byte in &frame {
            if let Some(text) = inflater.push(std::slice::from_ref(byte)).unwrap() {
                decoded.push(text);
            }
        }
        assert_eq!(decoded, vec![json.to_string()]);
    }

    #[test]
    fn test_stream_state_spans_messages() {
        let mut server = StreamCompressor::new();
        let mut inflater = FrameDecompressor::new();
        let messages = [
            r#"{"op":10,"d":{"heartbeat_interval":45000}}"#,
            r#"{"op":11}"#,
            r#"{"op":0,"s":2,"t":"MESSAGE_CREATE","d":{"content":"hello hello hello"}}"#,
        ];
        for message in messages {
            let frame = server.frame(message);
            assert_eq!(inflater.push(&frame).unwrap().as_deref(), Some(message));
        }
    }

    #[test]
    fn test_garbage_is_an_error() {
        let mut inflater = FrameDecompressor::new();
        let result = inflater.push(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0xff, 0xff]);
        assert!(matches!(result, Err(GatewayError::Decompress(_))));
    }

    #[test]
    fn test_buffer_limit() {
        let mut inflater = FrameDecompressor::with_limit(8);
        assert!(inflater.push(&[1, 2, 3, 4]).unwrap().is_none());
        assert!(inflater.push(&[5, 6, 7, 8, 9]).is_err());
        assert_eq!(inflater.pending(), 0);
    }
}
