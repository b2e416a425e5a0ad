//! Length-prefixed CBOR framing for link sessions.
//!
//! Wire format: `[4-byte big-endian length][CBOR frame]`. Frames larger than
//! [`MAX_FRAME_LEN`] are rejected as a protocol error rather than buffered.

use crate::error::{GateError, GateResult};
use crate::messages::Frame;
use std::collections::VecDeque;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Data frames carry at most 8 KiB of payload,
/// so anything near this limit is a corrupt or hostile peer.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Encode a frame into a length-prefixed CBOR buffer.
pub fn encode_frame(frame: &Frame) -> GateResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(frame, &mut payload)?;

    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend(payload);
    Ok(buf)
}

/// Encode and write a single frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> GateResult<()> {
    let buf = encode_frame(frame)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Streaming frame decoder: accumulates bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete frames.
    pub fn feed(&mut self, data: &[u8]) -> GateResult<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;

            if len > MAX_FRAME_LEN {
                return Err(GateError::Protocol(format!(
                    "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            let payload = &self.buffer[4..4 + len];
            let frame: Frame = ciborium::from_reader(Cursor::new(payload))?;
            frames.push(frame);

            self.buffer.drain(..4 + len);
        }

        Ok(frames)
    }

    /// Number of bytes waiting for a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Reads frames one at a time from an async byte stream.
///
/// Buffers frames that arrive together so `next()` always yields exactly one.
pub struct FramedReader<R> {
    inner: R,
    decoder: FrameDecoder,
    queue: VecDeque<Frame>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            queue: VecDeque::new(),
            buf: vec![0u8; 8192],
        }
    }

    /// Read the next frame. Returns `Network` on EOF — a link session never
    /// ends cleanly from the remote side without a transport close.
    pub async fn next(&mut self) -> GateResult<Frame> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(frame);
            }
            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                return Err(GateError::Network("session closed by peer".into()));
            }
            let frames = self.decoder.feed(&self.buf[..n])?;
            self.queue.extend(frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single() {
        let frame = Frame::Open { stream_id: 7 };
        let bytes = encode_frame(&frame).unwrap();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&bytes).unwrap();
        assert_eq!(frames, vec![Frame::Open { stream_id: 7 }]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn partial_then_complete() {
        let frame = Frame::Data {
            stream_id: 1,
            data: vec![1, 2, 3, 4, 5],
        };
        let bytes = encode_frame(&frame).unwrap();
        let mut decoder = FrameDecoder::new();

        let split = bytes.len() / 2;
        assert!(decoder.feed(&bytes[..split]).unwrap().is_empty());
        assert!(decoder.pending() > 0);
        let frames = decoder.feed(&bytes[split..]).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn multiple_frames_in_one_feed() {
        let a = Frame::Ping {};
        let b = Frame::Close { stream_id: 3 };
        let mut bytes = encode_frame(&a).unwrap();
        bytes.extend(encode_frame(&b).unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&bytes).unwrap();
        assert_eq!(frames, vec![a, b]);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let err = decoder.feed(&len).unwrap_err();
        assert!(matches!(err, GateError::Protocol(_)));
    }

    #[tokio::test]
    async fn framed_reader_yields_frames_in_order() {
        let a = Frame::OpenOk { stream_id: 1 };
        let b = Frame::Pong {};
        let mut bytes = encode_frame(&a).unwrap();
        bytes.extend(encode_frame(&b).unwrap());

        let mut reader = FramedReader::new(Cursor::new(bytes));
        assert_eq!(reader.next().await.unwrap(), a);
        assert_eq!(reader.next().await.unwrap(), b);
        assert!(matches!(
            reader.next().await.unwrap_err(),
            GateError::Network(_)
        ));
    }
}
