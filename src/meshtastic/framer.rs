//! Length-prefixed framing for the Meshtastic serial API.
//!
//! Binary frames on the serial link are emitted as:
//!
//!   `0x94 0xC3 <len hi> <len lo> <protobuf bytes>`
//!
//! Anything between frames (boot banners, debug console text) is noise and is
//! skipped while resynchronizing on the next header.
use bytes::{Buf, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
/// Upper bound the firmware will ever emit for a single frame.
pub const MAX_FRAME_SIZE: usize = 512;

/// Incremental decoder: feed arbitrary chunks, pull complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    noise: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            noise: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded so far while hunting for a header.
    pub fn noise_bytes(&self) -> usize {
        self.noise
    }

    /// Next complete frame payload, or None until more bytes arrive.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            // Realign to the header
            match self.buf.iter().position(|&b| b == START1) {
                Some(pos) => {
                    self.noise += pos;
                    self.buf.advance(pos);
                }
                None => {
                    self.noise += self.buf.len();
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 4 {
                return None;
            }
            if self.buf[1] != START2 {
                self.noise += 1;
                self.buf.advance(1);
                continue;
            }
            let declared = ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
            if declared == 0 || declared > MAX_FRAME_SIZE {
                self.noise += 1;
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < 4 + declared {
                return None;
            }
            self.buf.advance(4);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}

/// Prefix an encoded ToRadio payload with the serial header.
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return None;
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(START1);
    out.push(START2);
    out.push(((payload.len() >> 8) & 0xFF) as u8);
    out.push((payload.len() & 0xFF) as u8);
    out.extend_from_slice(payload);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_chunks() {
        let frame = encode_frame(b"abc").expect("frame");
        let mut dec = FrameDecoder::new();
        dec.push(&frame[..2]);
        assert!(dec.next_frame().is_none());
        dec.push(&frame[2..]);
        assert_eq!(dec.next_frame().as_deref(), Some(&b"abc"[..]));
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn console_text_before_frame_is_skipped() {
        let mut dec = FrameDecoder::new();
        dec.push(b"INFO | booting\r\n");
        dec.push(&encode_frame(b"xy").expect("frame"));
        assert_eq!(dec.next_frame().as_deref(), Some(&b"xy"[..]));
        assert_eq!(dec.noise_bytes(), 16);
    }

    #[test]
    fn false_start_byte_resyncs() {
        let mut dec = FrameDecoder::new();
        // 0x94 followed by something other than 0xC3, then a real frame
        dec.push(&[0x94, 0x00]);
        dec.push(&encode_frame(b"ok").expect("frame"));
        assert_eq!(dec.next_frame().as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn oversize_length_is_rejected() {
        let mut dec = FrameDecoder::new();
        dec.push(&[0x94, 0xC3, 0xFF, 0xFF, 0x01]);
        assert!(dec.next_frame().is_none());
        dec.push(&encode_frame(b"z").expect("frame"));
        assert_eq!(dec.next_frame().as_deref(), Some(&b"z"[..]));
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut chunk = encode_frame(b"one").expect("frame");
        chunk.extend(encode_frame(b"two").expect("frame"));
        let mut dec = FrameDecoder::new();
        dec.push(&chunk);
        assert_eq!(dec.next_frame().as_deref(), Some(&b"one"[..]));
        assert_eq!(dec.next_frame().as_deref(), Some(&b"two"[..]));
    }
}
