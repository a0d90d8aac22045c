//! Wire framing for the proxy channels.
//!
//! Two distinct framings coexist:
//!
//! * Control channel: `u32` payload length (big-endian), `u32` reserved,
//!   followed by a JSON payload. The length covers the payload only.
//! * I/O stream channel: `u64` stream sequence (big-endian), `u32` frame
//!   length, followed by the data. The length covers header *and* payload.
//!
//! The asymmetry between the two length fields comes from the proxy protocol
//! and is kept as-is.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};

/// Size of a control message header in bytes.
pub const CTL_HEADER_SIZE: usize = 8;

/// Size of a stream frame header in bytes.
pub const STREAM_HEADER_SIZE: usize = 12;

/// A stream frame with this total length is an end-of-stream marker.
pub const STREAM_EOF_SIZE: u32 = STREAM_HEADER_SIZE as u32;

/// A stream frame with this total length carries a one-byte exit status.
pub const STREAM_EXIT_STATUS_SIZE: u32 = STREAM_HEADER_SIZE as u32 + 1;

/// Encode a control message around the provided JSON payload.
pub fn encode_ctl_message(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CTL_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Write a control message to `w`.
pub fn write_ctl_message<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    w.write_all(&encode_ctl_message(payload))
        .context("write control message")?;
    w.flush().context("flush control message")
}

/// Read one control message payload from `r`.
pub fn read_ctl_message<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; CTL_HEADER_SIZE];
    r.read_exact(&mut header).context("read control header")?;

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).context("read control payload")?;

    Ok(payload)
}

/// A decoded frame from the I/O stream channel.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamFrame {
    /// The stream sequence number the frame belongs to.
    pub seq: u64,

    /// Frame data, which may be empty for control markers.
    pub payload: Vec<u8>,
}

impl StreamFrame {
    pub fn new(seq: u64, payload: &[u8]) -> Self {
        Self {
            seq,
            payload: payload.to_vec(),
        }
    }

    /// Encode the frame, length field covering header plus payload.
    pub fn encode(&self) -> Vec<u8> {
        let total = STREAM_HEADER_SIZE + self.payload.len();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&(total as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame header, returning `(seq, total_length)`.
    pub fn decode_header(header: &[u8]) -> Result<(u64, u32)> {
        if header.len() < STREAM_HEADER_SIZE {
            bail!("stream frame header truncated: {} bytes", header.len());
        }

        let seq = u64::from_be_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
        ]);
        let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        if (len as usize) < STREAM_HEADER_SIZE {
            bail!("stream frame length {} below header size", len);
        }

        Ok((seq, len))
    }

    /// Decode a full frame from a buffer known to contain one.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (seq, len) = Self::decode_header(buf)?;
        if buf.len() < len as usize {
            bail!(
                "stream frame truncated: got {} of {} bytes",
                buf.len(),
                len
            );
        }

        Ok(Self {
            seq,
            payload: buf[STREAM_HEADER_SIZE..len as usize].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_frame_encode_known_bytes() {
        let frame = StreamFrame::new(0x0102030405060708, b"abc");
        assert_eq!(
            frame.encode(),
            vec![
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x00, 0x00, 0x00, 0x0f, 0x61,
                0x62, 0x63
            ]
        );
    }

    #[test]
    fn stream_frame_roundtrip() {
        let frame = StreamFrame::new(0x0102030405060708, b"abc");
        let decoded = StreamFrame::decode(&frame.encode()).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn stream_frame_length_covers_header() {
        let frame = StreamFrame::new(7, b"payload");
        let encoded = frame.encode();
        let (seq, len) = StreamFrame::decode_header(&encoded).expect("header");
        assert_eq!(seq, 7);
        assert_eq!(len as usize, STREAM_HEADER_SIZE + b"payload".len());
    }

    #[test]
    fn stream_frame_empty_is_eof_marker() {
        let frame = StreamFrame::new(9, b"");
        let encoded = frame.encode();
        let (_, len) = StreamFrame::decode_header(&encoded).expect("header");
        assert_eq!(len, STREAM_EOF_SIZE);
    }

    #[test]
    fn stream_frame_bad_length() {
        let mut encoded = StreamFrame::new(1, b"x").encode();
        // Corrupt the length field to something below the header size.
        encoded[8..12].copy_from_slice(&4u32.to_be_bytes());
        assert!(StreamFrame::decode(&encoded).is_err());
    }

    #[test]
    fn ctl_message_length_excludes_header() {
        let encoded = encode_ctl_message(b"{\"id\":\"bye\"}");
        assert_eq!(
            u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize,
            b"{\"id\":\"bye\"}".len()
        );
        assert_eq!(&encoded[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn ctl_message_roundtrip() {
        let payload = br#"{"success":true}"#;
        let encoded = encode_ctl_message(payload);
        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = read_ctl_message(&mut cursor).expect("read");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn ctl_message_truncated() {
        let mut encoded = encode_ctl_message(b"{}");
        encoded.truncate(9);
        let mut cursor = std::io::Cursor::new(encoded);
        assert!(read_ctl_message(&mut cursor).is_err());
    }
}
