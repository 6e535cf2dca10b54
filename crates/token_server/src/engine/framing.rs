//! WebSocket frame codecs for both protocol eras.
//!
//! Two framings share one decoder interface. The legacy era delimits a text
//! frame with a leading `0x00` and a trailing `0xFF`; a leading `0xFF`
//! followed by a length byte marks the (unused) binary variant. The modern
//! era is the opcode/mask/length framing: 7/16/64-bit payload lengths,
//! mandatory client masking, control opcodes for ping/pong/close.
//!
//! The decoder is incremental: [`FrameDecoder::feed`] appends raw bytes and
//! [`FrameDecoder::next`] yields frames until the buffer runs dry, so a
//! reader drains everything already buffered before waiting on I/O again.

use tokamak_protocol::{Draft, FrameType, Packet, ProtocolError};

// Modern-era opcodes.
const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Normal-closure status code carried in a server-initiated close frame.
pub const CLOSE_CODE_NORMAL: u16 = 1000;

/// Builds the payload of a close frame: status code plus UTF-8 reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Encodes a packet into wire bytes for the given draft.
///
/// Server frames in the modern era are never masked. The legacy era can
/// only carry text and its `0xFF 0x00` closing handshake; asking it to
/// frame anything else is an error.
pub fn encode_frame(draft: Draft, packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    match draft {
        Draft::Hixie => encode_hixie(packet),
        Draft::Hybi => encode_hybi(packet),
    }
}

fn encode_hixie(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    match packet.frame_type {
        FrameType::Text => {
            let mut frame = Vec::with_capacity(packet.payload.len() + 2);
            frame.push(0x00);
            frame.extend_from_slice(&packet.payload);
            frame.push(0xFF);
            Ok(frame)
        }
        FrameType::Close => Ok(vec![0xFF, 0x00]),
        other => Err(ProtocolError::InvalidFrame(format!(
            "legacy framing cannot carry {other:?} frames"
        ))),
    }
}

fn encode_hybi(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let opcode = match packet.frame_type {
        FrameType::Text => OP_TEXT,
        FrameType::Binary => OP_BINARY,
        FrameType::Ping => OP_PING,
        FrameType::Pong => OP_PONG,
        FrameType::Close => OP_CLOSE,
        other => {
            return Err(ProtocolError::InvalidFrame(format!(
                "cannot frame {other:?} outbound"
            )))
        }
    };

    let len = packet.payload.len();
    let mut frame = Vec::with_capacity(len + 10);
    frame.push(0x80 | opcode);
    if len < 126 {
        frame.push(len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(&packet.payload);
    Ok(frame)
}

/// Incremental frame decoder for one connection.
///
/// Feed raw bytes in, pull [`Packet`]s out. `next` returns `Ok(None)` when
/// the buffer holds no complete frame yet; callers loop on it so queued
/// frames never wait for another readiness notification.
pub struct FrameDecoder {
    draft: Draft,
    max_frame_size: usize,
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates a decoder for the negotiated draft.
    pub fn new(draft: Draft, max_frame_size: usize) -> Self {
        Self {
            draft,
            max_frame_size,
            buf: Vec::new(),
        }
    }

    /// Appends raw bytes from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete frame, if one is buffered.
    pub fn next(&mut self) -> Result<Option<Packet>, ProtocolError> {
        match self.draft {
            Draft::Hixie => self.next_hixie(),
            Draft::Hybi => self.next_hybi(),
        }
    }

    fn next_hixie(&mut self) -> Result<Option<Packet>, ProtocolError> {
        let Some(&lead) = self.buf.first() else {
            return Ok(None);
        };
        match lead {
            0x00 => {
                let Some(end) = self.buf.iter().position(|&b| b == 0xFF) else {
                    if self.buf.len() > self.max_frame_size {
                        return Err(ProtocolError::FrameTooLarge {
                            size: self.buf.len(),
                            max: self.max_frame_size,
                        });
                    }
                    return Ok(None);
                };
                let payload = self.buf[1..end].to_vec();
                self.buf.drain(..=end);
                Ok(Some(Packet::new(FrameType::Text, payload)))
            }
            0xFF => {
                // Binary variant: 0xFF, length byte, payload. A zero length
                // is the closing handshake.
                let Some(&len) = self.buf.get(1) else {
                    return Ok(None);
                };
                if len == 0 {
                    self.buf.drain(..2);
                    return Ok(Some(Packet::new(FrameType::Close, Vec::new())));
                }
                let len = len as usize;
                if self.buf.len() < 2 + len {
                    return Ok(None);
                }
                let payload = self.buf[2..2 + len].to_vec();
                self.buf.drain(..2 + len);
                Ok(Some(Packet::new(FrameType::Binary, payload)))
            }
            other => Err(ProtocolError::InvalidFrame(format!(
                "unexpected legacy lead byte 0x{other:02x}"
            ))),
        }
    }

    fn next_hybi(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];

        if b0 & 0x70 != 0 {
            return Err(ProtocolError::InvalidFrame(
                "reserved bits set without a negotiated extension".into(),
            ));
        }
        let fin = b0 & 0x80 != 0;
        let opcode = b0 & 0x0F;
        let masked = b1 & 0x80 != 0;
        if !masked {
            // Client frames must be masked.
            return Err(ProtocolError::InvalidFrame("unmasked client frame".into()));
        }

        let (payload_len, header_len) = match b1 & 0x7F {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize, 4)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len > usize::MAX as u64 {
                    return Err(ProtocolError::InvalidFrame("64-bit length overflow".into()));
                }
                (len as usize, 10)
            }
            len7 => (len7 as usize, 2),
        };

        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        let total = header_len + 4 + payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mask_key = [
            self.buf[header_len],
            self.buf[header_len + 1],
            self.buf[header_len + 2],
            self.buf[header_len + 3],
        ];
        let mut payload = self.buf[header_len + 4..total].to_vec();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask_key[i % 4];
        }
        self.buf.drain(..total);

        let frame_type = match opcode {
            OP_CONTINUATION => FrameType::Fragment,
            OP_TEXT | OP_BINARY if !fin => FrameType::Fragment,
            OP_TEXT => FrameType::Text,
            OP_BINARY => FrameType::Binary,
            OP_CLOSE => FrameType::Close,
            OP_PING => FrameType::Ping,
            OP_PONG => FrameType::Pong,
            _ => FrameType::Invalid,
        };
        Ok(Some(Packet::new(frame_type, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect()
    }

    fn client_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let key = [0x11, 0x22, 0x33, 0x44];
        let mut frame = vec![0x80 | opcode];
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        frame.extend_from_slice(&key);
        frame.extend_from_slice(&mask(payload, key));
        frame
    }

    #[test]
    fn test_legacy_text_frame_delivers_one_text_packet() {
        let mut decoder = FrameDecoder::new(Draft::Hixie, 1024);
        decoder.feed(&[0x00, b'h', b'i', 0xFF]);

        let packet = decoder.next().unwrap().unwrap();
        assert_eq!(packet.frame_type, FrameType::Text);
        assert_eq!(packet.as_text(), Some("hi"));
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn test_legacy_incremental_feed() {
        let mut decoder = FrameDecoder::new(Draft::Hixie, 1024);
        decoder.feed(&[0x00, b'a']);
        assert!(decoder.next().unwrap().is_none());
        decoder.feed(&[b'b', 0xFF]);
        let packet = decoder.next().unwrap().unwrap();
        assert_eq!(packet.as_text(), Some("ab"));
    }

    #[test]
    fn test_legacy_drains_queued_frames_without_more_io() {
        let mut decoder = FrameDecoder::new(Draft::Hixie, 1024);
        decoder.feed(&[0x00, b'1', 0xFF, 0x00, b'2', 0xFF, 0x00, b'3', 0xFF]);

        let mut texts = Vec::new();
        while let Some(packet) = decoder.next().unwrap() {
            texts.push(packet.as_text().unwrap().to_string());
        }
        assert_eq!(texts, ["1", "2", "3"]);
    }

    #[test]
    fn test_legacy_closing_handshake() {
        let mut decoder = FrameDecoder::new(Draft::Hixie, 1024);
        decoder.feed(&[0xFF, 0x00]);
        let packet = decoder.next().unwrap().unwrap();
        assert_eq!(packet.frame_type, FrameType::Close);
    }

    #[test]
    fn test_legacy_bad_lead_byte() {
        let mut decoder = FrameDecoder::new(Draft::Hixie, 1024);
        decoder.feed(&[0x42]);
        assert!(matches!(
            decoder.next(),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_modern_masked_text_round_trip() {
        let mut decoder = FrameDecoder::new(Draft::Hybi, 1024);
        decoder.feed(&client_frame(0x1, b"hello"));

        let packet = decoder.next().unwrap().unwrap();
        assert_eq!(packet.frame_type, FrameType::Text);
        assert_eq!(packet.as_text(), Some("hello"));
    }

    #[test]
    fn test_modern_sixteen_bit_length() {
        let payload = vec![0xAB; 300];
        let mut decoder = FrameDecoder::new(Draft::Hybi, 1024);
        decoder.feed(&client_frame(0x2, &payload));

        let packet = decoder.next().unwrap().unwrap();
        assert_eq!(packet.frame_type, FrameType::Binary);
        assert_eq!(packet.payload, payload);
    }

    #[test]
    fn test_modern_unmasked_client_frame_rejected() {
        let mut decoder = FrameDecoder::new(Draft::Hybi, 1024);
        decoder.feed(&[0x81, 0x02, b'h', b'i']);
        assert!(matches!(
            decoder.next(),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_modern_oversize_frame_rejected() {
        let mut decoder = FrameDecoder::new(Draft::Hybi, 16);
        decoder.feed(&client_frame(0x1, &[b'x'; 64]));
        assert!(matches!(
            decoder.next(),
            Err(ProtocolError::FrameTooLarge { size: 64, max: 16 })
        ));
    }

    #[test]
    fn test_modern_unknown_opcode_is_invalid_frame_type() {
        let mut decoder = FrameDecoder::new(Draft::Hybi, 1024);
        decoder.feed(&client_frame(0x3, b"?"));
        let packet = decoder.next().unwrap().unwrap();
        assert_eq!(packet.frame_type, FrameType::Invalid);
    }

    #[test]
    fn test_modern_continuation_maps_to_fragment() {
        let mut decoder = FrameDecoder::new(Draft::Hybi, 1024);
        // FIN=0 TEXT then FIN=1 CONTINUATION.
        let key = [9, 9, 9, 9];
        let mut first = vec![0x01, 0x80 | 3];
        first.extend_from_slice(&key);
        first.extend_from_slice(&mask(b"abc", key));
        decoder.feed(&first);
        decoder.feed(&client_frame(0x0, b"def"));

        assert_eq!(
            decoder.next().unwrap().unwrap().frame_type,
            FrameType::Fragment
        );
        assert_eq!(
            decoder.next().unwrap().unwrap().frame_type,
            FrameType::Fragment
        );
    }

    #[test]
    fn test_modern_incremental_header() {
        let frame = client_frame(0x1, b"chunked");
        let mut decoder = FrameDecoder::new(Draft::Hybi, 1024);
        for byte in &frame[..frame.len() - 1] {
            decoder.feed(&[*byte]);
            assert!(decoder.next().unwrap().is_none());
        }
        decoder.feed(&frame[frame.len() - 1..]);
        assert_eq!(decoder.next().unwrap().unwrap().as_text(), Some("chunked"));
    }

    #[test]
    fn test_encode_modern_text() {
        let bytes = encode_frame(Draft::Hybi, &Packet::text("ok")).unwrap();
        assert_eq!(bytes, vec![0x81, 0x02, b'o', b'k']);
    }

    #[test]
    fn test_encode_modern_extended_length() {
        let payload = vec![0u8; 200];
        let bytes = encode_frame(Draft::Hybi, &Packet::binary(payload)).unwrap();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(bytes[1], 126);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 200);
    }

    #[test]
    fn test_encode_legacy_text() {
        let bytes = encode_frame(Draft::Hixie, &Packet::text("hi")).unwrap();
        assert_eq!(bytes, vec![0x00, b'h', b'i', 0xFF]);
    }

    #[test]
    fn test_encode_legacy_rejects_binary() {
        assert!(encode_frame(Draft::Hixie, &Packet::binary(vec![1])).is_err());
    }

    #[test]
    fn test_close_payload_layout() {
        let payload = close_payload(CLOSE_CODE_NORMAL, "bye");
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"bye");
    }
}
