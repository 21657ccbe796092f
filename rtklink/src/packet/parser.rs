//! Scanner that cuts RTCM3, UBX and NMEA frames out of a mixed byte stream.

use super::{PacketKind, PacketParser, RtkPacket};

/// Bytes held while waiting for a frame to complete before giving up.
const MAX_PENDING: usize = 4096;

/// Longest NMEA sentence accepted before the leading `$` is declared spurious.
const MAX_NMEA_LEN: usize = 120;

/// Longest UBX payload considered plausible on a correction link.
const MAX_UBX_PAYLOAD: usize = 2048;

/// Stateful frame splitter for `auto` and `ubx` streams.
///
/// Recognizes UBX frames (sync `B5 62`, checksum validated), RTCM3 frames
/// (sync `D3`, length from the 10-bit header field, CRC not validated) and
/// NMEA sentences (`$` up to newline). Anything else is emitted as
/// [`PacketKind::Unknown`] runs so that statistics still see the bytes.
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser for FrameParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<RtkPacket> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            match scan(&self.buf) {
                Scan::Emit { consumed, kind } => {
                    let payload: Vec<u8> = self.buf.drain(..consumed).collect();
                    out.push(RtkPacket::new(kind, payload));
                }
                Scan::NeedMore => {
                    // A frame start that never completes must not buffer forever.
                    if self.buf.len() > MAX_PENDING {
                        let payload = std::mem::take(&mut self.buf);
                        out.push(RtkPacket::new(PacketKind::Unknown, payload));
                    }
                    break;
                }
            }
        }
        out
    }
}

enum Scan {
    Emit { consumed: usize, kind: PacketKind },
    NeedMore,
}

enum FrameCheck {
    Complete { len: usize, kind: PacketKind },
    Incomplete,
    NotAFrame,
}

fn is_sync_byte(byte: u8) -> bool {
    byte == 0xB5 || byte == 0xD3 || byte == b'$'
}

fn scan(buf: &[u8]) -> Scan {
    if buf.is_empty() {
        return Scan::NeedMore;
    }
    match frame_at(buf) {
        FrameCheck::Complete { len, kind } => Scan::Emit {
            consumed: len,
            kind,
        },
        FrameCheck::Incomplete => Scan::NeedMore,
        FrameCheck::NotAFrame => {
            // Coalesce the junk run up to the next candidate sync byte.
            let run = buf
                .iter()
                .skip(1)
                .position(|&b| is_sync_byte(b))
                .map(|i| i + 1)
                .unwrap_or(buf.len());
            Scan::Emit {
                consumed: run,
                kind: PacketKind::Unknown,
            }
        }
    }
}

fn frame_at(buf: &[u8]) -> FrameCheck {
    match buf[0] {
        0xB5 => ubx_at(buf),
        0xD3 => rtcm_at(buf),
        b'$' => nmea_at(buf),
        _ => FrameCheck::NotAFrame,
    }
}

fn ubx_at(buf: &[u8]) -> FrameCheck {
    if buf.len() < 2 {
        return FrameCheck::Incomplete;
    }
    if buf[1] != 0x62 {
        return FrameCheck::NotAFrame;
    }
    if buf.len() < 6 {
        return FrameCheck::Incomplete;
    }
    let payload_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
    if payload_len > MAX_UBX_PAYLOAD {
        return FrameCheck::NotAFrame;
    }
    let total = 6 + payload_len + 2;
    if buf.len() < total {
        return FrameCheck::Incomplete;
    }
    let (ck_a, ck_b) = ubx_checksum(&buf[2..6 + payload_len]);
    if buf[total - 2] != ck_a || buf[total - 1] != ck_b {
        return FrameCheck::NotAFrame;
    }
    FrameCheck::Complete {
        len: total,
        kind: PacketKind::Ubx,
    }
}

fn rtcm_at(buf: &[u8]) -> FrameCheck {
    if buf.len() < 3 {
        return FrameCheck::Incomplete;
    }
    // The six bits above the length field are reserved and must be zero.
    if buf[1] & 0xFC != 0 {
        return FrameCheck::NotAFrame;
    }
    let payload_len = (((buf[1] & 0x03) as usize) << 8) | buf[2] as usize;
    let total = 3 + payload_len + 3;
    if buf.len() < total {
        return FrameCheck::Incomplete;
    }
    FrameCheck::Complete {
        len: total,
        kind: PacketKind::Rtcm,
    }
}

fn nmea_at(buf: &[u8]) -> FrameCheck {
    let limit = buf.len().min(MAX_NMEA_LEN);
    if let Some(pos) = buf[..limit].iter().position(|&b| b == b'\n') {
        return FrameCheck::Complete {
            len: pos + 1,
            kind: PacketKind::Nmea,
        };
    }
    if buf.len() >= MAX_NMEA_LEN {
        FrameCheck::NotAFrame
    } else {
        FrameCheck::Incomplete
    }
}

/// Fletcher checksum over the class, id, length and payload bytes.
pub(crate) fn ubx_checksum(body: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;
    for &byte in body {
        ck_a = ck_a.wrapping_add(byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

/// Builds a complete UBX frame with sync bytes and checksum.
pub(crate) fn ubx_frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&[0xB5, 0x62, class, id]);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    let (ck_a, ck_b) = ubx_checksum(&frame[2..]);
    frame.push(ck_a);
    frame.push(ck_b);
    frame
}
