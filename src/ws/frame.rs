//! WebSocket frame codec (RFC 6455 §5).
//!
//! Encoding writes a complete frame into a `BytesMut`; decoding is
//! incremental in the same style as the HTTP request parser — it returns
//! `Ok(None)` until a whole frame is buffered, so the reader can keep
//! appending bytes from the transport and retry.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{CloseInfo, close_code};

/// Default maximum accepted payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Returns `true` for Close, Ping, and Pong.
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

/// One wire-level frame.
///
/// Frames sent by a server are unmasked (`mask: None`); frames arriving from
/// a client carry a masking key, already applied to `payload` by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    /// A final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            mask: None,
            payload: payload.into(),
        }
    }

    /// A final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            mask: None,
            payload: payload.into(),
        }
    }

    /// A ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            mask: None,
            payload: payload.into(),
        }
    }

    /// A pong frame answering the given ping payload.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            mask: None,
            payload: payload.into(),
        }
    }

    /// A close frame carrying the given close record.
    ///
    /// The synthesized codes 1005 and 1006 must never appear on the wire
    /// (RFC 6455 §7.4.1); they serialize as an empty close payload.
    pub fn close(info: &CloseInfo) -> Self {
        let payload = if info.code == close_code::NO_STATUS || info.code == close_code::ABNORMAL {
            Bytes::new()
        } else {
            let mut buf = BytesMut::with_capacity(2 + info.reason.len());
            buf.put_u16(info.code);
            buf.put_slice(info.reason.as_bytes());
            buf.freeze()
        };
        Self {
            fin: true,
            opcode: Opcode::Close,
            mask: None,
            payload,
        }
    }

    /// Attaches a masking key (client-role frames).
    #[must_use]
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }
}

/// Frame codec violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    #[error("reserved bits set without a negotiated extension")]
    ReservedBitsSet,

    #[error("client frame is not masked")]
    UnmaskedFrame,

    #[error("server frame is masked")]
    MaskedFrame,

    #[error("control frame cannot be fragmented")]
    FragmentedControlFrame,

    #[error("control frame payload too large: {0} bytes (max 125)")]
    ControlFrameTooLarge(usize),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: usize },
}

/// Serializes one frame into `dst`, masking the payload if a key is set.
pub fn encode(frame: &Frame, dst: &mut BytesMut) {
    let payload_len = frame.payload.len();
    debug_assert!(!frame.opcode.is_control() || (frame.fin && payload_len <= 125));

    let mut first = frame.opcode.as_u8();
    if frame.fin {
        first |= 0x80;
    }
    let mask_bit: u8 = if frame.mask.is_some() { 0x80 } else { 0 };

    dst.reserve(14 + payload_len);
    dst.put_u8(first);

    if payload_len <= 125 {
        dst.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= 65535 {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(payload_len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(payload_len as u64);
    }

    match frame.mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(&frame.payload),
    }
}

// XOR the payload with the 4-byte key, cycling (RFC 6455 §5.3).
fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Incremental frame decoder for one direction of a connection.
#[derive(Debug)]
pub struct FrameDecoder {
    max_payload: usize,
    require_masked: bool,
}

impl FrameDecoder {
    /// Decoder for frames arriving at a server: masking is required.
    pub fn server() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            require_masked: true,
        }
    }

    /// Decoder for frames arriving at a client: masking is rejected.
    pub fn client() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            require_masked: false,
        }
    }

    /// Sets the maximum accepted payload size.
    #[must_use]
    pub fn max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    /// Tries to decode one complete frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `src` only once a whole frame is available.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on any protocol violation; the buffer is
    /// left untouched and the connection should be closed.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];

        let fin = first & 0x80 != 0;
        if first & 0x70 != 0 {
            return Err(FrameError::ReservedBitsSet);
        }
        let opcode = Opcode::from_u8(first & 0x0F)?;
        let masked = second & 0x80 != 0;
        let len7 = (second & 0x7F) as usize;

        if masked != self.require_masked {
            return Err(if self.require_masked {
                FrameError::UnmaskedFrame
            } else {
                FrameError::MaskedFrame
            });
        }

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if len7 > 125 {
                return Err(FrameError::ControlFrameTooLarge(len7));
            }
        }

        let (payload_len, len_bytes) = match len7 {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 2)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 8)
            }
            n => (n as u64, 0),
        };

        if payload_len > self.max_payload as u64 {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        let mask_bytes = if masked { 4 } else { 0 };
        let total = 2 + len_bytes + mask_bytes + payload_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let _ = src.split_to(2 + len_bytes);
        let mask = if masked {
            let raw = src.split_to(4);
            Some([raw[0], raw[1], raw[2], raw[3]])
        } else {
            None
        };

        let mut payload = src.split_to(payload_len as usize);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            mask,
            payload: payload.freeze(),
        }))
    }
}

/// Interprets a close-frame payload: a 2-byte code plus UTF-8 reason, or
/// 1005 when the payload carries no code.
pub fn parse_close_payload(payload: &[u8]) -> CloseInfo {
    if payload.len() < 2 {
        return CloseInfo::new(close_code::NO_STATUS, "");
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    CloseInfo::new(code, reason)
}
