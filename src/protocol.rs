//! Tuya wire protocol implementation.
//! Handles packet framing, header parsing, CRC verification and
//! reassembly of frames split across socket reads.

use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const SUFFIX_55AA: u32 = 0x0000AA55;

/// Prefix(4) + Seq(4) + Cmd(4) + Len(4)
pub const HEADER_LEN: usize = 16;
/// CRC(4) + Suffix(4)
pub const FOOTER_LEN: usize = 8;
/// Upper bound on a declared frame body; anything larger is treated as garbage.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const PREFIX_BYTES: [u8; 4] = PREFIX_55AA.to_be_bytes();
/// Start marker of a clear-text status object.
const JSON_START: &[u8] = b"{\"devId";
/// Closing marker of a clear-text status object (`dps` map + outer object).
const JSON_END: &[u8] = b"}}";

define_command_type! {
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
    DpQueryNew = 0x10,
    UpdateDps = 0x12,
}

define_version! {
    V3_1 = ("3.1", 3.1),
    V3_3 = ("3.3", 3.3),
}

impl Default for Version {
    fn default() -> Self {
        Version::V3_3
    }
}

/// Tuya protocol message structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuyaMessage {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Return code (device replies only)
    pub retcode: Option<u32>,
    /// Actual payload (JSON or encrypted binary)
    pub payload: Vec<u8>,
}

/// Tuya protocol header structure
#[derive(Debug, Clone)]
pub struct TuyaHeader {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Length field: body + CRC + suffix
    pub payload_len: u32,
    /// Total message length (header + payload)
    pub total_length: usize,
}

/// Outcome of [`decode`] over a receive buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A full, checksummed frame; `consumed` includes any skipped leading bytes.
    Complete { message: TuyaMessage, consumed: usize },
    /// A clear-text status object found without framing.
    Unframed { json: Vec<u8>, consumed: usize },
    /// More bytes are needed; nothing is consumed.
    Incomplete,
    /// Bytes that can never form a frame; drop `consumed` and carry on.
    Invalid { consumed: usize, error: TuyaError },
}

/// Pack TuyaMessage into binary data.
pub fn pack_message(msg: &TuyaMessage) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(HEADER_LEN + msg.payload.len() + FOOTER_LEN + 4);

    let mut body_len = msg.payload.len() + FOOTER_LEN;
    if msg.retcode.is_some() {
        body_len += 4;
    }

    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(msg.seqno)?;
    data.write_u32::<BigEndian>(msg.cmd)?;
    data.write_u32::<BigEndian>(body_len as u32)?;
    if let Some(rc) = msg.retcode {
        data.write_u32::<BigEndian>(rc)?;
    }
    data.extend_from_slice(&msg.payload);

    let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    let crc_val = crc32.checksum(&data);
    data.write_u32::<BigEndian>(crc_val)?;
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;

    Ok(data)
}

/// Parse Tuya header from binary data.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_LEN {
        return Err(TuyaError::DecodeError("Header too short".into()));
    }

    let mut cursor = Cursor::new(data);
    if cursor.read_u32::<BigEndian>()? != PREFIX_55AA {
        return Err(TuyaError::InvalidHeader);
    }
    let seqno = cursor.read_u32::<BigEndian>()?;
    let cmd = cursor.read_u32::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;

    if (payload_len as usize) < FOOTER_LEN || payload_len as usize > MAX_FRAME_LEN {
        return Err(TuyaError::DecodeError(format!(
            "Implausible frame length {}",
            payload_len
        )));
    }

    Ok(TuyaHeader {
        seqno,
        cmd,
        payload_len,
        total_length: HEADER_LEN + payload_len as usize,
    })
}

/// Unpack one complete frame (exactly `header.total_length` bytes or more).
///
/// `no_retcode`: `Some(false)` always reads a return code, `Some(true)` never
/// does, `None` auto-detects it.
pub fn unpack_message(
    data: &[u8],
    header: &TuyaHeader,
    no_retcode: Option<bool>,
) -> Result<TuyaMessage> {
    let msg_len = header.total_length;
    if data.len() < msg_len {
        return Err(TuyaError::DecodeError("Data shorter than expected".into()));
    }

    let payload_end = msg_len - FOOTER_LEN;
    let footer = &data[payload_end..msg_len];

    if BigEndian::read_u32(&footer[4..]) != SUFFIX_55AA {
        return Err(TuyaError::DecodeError("Missing frame suffix".into()));
    }

    let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    let calc_crc = crc32.checksum(&data[..payload_end]);
    if calc_crc != BigEndian::read_u32(&footer[..4]) {
        return Err(TuyaError::CrcMismatch);
    }

    let mut payload_start = HEADER_LEN;
    let mut retcode = None;

    let body = &data[payload_start..payload_end];
    let should_parse_retcode = match no_retcode {
        Some(no) => !no,
        // Auto-detect: not JSON, not a version header, and room for 4 bytes
        None => {
            body.len() >= 4
                && body[0] != b'{'
                && (body[0] == 0 || (body.len() > 4 && body[0] != b'3'))
        }
    };
    if should_parse_retcode && body.len() >= 4 {
        retcode = Some(BigEndian::read_u32(&body[..4]));
        payload_start += 4;
    }

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode,
        payload: data[payload_start..payload_end].to_vec(),
    })
}

/// Locate and decode the first frame in `data`.
///
/// Bytes before the first prefix are skipped. When no prefix is present at
/// all, a clear-text `{"devId ... }}` object is accepted instead.
/// `no_retcode` is passed through to [`unpack_message`].
pub fn decode(data: &[u8], no_retcode: Option<bool>) -> Decoded {
    let Some(start) = find(data, &PREFIX_BYTES) else {
        return decode_unframed(data);
    };

    let frame = &data[start..];
    if frame.len() < HEADER_LEN {
        return Decoded::Incomplete;
    }

    let header = match parse_header(frame) {
        Ok(h) => h,
        Err(error) => {
            // Not a real frame start: skip past this prefix and rescan later.
            return Decoded::Invalid {
                consumed: start + PREFIX_BYTES.len(),
                error,
            };
        }
    };

    if frame.len() < header.total_length {
        return Decoded::Incomplete;
    }

    let consumed = start + header.total_length;
    match unpack_message(frame, &header, no_retcode) {
        Ok(message) => Decoded::Complete { message, consumed },
        Err(error) => Decoded::Invalid { consumed, error },
    }
}

fn decode_unframed(data: &[u8]) -> Decoded {
    match find(data, JSON_START) {
        Some(start) => match find(&data[start..], JSON_END) {
            Some(end) => {
                let stop = start + end + JSON_END.len();
                Decoded::Unframed {
                    json: data[start..stop].to_vec(),
                    consumed: stop,
                }
            }
            None => Decoded::Invalid {
                consumed: data.len(),
                error: TuyaError::DecodeError("Unterminated status object".into()),
            },
        },
        None => {
            // Keep a tail long enough to hold a marker split across reads.
            let keep = JSON_START.len() - 1;
            if data.len() > keep {
                Decoded::Invalid {
                    consumed: data.len() - keep,
                    error: TuyaError::DecodeError("No frame start found".into()),
                }
            } else {
                Decoded::Incomplete
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Accumulates socket reads and yields frames as they complete.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    no_retcode: Option<bool>,
}

impl FrameBuffer {
    /// Buffer that auto-detects return codes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer for frames sent by a device, which always carry a return code.
    pub fn device_replies() -> Self {
        Self {
            buf: Vec::new(),
            no_retcode: Some(false),
        }
    }

    /// Buffer for frames sent to a device, which never carry a return code.
    pub fn device_requests() -> Self {
        Self {
            buf: Vec::new(),
            no_retcode: Some(true),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Decodes the next unit from the buffer, draining whatever it consumed.
    /// Returns `None` once the buffer needs more data.
    pub fn next_frame(&mut self) -> Option<Decoded> {
        if self.buf.is_empty() {
            return None;
        }
        let decoded = decode(&self.buf, self.no_retcode);
        match &decoded {
            Decoded::Incomplete => return None,
            Decoded::Complete { consumed, .. }
            | Decoded::Unframed { consumed, .. }
            | Decoded::Invalid { consumed, .. } => {
                self.buf.drain(..*consumed);
            }
        }
        Some(decoded)
    }
}
