//! Wire format of LTP segments (RFC 5326).
//!
//! ```ascii
//! 0: version (high nibble, always 0) | segment type flags (low nibble)
//! *: session originator engine id (SDNV)
//! *: session number (SDNV)
//! *: header extension count (high nibble) | trailer extension count (low nibble)
//! *: header extensions: tag (u8), value length (SDNV), value
//! *: segment content, depending on the segment type
//! *: trailer extensions, same encoding as header extensions
//! ```
//!
//! Segment content:
//! * data segments: client service id, offset, length, and for checkpoints the checkpoint serial
//!   number and the report serial number, all SDNV, followed by `length` bytes of client service data
//! * report segment: report serial number, checkpoint serial number, upper bound, lower bound,
//!   number of reception claims, and then offset and length for each claim (all SDNV). Claim
//!   offsets are relative to the lower bound.
//! * report acknowledgement: the report serial number (SDNV)
//! * cancel segments: the reason code (u8)
//! * cancel acknowledgements: nothing
//!
//! SDNVs ('self delimiting numeric values') are big-endian base 128: every byte carries seven bits
//!  of the value, the high bit is set on all bytes except the last.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use crate::session_id::SessionId;

/// a u64 needs at most 10 groups of 7 bits
pub const MAX_SDNV_LEN: usize = 10;

const LTP_VERSION: u8 = 0;
const MAX_EXTENSIONS: usize = 0x0f;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CancelSegmentReasonCode {
    UserCancelled = 0,
    Unreachable = 1,
    RetransmissionLimitExceeded = 2,
    Miscolored = 3,
    SystemCancelled = 4,
    RetransmissionCycleLimitExceeded = 5,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SegmentType {
    RedData = 0,
    RedDataCheckpoint = 1,
    RedDataCheckpointEndOfRedPart = 2,
    RedDataCheckpointEndOfRedPartEndOfBlock = 3,
    GreenData = 4,
    GreenDataEndOfBlock = 7,
    ReportSegment = 8,
    ReportAckSegment = 9,
    CancelFromSender = 12,
    CancelAckToSender = 13,
    CancelFromReceiver = 14,
    CancelAckToReceiver = 15,
}

impl SegmentType {
    pub fn is_data(self) -> bool {
        u8::from(self) <= 7
    }

    pub fn is_red_data(self) -> bool {
        u8::from(self) <= 3
    }

    pub fn is_green_data(self) -> bool {
        matches!(self, SegmentType::GreenData | SegmentType::GreenDataEndOfBlock)
    }

    pub fn is_checkpoint(self) -> bool {
        matches!(self,
            SegmentType::RedDataCheckpoint |
            SegmentType::RedDataCheckpointEndOfRedPart |
            SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock)
    }

    pub fn is_end_of_red_part(self) -> bool {
        matches!(self, SegmentType::RedDataCheckpointEndOfRedPart | SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock)
    }

    pub fn is_end_of_block(self) -> bool {
        matches!(self, SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock | SegmentType::GreenDataEndOfBlock)
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SegmentParseError {
    #[error("segment is truncated")]
    Truncated,
    #[error("unsupported LTP version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid segment type flags {0:#x}")]
    InvalidSegmentType(u8),
    #[error("SDNV does not fit into 64 bits")]
    SdnvOverflow,
    #[error("invalid cancel reason code {0}")]
    InvalidReasonCode(u8),
    #[error("data segment without client service data")]
    EmptyDataSegment,
    #[error("data segment range exceeds 64 bits")]
    DataRangeOverflow,
    #[error("report segment bounds or claims are inconsistent")]
    InvalidReportBounds,
    #[error("{0} unexpected bytes after the end of the segment")]
    TrailingBytes(usize),
}

pub fn put_sdnv(buf: &mut impl BufMut, value: u64) {
    let mut encoded = [0u8; MAX_SDNV_LEN];
    let mut start = MAX_SDNV_LEN;
    let mut remaining = value;
    loop {
        start -= 1;
        encoded[start] = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining == 0 {
            break;
        }
    }
    for b in &mut encoded[start..MAX_SDNV_LEN - 1] {
        *b |= 0x80;
    }
    buf.put_slice(&encoded[start..]);
}

pub fn sdnv_len(value: u64) -> usize {
    let significant_bits = 64 - value.leading_zeros() as usize;
    significant_bits.div_ceil(7).max(1)
}

pub fn try_get_sdnv(buf: &mut impl Buf) -> Result<u64, SegmentParseError> {
    let mut result: u64 = 0;
    for _ in 0..MAX_SDNV_LEN {
        let b = try_get_u8(buf)?;
        if result > u64::MAX >> 7 {
            return Err(SegmentParseError::SdnvOverflow);
        }
        result = (result << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(SegmentParseError::SdnvOverflow)
}

fn try_get_u8(buf: &mut impl Buf) -> Result<u8, SegmentParseError> {
    if !buf.has_remaining() {
        return Err(SegmentParseError::Truncated);
    }
    Ok(buf.get_u8())
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CheckpointSerials {
    pub checkpoint_serial_number: u64,
    /// the report this checkpoint is a response to, 0 for checkpoints sent during the first pass
    pub report_serial_number: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataSegment {
    pub segment_type: SegmentType,
    pub client_service_id: u64,
    pub offset: u64,
    pub length: u64,
    pub checkpoint: Option<CheckpointSerials>,
    /// client service data. This may be empty for outbound segments whose data is appended
    ///  separately (e.g. read from disk), `length` is authoritative on the wire.
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReceptionClaim {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReportSegment {
    pub report_serial_number: u64,
    pub checkpoint_serial_number: u64,
    pub upper_bound: u64,
    pub lower_bound: u64,
    pub claims: Vec<ReceptionClaim>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Extension {
    pub tag: u8,
    pub value: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SegmentContent {
    Data(DataSegment),
    Report(ReportSegment),
    ReportAck { report_serial_number: u64 },
    CancelFromSender(CancelSegmentReasonCode),
    CancelAckToSender,
    CancelFromReceiver(CancelSegmentReasonCode),
    CancelAckToReceiver,
}

impl SegmentContent {
    pub fn segment_type(&self) -> SegmentType {
        match self {
            SegmentContent::Data(data) => data.segment_type,
            SegmentContent::Report(_) => SegmentType::ReportSegment,
            SegmentContent::ReportAck { .. } => SegmentType::ReportAckSegment,
            SegmentContent::CancelFromSender(_) => SegmentType::CancelFromSender,
            SegmentContent::CancelAckToSender => SegmentType::CancelAckToSender,
            SegmentContent::CancelFromReceiver(_) => SegmentType::CancelFromReceiver,
            SegmentContent::CancelAckToReceiver => SegmentType::CancelAckToReceiver,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Segment {
    pub session_id: SessionId,
    pub content: SegmentContent,
    pub header_extensions: Vec<Extension>,
    pub trailer_extensions: Vec<Extension>,
}

impl Segment {
    pub fn new(session_id: SessionId, content: SegmentContent) -> Segment {
        Segment {
            session_id,
            content,
            header_extensions: Vec::new(),
            trailer_extensions: Vec::new(),
        }
    }

    /// Encodes everything before a data segment's client service data, and the trailer
    ///  extensions. For segments without client service data, the first buffer holds the entire
    ///  content.
    pub fn encode_framing(&self) -> (Bytes, Bytes) {
        debug_assert!(self.header_extensions.len() <= MAX_EXTENSIONS);
        debug_assert!(self.trailer_extensions.len() <= MAX_EXTENSIONS);

        let mut head = BytesMut::with_capacity(64);
        head.put_u8((LTP_VERSION << 4) | u8::from(self.content.segment_type()));
        put_sdnv(&mut head, self.session_id.originator_engine_id);
        put_sdnv(&mut head, self.session_id.session_number);
        head.put_u8(((self.header_extensions.len() as u8) << 4) | (self.trailer_extensions.len() as u8 & 0x0f));
        put_extensions(&mut head, &self.header_extensions);

        match &self.content {
            SegmentContent::Data(data) => {
                put_sdnv(&mut head, data.client_service_id);
                put_sdnv(&mut head, data.offset);
                put_sdnv(&mut head, data.length);
                if let Some(checkpoint) = &data.checkpoint {
                    put_sdnv(&mut head, checkpoint.checkpoint_serial_number);
                    put_sdnv(&mut head, checkpoint.report_serial_number);
                }
            }
            SegmentContent::Report(report) => {
                put_sdnv(&mut head, report.report_serial_number);
                put_sdnv(&mut head, report.checkpoint_serial_number);
                put_sdnv(&mut head, report.upper_bound);
                put_sdnv(&mut head, report.lower_bound);
                put_sdnv(&mut head, report.claims.len() as u64);
                for claim in &report.claims {
                    put_sdnv(&mut head, claim.offset);
                    put_sdnv(&mut head, claim.length);
                }
            }
            SegmentContent::ReportAck { report_serial_number } => {
                put_sdnv(&mut head, *report_serial_number);
            }
            SegmentContent::CancelFromSender(reason) | SegmentContent::CancelFromReceiver(reason) => {
                head.put_u8((*reason).into());
            }
            SegmentContent::CancelAckToSender | SegmentContent::CancelAckToReceiver => {}
        }

        let mut trailer = BytesMut::new();
        put_extensions(&mut trailer, &self.trailer_extensions);

        (head.freeze(), trailer.freeze())
    }

    /// The encoded segment as a list of buffers, avoiding a copy of client service data
    pub fn encode(&self) -> Vec<Bytes> {
        let (head, trailer) = self.encode_framing();
        let mut result = vec![head];
        if let SegmentContent::Data(data) = &self.content {
            if !data.data.is_empty() {
                result.push(data.data.clone());
            }
        }
        if !trailer.is_empty() {
            result.push(trailer);
        }
        result
    }

    pub fn to_bytes(&self) -> Bytes {
        let parts = self.encode();
        if parts.len() == 1 {
            return parts.into_iter().next().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            buf.put_slice(&part);
        }
        buf.freeze()
    }

    /// Parses a single segment from a datagram. Client service data refers to the original buffer.
    pub fn parse(mut buf: Bytes) -> Result<Segment, SegmentParseError> {
        let flags = try_get_u8(&mut buf)?;
        let version = flags >> 4;
        if version != LTP_VERSION {
            return Err(SegmentParseError::UnsupportedVersion(version));
        }
        let segment_type = SegmentType::try_from(flags & 0x0f)
            .map_err(|_| SegmentParseError::InvalidSegmentType(flags & 0x0f))?;

        let originator_engine_id = try_get_sdnv(&mut buf)?;
        let session_number = try_get_sdnv(&mut buf)?;
        let extension_counts = try_get_u8(&mut buf)?;
        let header_extensions = parse_extensions(&mut buf, extension_counts >> 4)?;

        let content = match segment_type {
            SegmentType::ReportSegment => SegmentContent::Report(parse_report(&mut buf)?),
            SegmentType::ReportAckSegment => SegmentContent::ReportAck { report_serial_number: try_get_sdnv(&mut buf)? },
            SegmentType::CancelFromSender => SegmentContent::CancelFromSender(parse_reason_code(&mut buf)?),
            SegmentType::CancelFromReceiver => SegmentContent::CancelFromReceiver(parse_reason_code(&mut buf)?),
            SegmentType::CancelAckToSender => SegmentContent::CancelAckToSender,
            SegmentType::CancelAckToReceiver => SegmentContent::CancelAckToReceiver,
            data_type => SegmentContent::Data(parse_data(&mut buf, data_type)?),
        };

        let trailer_extensions = parse_extensions(&mut buf, extension_counts & 0x0f)?;
        if buf.has_remaining() {
            return Err(SegmentParseError::TrailingBytes(buf.remaining()));
        }

        Ok(Segment {
            session_id: SessionId::new(originator_engine_id, session_number),
            content,
            header_extensions,
            trailer_extensions,
        })
    }
}

fn put_extensions(buf: &mut BytesMut, extensions: &[Extension]) {
    for extension in extensions {
        buf.put_u8(extension.tag);
        put_sdnv(buf, extension.value.len() as u64);
        buf.put_slice(&extension.value);
    }
}

fn parse_extensions(buf: &mut Bytes, count: u8) -> Result<Vec<Extension>, SegmentParseError> {
    let mut result = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = try_get_u8(buf)?;
        let len = try_get_sdnv(buf)?;
        if (buf.remaining() as u64) < len {
            return Err(SegmentParseError::Truncated);
        }
        result.push(Extension { tag, value: buf.split_to(len as usize) });
    }
    Ok(result)
}

fn parse_data(buf: &mut Bytes, segment_type: SegmentType) -> Result<DataSegment, SegmentParseError> {
    let client_service_id = try_get_sdnv(buf)?;
    let offset = try_get_sdnv(buf)?;
    let length = try_get_sdnv(buf)?;
    let checkpoint = if segment_type.is_checkpoint() {
        Some(CheckpointSerials {
            checkpoint_serial_number: try_get_sdnv(buf)?,
            report_serial_number: try_get_sdnv(buf)?,
        })
    }
    else {
        None
    };

    if length == 0 {
        return Err(SegmentParseError::EmptyDataSegment);
    }
    if offset.checked_add(length).is_none() {
        return Err(SegmentParseError::DataRangeOverflow);
    }
    if (buf.remaining() as u64) < length {
        return Err(SegmentParseError::Truncated);
    }
    let data = buf.split_to(length as usize);

    Ok(DataSegment {
        segment_type,
        client_service_id,
        offset,
        length,
        checkpoint,
        data,
    })
}

fn parse_report(buf: &mut Bytes) -> Result<ReportSegment, SegmentParseError> {
    let report_serial_number = try_get_sdnv(buf)?;
    let checkpoint_serial_number = try_get_sdnv(buf)?;
    let upper_bound = try_get_sdnv(buf)?;
    let lower_bound = try_get_sdnv(buf)?;
    if lower_bound > upper_bound {
        return Err(SegmentParseError::InvalidReportBounds);
    }

    let num_claims = try_get_sdnv(buf)?;
    // every claim takes at least two bytes, so this bounds the allocation for garbage input
    let mut claims = Vec::with_capacity(num_claims.min(buf.remaining() as u64 / 2) as usize);
    for _ in 0..num_claims {
        let offset = try_get_sdnv(buf)?;
        let length = try_get_sdnv(buf)?;
        match offset.checked_add(length) {
            Some(end) if end <= upper_bound - lower_bound => {}
            _ => return Err(SegmentParseError::InvalidReportBounds),
        }
        claims.push(ReceptionClaim { offset, length });
    }

    Ok(ReportSegment {
        report_serial_number,
        checkpoint_serial_number,
        upper_bound,
        lower_bound,
        claims,
    })
}

fn parse_reason_code(buf: &mut Bytes) -> Result<CancelSegmentReasonCode, SegmentParseError> {
    let raw = try_get_u8(buf)?;
    CancelSegmentReasonCode::try_from(raw)
        .map_err(|_| SegmentParseError::InvalidReasonCode(raw))
}
