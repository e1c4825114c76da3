//! Frame Codec
//!
//! Header formats shared by the MAC, RLC, PDCP, RRC and NAS layers. Every
//! multi-byte length or sequence-number field is big-endian. The codec holds
//! no state: sequence-number bookkeeping belongs to the layers.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use nom::multi::length_data;
use nom::number::complete::{be_u16, be_u8};
use nom::sequence::tuple;
use nom::IResult;
use std::fmt;
use thiserror::Error;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated frame ({0} bytes)")]
    Truncated(usize),

    #[error("Payload too large for length field: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid protocol discriminator: {0:#04x}")]
    InvalidDiscriminator(u8),
}

fn truncated<E>(input: &[u8]) -> impl FnOnce(nom::Err<E>) -> CodecError {
    let len = input.len();
    move |_| CodecError::Truncated(len)
}

/// 12-bit sequence number with modulo-4096 arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SequenceNumber(u16);

impl SequenceNumber {
    /// Number of distinct sequence numbers
    pub const MODULUS: u16 = 4096;
    const MASK: u16 = Self::MODULUS - 1;

    /// Create a sequence number, reducing the value modulo 4096
    pub fn new(value: u16) -> Self {
        Self(value & Self::MASK)
    }

    /// Raw value (0..4096)
    pub fn value(&self) -> u16 {
        self.0
    }

    /// The following sequence number, wrapping 4095 -> 0
    pub fn next(&self) -> Self {
        Self::new(self.0.wrapping_add(1))
    }

    /// Forward distance from `self` to `later`, modulo 4096
    pub fn distance_to(&self, later: SequenceNumber) -> u16 {
        later.0.wrapping_sub(self.0) & Self::MASK
    }

    fn high_nibble(&self) -> u8 {
        ((self.0 >> 8) & 0x0F) as u8
    }

    fn low_byte(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    fn from_parts(high: u8, low: u8) -> Self {
        Self::new((((high & 0x0F) as u16) << 8) | low as u16)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for SequenceNumber {
    fn from(value: u16) -> Self {
        Self::new(value)
    }
}

bitflags! {
    /// Flag bits of the first RLC / PDCP header octet
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// Data (set) or control (clear) PDU
        const DATA = 0x80;
        /// Poll for a status report
        const POLL = 0x40;
    }
}

const SI_SHIFT: u8 = 4;
const SI_MASK: u8 = 0x03;

/// MAC frame: `[lcid][length u16][payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacFrame {
    /// Logical channel ID
    pub lcid: u8,
    /// MAC SDU
    pub payload: Bytes,
}

impl MacFrame {
    /// Encode the frame
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| CodecError::PayloadTooLarge(self.payload.len()))?;

        let mut buf = BytesMut::with_capacity(3 + self.payload.len());
        buf.put_u8(self.lcid);
        buf.put_u16(len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode a frame; trailing bytes after the payload are ignored
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        fn parse(input: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
            tuple((be_u8, length_data(be_u16)))(input)
        }

        let (_, (lcid, payload)) = parse(data).map_err(truncated(data))?;
        Ok(Self {
            lcid,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// RLC acknowledged/unacknowledged mode data PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmHeader {
    /// Data/Control flag
    pub data: bool,
    /// Polling bit
    pub poll: bool,
    /// Segmentation info (2 bits)
    pub segment_info: u8,
    /// Sequence number
    pub sn: SequenceNumber,
}

impl AmHeader {
    /// Header for an unsegmented data PDU
    pub fn data(sn: SequenceNumber, poll: bool) -> Self {
        Self {
            data: true,
            poll,
            segment_info: 0,
            sn,
        }
    }

    /// Encode the header followed by `payload`
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut flags = HeaderFlags::empty();
        flags.set(HeaderFlags::DATA, self.data);
        flags.set(HeaderFlags::POLL, self.poll);

        let mut buf = BytesMut::with_capacity(2 + payload.len());
        buf.put_u8(flags.bits() | ((self.segment_info & SI_MASK) << SI_SHIFT) | self.sn.high_nibble());
        buf.put_u8(self.sn.low_byte());
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode a PDU into its header and payload
    pub fn decode(data: &[u8]) -> Result<(Self, Bytes), CodecError> {
        fn parse(input: &[u8]) -> IResult<&[u8], (u8, u8)> {
            tuple((be_u8, be_u8))(input)
        }

        let (payload, (b0, b1)) = parse(data).map_err(truncated(data))?;
        let flags = HeaderFlags::from_bits_truncate(b0);
        let header = Self {
            data: flags.contains(HeaderFlags::DATA),
            poll: flags.contains(HeaderFlags::POLL),
            segment_info: (b0 >> SI_SHIFT) & SI_MASK,
            sn: SequenceNumber::from_parts(b0, b1),
        };
        Ok((header, Bytes::copy_from_slice(payload)))
    }
}

/// RLC status PDU: `[ack SN high nibble][ack SN low byte]`
///
/// NACK lists are not serialised; they travel in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPdu {
    /// First sequence number not yet received
    pub ack_sn: SequenceNumber,
}

impl StatusPdu {
    /// Encode the status PDU
    pub fn encode(&self) -> Bytes {
        Bytes::from(vec![self.ack_sn.high_nibble(), self.ack_sn.low_byte()])
    }

    /// Decode a status PDU
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        match data {
            [high, low, ..] => Ok(Self {
                ack_sn: SequenceNumber::from_parts(*high, *low),
            }),
            _ => Err(CodecError::Truncated(data.len())),
        }
    }
}

/// PDCP data PDU header: `[D/C | SN high nibble][SN low byte]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdcpHeader {
    /// Data/Control flag
    pub data: bool,
    /// Sequence number
    pub sn: SequenceNumber,
}

impl PdcpHeader {
    /// Encode the header followed by `payload`
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let flags = if self.data {
            HeaderFlags::DATA
        } else {
            HeaderFlags::empty()
        };

        let mut buf = BytesMut::with_capacity(2 + payload.len());
        buf.put_u8(flags.bits() | self.sn.high_nibble());
        buf.put_u8(self.sn.low_byte());
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode a PDU into its header and payload
    pub fn decode(data: &[u8]) -> Result<(Self, Bytes), CodecError> {
        match data {
            [b0, b1, payload @ ..] => Ok((
                Self {
                    data: HeaderFlags::from_bits_truncate(*b0).contains(HeaderFlags::DATA),
                    sn: SequenceNumber::from_parts(*b0, *b1),
                },
                Bytes::copy_from_slice(payload),
            )),
            _ => Err(CodecError::Truncated(data.len())),
        }
    }
}

/// RRC message frame: `[type][length u16][payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrcFrame {
    /// Message type code
    pub msg_type: u8,
    /// Message body
    pub payload: Bytes,
}

impl RrcFrame {
    /// Build a frame
    pub fn new(msg_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Encode the frame
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| CodecError::PayloadTooLarge(self.payload.len()))?;

        let mut buf = BytesMut::with_capacity(3 + self.payload.len());
        buf.put_u8(self.msg_type);
        buf.put_u16(len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode a frame
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        fn parse(input: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
            tuple((be_u8, length_data(be_u16)))(input)
        }

        let (_, (msg_type, payload)) = parse(data).map_err(truncated(data))?;
        Ok(Self {
            msg_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Extended protocol discriminator for 5GS mobility management
pub const NAS_EPD_5GMM: u8 = 0x7E;
/// Plain NAS message, no security protection
pub const NAS_SECURITY_HEADER_PLAIN: u8 = 0x00;

/// NAS message frame: `[0x7E][0x00][type][seq][payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NasFrame {
    /// Message type code
    pub msg_type: u8,
    /// Sender's message sequence number
    pub seq: u8,
    /// Message body
    pub payload: Bytes,
}

impl NasFrame {
    /// Encode the frame
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u8(NAS_EPD_5GMM);
        buf.put_u8(NAS_SECURITY_HEADER_PLAIN);
        buf.put_u8(self.msg_type);
        buf.put_u8(self.seq);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        fn parse(input: &[u8]) -> IResult<&[u8], (u8, u8, u8, u8)> {
            tuple((be_u8, be_u8, be_u8, be_u8))(input)
        }

        let (payload, (epd, _security, msg_type, seq)) = parse(data).map_err(truncated(data))?;
        if epd != NAS_EPD_5GMM {
            return Err(CodecError::InvalidDiscriminator(epd));
        }

        Ok(Self {
            msg_type,
            seq,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
