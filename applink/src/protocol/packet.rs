//! Wire packet format for the app-link transport.
//!
//! Every frame shares a fixed big-endian header:
//!
//! ```text
//! ┌────────────────────┬────────────┬────────────┬────────────┐
//! │ Ver(4) P(1) Type(3)│ Service(8) │ FrameData(8)│ Session(8) │
//! ├────────────────────┴────────────┴────────────┴────────────┤
//! │ Payload length (u32 BE)                                   │
//! ├───────────────────────────────────────────────────────────┤
//! │ Message id (u32 BE), protocol v2 and later only           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Version 1 omits the message id; its header is 8 bytes, all later
//! versions use 12. The payload follows the header verbatim.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Header size for protocol version 1.
pub const HEADER_SIZE_V1: usize = 8;

/// Header size for protocol version 2 and later.
pub const HEADER_SIZE_V2: usize = 12;

/// Size of the First-frame payload: total size and frame count, both u32 BE.
pub const FIRST_FRAME_DATA_SIZE: usize = 8;

/// Highest consecutive-frame ordinal before the cycle wraps back to 1.
pub const FRAME_DATA_MAX_CONSECUTIVE: u8 = 0x7F;

/// Frame-data value marking the last consecutive frame of a message.
pub const FRAME_DATA_LAST_CONSECUTIVE: u8 = 0x00;

/// Frame-data values carried by control frames.
pub mod control_frame {
    pub const START_SERVICE: u8 = 0x01;
    pub const START_SERVICE_ACK: u8 = 0x02;
    pub const START_SERVICE_NACK: u8 = 0x03;
    pub const END_SERVICE: u8 = 0x04;
    pub const END_SERVICE_ACK: u8 = 0x05;
    pub const END_SERVICE_NACK: u8 = 0x06;
    /// Video flow control: payload is a 4-byte big-endian frame count.
    pub const SERVICE_DATA_ACK: u8 = 0xFD;
    pub const HEARTBEAT: u8 = 0xFE;
    pub const HEARTBEAT_ACK: u8 = 0xFF;
}

/// Protocol version carried in the header's high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Version {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
}

impl Version {
    /// Header size used by this version.
    #[must_use]
    pub const fn header_size(self) -> usize {
        match self {
            Self::V1 => HEADER_SIZE_V1,
            _ => HEADER_SIZE_V2,
        }
    }

    /// Whether packets of this version carry a message id.
    #[must_use]
    pub const fn has_message_id(self) -> bool {
        !matches!(self, Self::V1)
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Version {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            4 => Ok(Self::V4),
            other => Err(PacketError::UnknownVersion(other)),
        }
    }
}

/// Frame type carried in the header's low three bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Control = 0x00,
    Single = 0x01,
    First = 0x02,
    Consecutive = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Control),
            0x01 => Ok(Self::Single),
            0x02 => Ok(Self::First),
            0x03 => Ok(Self::Consecutive),
            other => Err(PacketError::MalformedHeader(HeaderFault::FrameType(other))),
        }
    }
}

/// Logical service a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceType {
    Control = 0x00,
    Rpc = 0x07,
    Audio = 0x0A,
    Video = 0x0B,
    Bulk = 0x0F,
}

impl ServiceType {
    /// Services carrying continuous media rather than discrete commands.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Audio | Self::Video)
    }
}

impl TryFrom<u8> for ServiceType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Control),
            0x07 => Ok(Self::Rpc),
            0x0A => Ok(Self::Audio),
            0x0B => Ok(Self::Video),
            0x0F => Ok(Self::Bulk),
            other => Err(PacketError::MalformedHeader(HeaderFault::ServiceType(
                other,
            ))),
        }
    }
}

/// The specific field a header was rejected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFault {
    FrameType(u8),
    ServiceType(u8),
    /// First frames must declare exactly [`FIRST_FRAME_DATA_SIZE`] bytes.
    FirstFrameLength(u32),
}

impl std::fmt::Display for HeaderFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameType(v) => write!(f, "frame type 0x{v:02x}"),
            Self::ServiceType(v) => write!(f, "service type 0x{v:02x}"),
            Self::FirstFrameLength(v) => write!(f, "first-frame payload length {v}"),
        }
    }
}

/// Errors produced while encoding or decoding packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Not enough bytes buffered yet; retry once more data arrives.
    #[error("need more data")]
    NeedMoreData,
    /// Header field failed validation.
    #[error("malformed header: {0}")]
    MalformedHeader(HeaderFault),
    /// Declared payload length exceeds the configured maximum.
    #[error("payload length {declared} exceeds maximum {max}")]
    PayloadTooLarge { declared: u32, max: u32 },
    /// Version nibble names a protocol this head unit does not speak.
    #[error("unknown protocol version {0}")]
    UnknownVersion(u8),
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: Version,
    /// Protection bit: payload is ciphertext for the session's cipher.
    pub protected: bool,
    pub frame_type: FrameType,
    pub service: ServiceType,
    /// Meaning depends on `frame_type`: control opcode, consecutive
    /// ordinal, or zero.
    pub frame_data: u8,
    pub session_id: u8,
    /// Absent on the wire for v1; kept zero there.
    pub message_id: u32,
    pub payload: Bytes,
}

impl Packet {
    /// Builds a control frame. Control frames are never protected.
    #[must_use]
    pub fn control(
        version: Version,
        service: ServiceType,
        frame_data: u8,
        session_id: u8,
        message_id: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            version,
            protected: false,
            frame_type: FrameType::Control,
            service,
            frame_data,
            session_id,
            message_id,
            payload,
        }
    }

    /// Total serialized size of this packet.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        self.version.header_size() + self.payload.len()
    }

    /// Serializes the packet, header first, payload verbatim.
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        let lead = (self.version.as_u8() << 4)
            | (u8::from(self.protected) << 3)
            | self.frame_type as u8;
        buf.put_u8(lead);
        buf.put_u8(self.service as u8);
        buf.put_u8(self.frame_data);
        buf.put_u8(self.session_id);
        buf.put_u32(self.payload.len() as u32);
        if self.version.has_message_id() {
            buf.put_u32(self.message_id);
        }
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Attempts to decode one packet from the front of `buf`.
    ///
    /// On success returns the packet and the number of bytes consumed.
    /// [`PacketError::NeedMoreData`] means the buffer holds a valid prefix;
    /// every other error means the header itself is unusable and the caller
    /// must resynchronize.
    pub fn deserialize(buf: &[u8], max_payload: usize) -> Result<(Self, usize), PacketError> {
        if buf.len() < HEADER_SIZE_V1 {
            return Err(PacketError::NeedMoreData);
        }
        let version = Version::try_from(buf[0] >> 4)?;
        let protected = buf[0] & 0x08 != 0;
        let frame_type = FrameType::try_from(buf[0] & 0x07)?;
        let service = ServiceType::try_from(buf[1])?;
        let frame_data = buf[2];
        let session_id = buf[3];
        let payload_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if payload_len as usize > max_payload {
            return Err(PacketError::PayloadTooLarge {
                declared: payload_len,
                max: max_payload as u32,
            });
        }
        if frame_type == FrameType::First && payload_len != FIRST_FRAME_DATA_SIZE as u32 {
            return Err(PacketError::MalformedHeader(HeaderFault::FirstFrameLength(
                payload_len,
            )));
        }

        let header_size = version.header_size();
        if buf.len() < header_size {
            return Err(PacketError::NeedMoreData);
        }
        let message_id = if version.has_message_id() {
            u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]])
        } else {
            0
        };

        let total = header_size + payload_len as usize;
        if buf.len() < total {
            return Err(PacketError::NeedMoreData);
        }

        Ok((
            Self {
                version,
                protected,
                frame_type,
                service,
                frame_data,
                session_id,
                message_id,
                payload: Bytes::copy_from_slice(&buf[header_size..total]),
            },
            total,
        ))
    }
}
