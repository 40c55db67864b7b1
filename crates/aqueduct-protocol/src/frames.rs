use bitflags::bitflags;

use crate::ProtocolError;

/// Shared 8 byte prefix of every UDP frame, little-endian:
/// `(frame_length: i32, version: u8, flags: u8, frame_type: u16)`.
pub const FRAME_HEADER_LENGTH: usize = 8;

pub const HDR_TYPE_PAD: u16 = 0x00;
pub const HDR_TYPE_DATA: u16 = 0x01;
pub const HDR_TYPE_NAK: u16 = 0x02;
pub const HDR_TYPE_SM: u16 = 0x03;
pub const HDR_TYPE_SETUP: u16 = 0x05;
pub const HDR_TYPE_RTTM: u16 = 0x06;

pub const CURRENT_VERSION: u8 = 0x0;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const BEGIN = 0x80;
        const END = 0x40;
        const EOS = 0x20;
        /// On a status message: the receiver wants a setup frame.
        const SEND_SETUP = 0x80;
        /// On an RTT measurement: this is the reply leg.
        const REPLY = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
}

impl FrameHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_LENGTH {
            return Err(ProtocolError::TooShort(buf.len(), "frame header"));
        }
        Ok(Self {
            frame_length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            version: buf[4],
            flags: buf[5],
            frame_type: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.frame_length.to_le_bytes());
        buf[4] = self.version;
        buf[5] = self.flags;
        buf[6..8].copy_from_slice(&self.frame_type.to_le_bytes());
    }
}

/// View over an incoming data frame. The full header layout is the log
/// buffer frame header; only the fields the receive path dispatches on are
/// decoded here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub frame_length: i32,
    pub flags: u8,
    pub frame_type: u16,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
}

pub const DATA_HEADER_LENGTH: usize = 32;

impl DataHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < DATA_HEADER_LENGTH {
            return Err(ProtocolError::TooShort(buf.len(), "data header"));
        }
        let header = FrameHeader::decode(buf)?;
        Ok(Self {
            frame_length: header.frame_length,
            flags: header.flags,
            frame_type: header.frame_type,
            term_offset: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            session_id: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            stream_id: i32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            term_id: i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.flags & FrameFlags::EOS.bits() != 0
    }

    /// Zero-length heartbeat carrying the sender's current position. On the
    /// wire the frame length field is zero and only the header is sent.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.frame_length == 0
    }
}

/// Status message: receiver flow-control feedback (type 0x03). The trailing
/// feedback word is optional; tagged flow-control strategies match on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusMessage {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub consumption_term_id: i32,
    pub consumption_term_offset: i32,
    pub receiver_window: i32,
    pub receiver_id: i64,
    pub feedback: Option<i64>,
}

pub const STATUS_MESSAGE_LENGTH: usize = 36;
pub const STATUS_MESSAGE_WITH_FEEDBACK_LENGTH: usize = STATUS_MESSAGE_LENGTH + 8;

impl StatusMessage {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < STATUS_MESSAGE_LENGTH {
            return Err(ProtocolError::TooShort(buf.len(), "status message"));
        }
        let header = FrameHeader::decode(buf)?;
        let feedback = if header.frame_length >= STATUS_MESSAGE_WITH_FEEDBACK_LENGTH as i32 &&
            buf.len() >= STATUS_MESSAGE_WITH_FEEDBACK_LENGTH
        {
            Some(i64::from_le_bytes(buf[36..44].try_into().unwrap_or([0; 8])))
        } else {
            None
        };
        Ok(Self {
            flags: header.flags,
            session_id: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            stream_id: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            consumption_term_id: i32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            consumption_term_offset: i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            receiver_window: i32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            receiver_id: i64::from_le_bytes(buf[28..36].try_into().unwrap_or([0; 8])),
            feedback,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let frame_length = if self.feedback.is_some() {
            STATUS_MESSAGE_WITH_FEEDBACK_LENGTH
        } else {
            STATUS_MESSAGE_LENGTH
        };
        let start = buf.len();
        buf.resize(start + FRAME_HEADER_LENGTH, 0);
        FrameHeader {
            frame_length: frame_length as i32,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: HDR_TYPE_SM,
        }
        .encode(&mut buf[start..]);
        buf.extend_from_slice(&self.session_id.to_le_bytes());
        buf.extend_from_slice(&self.stream_id.to_le_bytes());
        buf.extend_from_slice(&self.consumption_term_id.to_le_bytes());
        buf.extend_from_slice(&self.consumption_term_offset.to_le_bytes());
        buf.extend_from_slice(&self.receiver_window.to_le_bytes());
        buf.extend_from_slice(&self.receiver_id.to_le_bytes());
        if let Some(feedback) = self.feedback {
            buf.extend_from_slice(&feedback.to_le_bytes());
        }
    }
}

/// Negative acknowledgement requesting a retransmit (type 0x02).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NakFrame {
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

pub const NAK_LENGTH: usize = 28;

impl NakFrame {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < NAK_LENGTH {
            return Err(ProtocolError::TooShort(buf.len(), "nak"));
        }
        Ok(Self {
            session_id: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            stream_id: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            term_id: i32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            term_offset: i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            length: i32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }

    pub fn encode(&self, buf: &mut [u8; NAK_LENGTH]) {
        FrameHeader {
            frame_length: NAK_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: HDR_TYPE_NAK,
        }
        .encode(buf);
        buf[8..12].copy_from_slice(&self.session_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.term_id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.term_offset.to_le_bytes());
        buf[24..28].copy_from_slice(&self.length.to_le_bytes());
    }
}

/// Stream bootstrap parameters, sent until a status message arrives
/// (type 0x05).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupFrame {
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub term_offset: i32,
    pub term_length: i32,
    pub mtu_length: i32,
    pub ttl: i32,
}

pub const SETUP_LENGTH: usize = 40;

impl SetupFrame {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < SETUP_LENGTH {
            return Err(ProtocolError::TooShort(buf.len(), "setup"));
        }
        Ok(Self {
            session_id: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            stream_id: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            initial_term_id: i32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            active_term_id: i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            term_offset: i32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            term_length: i32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
            mtu_length: i32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]),
            ttl: i32::from_le_bytes([buf[36], buf[37], buf[38], buf[39]]),
        })
    }

    pub fn encode(&self, buf: &mut [u8; SETUP_LENGTH]) {
        FrameHeader {
            frame_length: SETUP_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: HDR_TYPE_SETUP,
        }
        .encode(buf);
        buf[8..12].copy_from_slice(&self.session_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.initial_term_id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.active_term_id.to_le_bytes());
        buf[24..28].copy_from_slice(&self.term_offset.to_le_bytes());
        buf[28..32].copy_from_slice(&self.term_length.to_le_bytes());
        buf[32..36].copy_from_slice(&self.mtu_length.to_le_bytes());
        buf[36..40].copy_from_slice(&self.ttl.to_le_bytes());
    }
}

/// Round-trip time probe and reply (type 0x06).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttMeasurement {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub echo_timestamp_ns: i64,
    pub reception_delta_ns: i64,
    pub receiver_id: i64,
}

pub const RTT_MEASUREMENT_LENGTH: usize = 40;

impl RttMeasurement {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < RTT_MEASUREMENT_LENGTH {
            return Err(ProtocolError::TooShort(buf.len(), "rtt measurement"));
        }
        let header = FrameHeader::decode(buf)?;
        Ok(Self {
            flags: header.flags,
            session_id: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            stream_id: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            echo_timestamp_ns: i64::from_le_bytes(buf[16..24].try_into().unwrap_or([0; 8])),
            reception_delta_ns: i64::from_le_bytes(buf[24..32].try_into().unwrap_or([0; 8])),
            receiver_id: i64::from_le_bytes(buf[32..40].try_into().unwrap_or([0; 8])),
        })
    }

    pub fn encode(&self, buf: &mut [u8; RTT_MEASUREMENT_LENGTH]) {
        FrameHeader {
            frame_length: RTT_MEASUREMENT_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: HDR_TYPE_RTTM,
        }
        .encode(buf);
        buf[8..12].copy_from_slice(&self.session_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.echo_timestamp_ns.to_le_bytes());
        buf[24..32].copy_from_slice(&self.reception_delta_ns.to_le_bytes());
        buf[32..40].copy_from_slice(&self.receiver_id.to_le_bytes());
    }
}
