//! The 12-byte yamux frame header.
//!
//! Layout, all big-endian: version(1) type(1) flags(2) stream-id(4) length(4).
//! For data frames `length` counts payload bytes; for window updates it is the
//! credit delta; ping and go-away carry their value in it.

use super::YamuxError;

pub const YAMUX_VERSION: u8 = 0;

/// Header size on the wire.
pub const HEADER_LEN: usize = 12;

pub mod flags {
    pub const SYN: u16 = 0x1;
    pub const ACK: u16 = 0x2;
    pub const FIN: u16 = 0x4;
    pub const RST: u16 = 0x8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    WindowUpdate = 1,
    Ping = 2,
    GoAway = 3,
}

impl FrameType {
    fn from_u8(v: u8) -> Result<Self, YamuxError> {
        match v {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            other => Err(YamuxError::BadFrameType(other)),
        }
    }
}

/// Session termination codes carried in a go-away frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GoAwayCode {
    Normal = 0,
    ProtocolError = 1,
    InternalError = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: u16,
    pub stream_id: u32,
    pub length: u32,
}

impl Frame {
    pub fn data(stream_id: u32, length: u32, flags: u16) -> Self {
        Self { frame_type: FrameType::Data, flags, stream_id, length }
    }

    pub fn window_update(stream_id: u32, delta: u32, flags: u16) -> Self {
        Self { frame_type: FrameType::WindowUpdate, flags, stream_id, length: delta }
    }

    pub fn ping(value: u32, flags: u16) -> Self {
        Self { frame_type: FrameType::Ping, flags, stream_id: 0, length: value }
    }

    pub fn go_away(code: GoAwayCode) -> Self {
        Self { frame_type: FrameType::GoAway, flags: 0, stream_id: 0, length: code as u32 }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = YAMUX_VERSION;
        out[1] = self.frame_type as u8;
        out[2..4].copy_from_slice(&self.flags.to_be_bytes());
        out[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, YamuxError> {
        if buf.len() < HEADER_LEN {
            return Err(YamuxError::TruncatedHeader(buf.len()));
        }
        if buf[0] != YAMUX_VERSION {
            return Err(YamuxError::BadVersion(buf[0]));
        }
        Ok(Self {
            frame_type: FrameType::from_u8(buf[1])?,
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_types() {
        let frames = [
            Frame::data(3, 1024, flags::SYN),
            Frame::window_update(4, 65536, flags::ACK),
            Frame::ping(0xdead_beef, flags::SYN),
            Frame::go_away(GoAwayCode::ProtocolError),
        ];
        for f in frames {
            let decoded = Frame::decode(&f.encode()).unwrap();
            assert_eq!(decoded, f);
        }
    }

    #[test]
    fn network_byte_order() {
        let f = Frame::data(0x0102_0304, 0x0506_0708, flags::FIN);
        let bytes = f.encode();
        assert_eq!(bytes[0], 0); // version
        assert_eq!(bytes[1], 0); // data
        assert_eq!(&bytes[2..4], &[0x00, 0x04]);
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[8..12], &[0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = Frame::ping(1, flags::SYN).encode();
        bytes[0] = 9;
        assert!(matches!(Frame::decode(&bytes), Err(YamuxError::BadVersion(9))));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut bytes = Frame::ping(1, flags::SYN).encode();
        bytes[1] = 7;
        assert!(matches!(Frame::decode(&bytes), Err(YamuxError::BadFrameType(7))));
    }
}
