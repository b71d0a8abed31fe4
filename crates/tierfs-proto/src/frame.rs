//! Frame header codec.
//!
//! Wire layout, all fields big-endian:
//!
//! ```text
//! magic(2) | id(2) | cmd(2) | kind(1) | status(1) | payload_len(4) | payload
//! ```
//!
//! The header is a fixed 12-byte array and the payload a separately
//! allocated buffer; the two are written back to back on the socket.

use serde::de::DeserializeOwned;

use crate::command::Command;
use crate::constants::{
    FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_STAT_FINISH, FRAME_STAT_OK, MAX_PAYLOAD_SIZE,
};
use crate::error::{FsError, FsResult};
use crate::msg;

/// Direction of a frame: a peer-initiated request or a reply to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
}

impl FrameKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Decoded fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: u16,
    pub cmd: Command,
    pub kind: FrameKind,
    pub status: u8,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Encode into network byte order.
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..2].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        buf[2..4].copy_from_slice(&self.id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.cmd.as_u16().to_be_bytes());
        buf[6] = self.kind as u8;
        buf[7] = self.status;
        buf[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decode and validate a header read off the wire.
    ///
    /// Any malformed field is a protocol violation: the stream can no
    /// longer be trusted to be aligned on frame boundaries.
    pub fn decode(buf: &[u8; FRAME_HEADER_LEN]) -> FsResult<Self> {
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != FRAME_MAGIC {
            return Err(FsError::ProtocolViolation);
        }
        let id = u16::from_be_bytes([buf[2], buf[3]]);
        let cmd = Command::try_from(u16::from_be_bytes([buf[4], buf[5]]))?;
        let kind = FrameKind::from_u8(buf[6]).ok_or(FsError::ProtocolViolation)?;
        let status = buf[7];
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FsError::ProtocolViolation);
        }
        Ok(Self {
            id,
            cmd,
            kind,
            status,
            payload_len,
        })
    }
}

/// One header + payload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub cmd: Command,
    pub kind: FrameKind,
    pub status: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a request frame. The id is assigned by the connection.
    pub fn request(cmd: Command, status: u8, payload: Vec<u8>) -> Self {
        Self {
            id: 0,
            cmd,
            kind: FrameKind::Request,
            status,
            payload,
        }
    }

    /// Build the response to `req`, copying its id and command.
    pub fn response_to(req: &Frame, status: u8, payload: Vec<u8>) -> Self {
        Self {
            id: req.id,
            cmd: req.cmd,
            kind: FrameKind::Response,
            status,
            payload,
        }
    }

    /// Header describing this frame.
    pub fn header(&self) -> FsResult<FrameHeader> {
        let payload_len = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or(FsError::InvalidParms)?;
        Ok(FrameHeader {
            id: self.id,
            cmd: self.cmd,
            kind: self.kind,
            status: self.status,
            payload_len,
        })
    }

    /// Rebuild a frame from a decoded header and its payload.
    pub fn from_parts(header: FrameHeader, payload: Vec<u8>) -> Self {
        Self {
            id: header.id,
            cmd: header.cmd,
            kind: header.kind,
            status: header.status,
            payload,
        }
    }

    /// Whether this frame terminates a chunked transfer.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.status == FRAME_STAT_FINISH
    }

    /// Fail with the carried error status, if any.
    pub fn check_status(&self) -> FsResult<()> {
        match FsError::from_status(self.status) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Check the status, then decode a bincode payload.
    pub fn decode_ok<T: DeserializeOwned>(&self) -> FsResult<T> {
        self.check_status()?;
        msg::decode(&self.payload)
    }

    /// Decode a bincode payload regardless of status.
    pub fn decode<T: DeserializeOwned>(&self) -> FsResult<T> {
        msg::decode(&self.payload)
    }

    /// Whether the status is plain success.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == FRAME_STAT_OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let cases = [
            (0u16, Command::HeartbeatEstablish, FrameKind::Request, FRAME_STAT_OK, 0u32),
            (1, Command::UploadAppend, FrameKind::Request, FRAME_STAT_OK, 5 * 1024 * 1024),
            (u16::MAX, Command::DownloadAppend, FrameKind::Response, FRAME_STAT_FINISH, 0),
            (0x1234, Command::Metrics, FrameKind::Response, 3, MAX_PAYLOAD_SIZE),
        ];
        for (id, cmd, kind, status, payload_len) in cases {
            let hdr = FrameHeader {
                id,
                cmd,
                kind,
                status,
                payload_len,
            };
            let decoded = FrameHeader::decode(&hdr.encode()).unwrap();
            assert_eq!(decoded, hdr);
        }
    }

    #[test]
    fn test_header_is_network_order() {
        let hdr = FrameHeader {
            id: 0x0102,
            cmd: Command::SyncOpen,
            kind: FrameKind::Response,
            status: 7,
            payload_len: 0x0a0b0c0d,
        };
        assert_eq!(
            hdr.encode(),
            [0x74, 0x66, 0x01, 0x02, 0x00, 0x05, 0x01, 0x07, 0x0a, 0x0b, 0x0c, 0x0d]
        );
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let hdr = FrameHeader {
            id: 1,
            cmd: Command::HeartbeatPing,
            kind: FrameKind::Request,
            status: 0,
            payload_len: 0,
        };
        let mut buf = hdr.encode();
        buf[0] = 0xde;
        assert_eq!(FrameHeader::decode(&buf), Err(FsError::ProtocolViolation));
    }

    #[test]
    fn test_header_rejects_unknown_command_and_kind() {
        let hdr = FrameHeader {
            id: 1,
            cmd: Command::HeartbeatPing,
            kind: FrameKind::Request,
            status: 0,
            payload_len: 0,
        };
        let mut buf = hdr.encode();
        buf[4..6].copy_from_slice(&Command::COUNT.to_be_bytes());
        assert_eq!(FrameHeader::decode(&buf), Err(FsError::ProtocolViolation));

        let mut buf = hdr.encode();
        buf[6] = 2;
        assert_eq!(FrameHeader::decode(&buf), Err(FsError::ProtocolViolation));
    }

    #[test]
    fn test_header_rejects_oversized_payload() {
        let hdr = FrameHeader {
            id: 1,
            cmd: Command::UploadAppend,
            kind: FrameKind::Request,
            status: 0,
            payload_len: MAX_PAYLOAD_SIZE,
        };
        let mut buf = hdr.encode();
        buf[8..12].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert_eq!(FrameHeader::decode(&buf), Err(FsError::ProtocolViolation));
    }

    #[test]
    fn test_response_copies_request_id() {
        let mut req = Frame::request(Command::DownloadOpen, FRAME_STAT_OK, b"x".to_vec());
        req.id = 42;
        let resp = Frame::response_to(&req, FsError::NotFound.to_status(), Vec::new());
        assert_eq!(resp.id, 42);
        assert_eq!(resp.kind, FrameKind::Response);
        assert_eq!(resp.check_status(), Err(FsError::NotFound));
    }
}
