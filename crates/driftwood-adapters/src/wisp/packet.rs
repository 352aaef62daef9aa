use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

const PACKET_CONNECT: u8 = 0x01;
const PACKET_DATA: u8 = 0x02;
const PACKET_CONTINUE: u8 = 0x03;
const PACKET_CLOSE: u8 = 0x04;

/// type byte + little-endian stream id
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Tcp,
    Udp,
}

impl StreamType {
    fn as_u8(self) -> u8 {
        match self {
            StreamType::Tcp => 0x01,
            StreamType::Udp => 0x02,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(StreamType::Tcp),
            0x02 => Some(StreamType::Udp),
            _ => None,
        }
    }
}

/// Reason carried by a CLOSE packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unknown,
    Voluntary,
    NetworkError,
    InvalidInfo,
    Unreachable,
    NoResponse,
    Refused,
    TcpTimeout,
    Blocked,
    Throttled,
    ClientError,
    Other(u8),
}

impl CloseReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => CloseReason::Unknown,
            0x02 => CloseReason::Voluntary,
            0x03 => CloseReason::NetworkError,
            0x41 => CloseReason::InvalidInfo,
            0x42 => CloseReason::Unreachable,
            0x43 => CloseReason::NoResponse,
            0x44 => CloseReason::Refused,
            0x47 => CloseReason::TcpTimeout,
            0x48 => CloseReason::Blocked,
            0x49 => CloseReason::Throttled,
            0x81 => CloseReason::ClientError,
            other => CloseReason::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            CloseReason::Unknown => 0x01,
            CloseReason::Voluntary => 0x02,
            CloseReason::NetworkError => 0x03,
            CloseReason::InvalidInfo => 0x41,
            CloseReason::Unreachable => 0x42,
            CloseReason::NoResponse => 0x43,
            CloseReason::Refused => 0x44,
            CloseReason::TcpTimeout => 0x47,
            CloseReason::Blocked => 0x48,
            CloseReason::Throttled => 0x49,
            CloseReason::ClientError => 0x81,
            CloseReason::Other(value) => value,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Unknown => "Unknown",
            CloseReason::Voluntary => "Voluntary",
            CloseReason::NetworkError => "Network error",
            CloseReason::InvalidInfo => "Invalid destination",
            CloseReason::Unreachable => "Host unreachable",
            CloseReason::NoResponse => "No response",
            CloseReason::Refused => "Connection refused",
            CloseReason::TcpTimeout => "TCP timeout",
            CloseReason::Blocked => "Blocked",
            CloseReason::Throttled => "Throttled",
            CloseReason::ClientError => "Client error",
            CloseReason::Other(_) => "Unrecognized reason",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Other(value) => write!(f, "{} ({value:#04x})", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Connect {
        stream_type: StreamType,
        port: u16,
        host: String,
    },
    Data(Bytes),
    Continue {
        buffer_remaining: u32,
    },
    Close(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_id: u32,
    pub payload: Payload,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated wisp packet ({0} bytes)")]
    Truncated(usize),
    #[error("unknown wisp packet type {0:#04x}")]
    UnknownType(u8),
    #[error("unknown stream type {0:#04x}")]
    UnknownStreamType(u8),
    #[error("CONNECT hostname is not valid UTF-8")]
    Hostname,
}

impl Packet {
    pub fn connect(stream_id: u32, stream_type: StreamType, host: &str, port: u16) -> Self {
        Self {
            stream_id,
            payload: Payload::Connect {
                stream_type,
                port,
                host: host.to_string(),
            },
        }
    }

    pub fn data(stream_id: u32, data: Bytes) -> Self {
        Self {
            stream_id,
            payload: Payload::Data(data),
        }
    }

    pub fn continue_with(stream_id: u32, buffer_remaining: u32) -> Self {
        Self {
            stream_id,
            payload: Payload::Continue { buffer_remaining },
        }
    }

    pub fn close(stream_id: u32, reason: CloseReason) -> Self {
        Self {
            stream_id,
            payload: Payload::Close(reason),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload_len());
        buf.put_u8(match self.payload {
            Payload::Connect { .. } => PACKET_CONNECT,
            Payload::Data(_) => PACKET_DATA,
            Payload::Continue { .. } => PACKET_CONTINUE,
            Payload::Close(_) => PACKET_CLOSE,
        });
        buf.put_u32_le(self.stream_id);
        match &self.payload {
            Payload::Connect {
                stream_type,
                port,
                host,
            } => {
                buf.put_u8(stream_type.as_u8());
                buf.put_u16_le(*port);
                buf.put_slice(host.as_bytes());
            }
            Payload::Data(data) => buf.put_slice(data),
            Payload::Continue { buffer_remaining } => buf.put_u32_le(*buffer_remaining),
            Payload::Close(reason) => buf.put_u8(reason.as_u8()),
        }
        buf.freeze()
    }

    fn payload_len(&self) -> usize {
        match &self.payload {
            Payload::Connect { host, .. } => 3 + host.len(),
            Payload::Data(data) => data.len(),
            Payload::Continue { .. } => 4,
            Payload::Close(_) => 1,
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        let total = buf.len();
        if total < HEADER_LEN {
            return Err(DecodeError::Truncated(total));
        }
        let packet_type = buf.get_u8();
        let stream_id = buf.get_u32_le();

        let payload = match packet_type {
            PACKET_CONNECT => {
                if buf.remaining() < 3 {
                    return Err(DecodeError::Truncated(total));
                }
                let raw_type = buf.get_u8();
                let stream_type = StreamType::from_u8(raw_type)
                    .ok_or(DecodeError::UnknownStreamType(raw_type))?;
                let port = buf.get_u16_le();
                let host = String::from_utf8(buf.to_vec()).map_err(|_| DecodeError::Hostname)?;
                Payload::Connect {
                    stream_type,
                    port,
                    host,
                }
            }
            PACKET_DATA => Payload::Data(buf),
            PACKET_CONTINUE => {
                if buf.remaining() < 4 {
                    return Err(DecodeError::Truncated(total));
                }
                Payload::Continue {
                    buffer_remaining: buf.get_u32_le(),
                }
            }
            PACKET_CLOSE => {
                if buf.remaining() < 1 {
                    return Err(DecodeError::Truncated(total));
                }
                Payload::Close(CloseReason::from_u8(buf.get_u8()))
            }
            other => return Err(DecodeError::UnknownType(other)),
        };

        Ok(Self { stream_id, payload })
    }
}
