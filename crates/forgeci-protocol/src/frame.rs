// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stream framing for runner-service calls.
//!
//! A frame is a 6-byte header followed by a protobuf payload:
//!
//! ```text
//! +----------------+--------------+------------------+
//! | length: u32 BE | kind: u16 BE | payload (length) |
//! +----------------+--------------+------------------+
//! ```
//!
//! Every stream carries exactly one request frame and one response (or
//! error) frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on the payload of a single frame.
///
/// Task payloads carry the job's workflow bytes plus context, secrets and
/// predecessor outputs; 16 MiB leaves ample headroom for those while still
/// bounding what a peer can make us buffer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes of header preceding every payload.
pub const HEADER_SIZE: usize = 6;

/// Frame kind carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// A call envelope from the runner.
    Request = 1,
    /// A successful method response.
    Response = 2,
    /// A structured error instead of a method response.
    Error = 3,
}

impl MessageType {
    fn from_wire(kind: u16) -> Result<Self, FrameError> {
        match kind {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::Error),
            other => Err(FrameError::InvalidMessageType(other)),
        }
    }
}

/// Framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME_SIZE} byte cap")]
    FrameTooLarge(usize),

    #[error("unknown frame kind {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    fn truncated(what: &'static str) -> Self {
        FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            what,
        ))
    }
}

/// One framed message, kind plus encoded payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Frame a request message.
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    /// Frame a response message.
    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    /// Frame an error message.
    pub fn error<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Error, msg)
    }

    /// Encode `msg` into a frame of the given kind.
    pub fn new<M: Message>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = msg.encode_to_vec();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: payload.into(),
        })
    }

    /// Decode the payload as `M`.
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Serialize header and payload into one buffer.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        out.put_u32(self.payload.len() as u32);
        out.put_u16(self.message_type as u16);
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    /// Parse a frame out of a contiguous buffer.
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::truncated("incomplete frame header"));
        }
        let length = bytes.get_u32() as usize;
        let message_type = MessageType::from_wire(bytes.get_u16())?;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        if bytes.len() < length {
            return Err(FrameError::truncated("incomplete frame payload"));
        }
        Ok(Self {
            message_type,
            payload: bytes.split_to(length),
        })
    }
}

/// Write one frame to `writer`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

/// Read one frame from `reader`.
///
/// EOF on the header boundary reads as [`FrameError::ConnectionClosed`];
/// EOF anywhere else is a truncation error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let length = match reader.read_u32().await {
        Ok(length) => length as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    };
    let message_type = MessageType::from_wire(reader.read_u16().await?)?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: payload.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner_proto::{FetchTaskRequest, LogRow, UpdateLogRequest};

    #[test]
    fn test_frame_kind_wire_values() {
        for kind in [
            MessageType::Request,
            MessageType::Response,
            MessageType::Error,
        ] {
            assert_eq!(MessageType::from_wire(kind as u16).unwrap(), kind);
        }
        for bad in [0u16, 4, u16::MAX] {
            assert!(MessageType::from_wire(bad).is_err());
        }
    }

    #[test]
    fn test_frame_encode_decode() {
        let msg = FetchTaskRequest {
            tasks_version: 3,
            task_capacity: 1,
            request_key: "abc".to_string(),
        };
        let frame = Frame::request(&msg).unwrap();
        let decoded = Frame::decode_from_bytes(frame.encode()).unwrap();

        assert_eq!(decoded.message_type, MessageType::Request);
        let round_tripped: FetchTaskRequest = decoded.decode().unwrap();
        assert_eq!(round_tripped.request_key, "abc");
        assert_eq!(round_tripped.tasks_version, 3);
    }

    #[test]
    fn test_header_layout() {
        let msg = FetchTaskRequest::default();
        let frame = Frame::request(&msg).unwrap();
        let encoded = frame.encode();

        let length = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        let kind = u16::from_be_bytes(encoded[4..6].try_into().unwrap());
        assert_eq!(length, frame.payload.len());
        assert_eq!(kind, MessageType::Request as u16);
        assert_eq!(encoded.len(), HEADER_SIZE + frame.payload.len());
    }

    #[test]
    fn test_truncated_buffers_rejected() {
        // Partial header.
        assert!(Frame::decode_from_bytes(Bytes::from_static(&[0, 0, 0])).is_err());

        // Header promises more payload than the buffer holds.
        let mut short = BytesMut::new();
        short.put_u32(100);
        short.put_u16(1);
        short.extend_from_slice(&[0u8; 10]);
        assert!(Frame::decode_from_bytes(short.freeze()).is_err());
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut bytes = BytesMut::new();
        bytes.put_u32((MAX_FRAME_SIZE + 1) as u32);
        bytes.put_u16(1);

        match Frame::decode_from_bytes(bytes.freeze()).unwrap_err() {
            FrameError::FrameTooLarge(size) => assert_eq!(size, MAX_FRAME_SIZE + 1),
            e => panic!("expected FrameTooLarge, got {e:?}"),
        }
    }

    #[test]
    fn test_log_chunk_survives_framing() {
        let msg = UpdateLogRequest {
            task_id: 9,
            index: 100,
            rows: (0..50)
                .map(|i| LogRow {
                    time: 1_700_000_000 + i,
                    content: format!("line {i}"),
                })
                .collect(),
        };
        let frame = Frame::request(&msg).unwrap();
        let decoded: UpdateLogRequest = Frame::decode_from_bytes(frame.encode())
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(decoded.rows.len(), 50);
        assert_eq!(decoded.index, 100);
    }

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        let msg = FetchTaskRequest {
            tasks_version: 1,
            task_capacity: 1,
            request_key: String::new(),
        };
        let frame = Frame::request(&msg).unwrap();

        let (mut writer, mut reader) = tokio::io::duplex(1024);
        write_frame(&mut writer, &frame).await.unwrap();

        let read = read_frame(&mut reader).await.unwrap();
        assert_eq!(read.message_type, frame.message_type);
        assert_eq!(read.payload, frame.payload);
    }

    #[tokio::test]
    async fn test_eof_at_header_is_connection_closed() {
        let (_writer, mut reader) = tokio::io::duplex(1024);
        drop(_writer);
        match read_frame(&mut reader).await.unwrap_err() {
            FrameError::ConnectionClosed => {}
            e => panic!("expected ConnectionClosed, got {e:?}"),
        }
    }
}
