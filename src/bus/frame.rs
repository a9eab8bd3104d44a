// This file is part of gglite, a lightweight IoT edge agent runtime
// Copyright (C) 2023 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Wire framing for the core bus.
//!
//! A frame is a u32 length prefix followed by the frame body:
//!
//! ```text
//! {u8 request_type}{i32 stream_id}[u16 len + method][u32 error_kind]{payload}
//! ```
//!
//! `method` is only present on Call/Notify, `error_kind` only on
//! ErrorResponse. The payload is a codec-encoded value and runs to the end
//! of the body; an empty payload decodes as null. The numeric request type
//! tags and error kind codes are wire contract and must stay stable.

use std::convert::{TryFrom, TryInto};

use async_std::prelude::*;

use crate::error::{Error, ErrorKind};
use crate::object::{self, Buffer, Value};

/// Maximum frame body length in bytes.
///
/// Frames longer than this are a protocol violation and terminate the
/// connection.
pub const MAX_MSG_LEN: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Call,
    Notify,
    Response,
    StreamMessage,
    StreamClose,
    ErrorResponse,
}

impl RequestType {
    fn code(self) -> u8 {
        match self {
            RequestType::Call => 0,
            RequestType::Notify => 1,
            RequestType::Response => 2,
            RequestType::StreamMessage => 3,
            RequestType::StreamClose => 4,
            RequestType::ErrorResponse => 5,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        let ty = match code {
            0 => RequestType::Call,
            1 => RequestType::Notify,
            2 => RequestType::Response,
            3 => RequestType::StreamMessage,
            4 => RequestType::StreamClose,
            5 => RequestType::ErrorResponse,
            _ => return None,
        };

        Some(ty)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub request_type: RequestType,
    pub stream_id: i32,
    pub method: Option<Buffer>,
    pub error_kind: Option<ErrorKind>,
    pub payload: Value,
}

impl Frame {
    pub fn call(method: impl Into<Buffer>, payload: Value) -> Self {
        Frame {
            request_type: RequestType::Call,
            stream_id: 0,
            method: Some(method.into()),
            error_kind: None,
            payload,
        }
    }

    pub fn notify(method: impl Into<Buffer>, payload: Value) -> Self {
        Frame {
            request_type: RequestType::Notify,
            ..Frame::call(method, payload)
        }
    }

    pub fn response(stream_id: i32, payload: Value) -> Self {
        Frame {
            request_type: RequestType::Response,
            stream_id,
            method: None,
            error_kind: None,
            payload,
        }
    }

    pub fn stream_message(stream_id: i32, payload: Value) -> Self {
        Frame {
            request_type: RequestType::StreamMessage,
            ..Frame::response(stream_id, payload)
        }
    }

    pub fn stream_close(stream_id: i32) -> Self {
        Frame {
            request_type: RequestType::StreamClose,
            ..Frame::response(stream_id, Value::Null)
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Frame {
            request_type: RequestType::ErrorResponse,
            stream_id: 0,
            method: None,
            error_kind: Some(kind),
            payload: Value::Null,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();

        body.push(self.request_type.code());
        body.extend_from_slice(&self.stream_id.to_le_bytes());

        match self.request_type {
            RequestType::Call | RequestType::Notify => {
                let method = self
                    .method
                    .as_ref()
                    .ok_or_else(|| Error::new(ErrorKind::Invalid, "frame without method"))?;
                let len = u16::try_from(method.len())
                    .map_err(|_| Error::new(ErrorKind::Range, "method name too long"))?;
                body.extend_from_slice(&len.to_le_bytes());
                body.extend_from_slice(method.as_bytes());
            }
            RequestType::ErrorResponse => {
                let kind = self.error_kind.unwrap_or(ErrorKind::Failure);
                body.extend_from_slice(&kind.code().to_le_bytes());
            }
            _ => {}
        }

        if self.payload != Value::Null || self.request_type == RequestType::Response {
            body.extend_from_slice(&object::serialize(&self.payload)?);
        }

        if body.len() > MAX_MSG_LEN {
            return Err(Error::new(
                ErrorKind::Range,
                format!("frame body of {} bytes exceeds limit", body.len()),
            ));
        }

        Ok(body)
    }

    fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 5 {
            return Err(Error::new(ErrorKind::Parse, "frame body too short"));
        }

        let request_type = RequestType::from_code(body[0])
            .ok_or_else(|| Error::new(ErrorKind::Parse, format!("unknown frame type {}", body[0])))?;
        let stream_id = i32::from_le_bytes(body[1..5].try_into().unwrap());
        let mut rest = &body[5..];

        let method = match request_type {
            RequestType::Call | RequestType::Notify => {
                if rest.len() < 2 {
                    return Err(Error::new(ErrorKind::Parse, "truncated method name"));
                }
                let len = u16::from_le_bytes(rest[..2].try_into().unwrap()) as usize;
                rest = &rest[2..];
                if rest.len() < len {
                    return Err(Error::new(ErrorKind::Parse, "truncated method name"));
                }
                let method = Buffer::from(&rest[..len]);
                rest = &rest[len..];
                Some(method)
            }
            _ => None,
        };

        let error_kind = match request_type {
            RequestType::ErrorResponse => {
                if rest.len() < 4 {
                    return Err(Error::new(ErrorKind::Parse, "truncated error kind"));
                }
                let code = u32::from_le_bytes(rest[..4].try_into().unwrap());
                rest = &rest[4..];
                Some(
                    ErrorKind::from_code(code).ok_or_else(|| {
                        Error::new(ErrorKind::Parse, format!("unknown error kind {}", code))
                    })?,
                )
            }
            _ => None,
        };

        let payload = if rest.is_empty() {
            Value::Null
        } else {
            object::deserialize(rest)?
        };

        Ok(Frame {
            request_type,
            stream_id,
            method,
            error_kind,
            payload,
        })
    }
}

/// Read one frame.
///
/// Short reads are retried by the runtime until the frame is complete.
/// A body length above [`MAX_MSG_LEN`] fails with `Range` without reading
/// the body; the caller is expected to drop the connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, Error>
where
    R: async_std::io::Read + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MSG_LEN {
        return Err(Error::new(
            ErrorKind::Range,
            format!("peer announced a frame of {} bytes", len),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Frame::decode(&body)
}

/// Write one frame.
///
/// Callers serialize concurrent writers per connection; the frame itself is
/// written with a single buffer so a successful return means the whole
/// frame is out.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), Error>
where
    W: async_std::io::Write + Unpin,
{
    let body = frame.encode()?;

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);

    writer.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_std::io::Cursor;
    use async_std::task::block_on;

    use super::{read_frame, write_frame, Frame, RequestType, MAX_MSG_LEN};
    use crate::error::ErrorKind;
    use crate::object::{Buffer, Map, Value};

    fn round_trip(frame: &Frame) -> Frame {
        block_on(async {
            let mut buf = Cursor::new(Vec::new());
            write_frame(&mut buf, frame).await.unwrap();

            let mut buf = Cursor::new(buf.into_inner());
            read_frame(&mut buf).await.unwrap()
        })
    }

    #[test]
    fn call_round_trip() {
        let frame = Frame::call(
            "publish",
            Value::Map(Map::new().with("topic", "a/b").with("qos", 1i64)),
        );

        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn error_round_trip() {
        let frame = Frame::error(ErrorKind::NoEntry);
        let restored = round_trip(&frame);

        assert_eq!(restored.request_type, RequestType::ErrorResponse);
        assert_eq!(restored.error_kind, Some(ErrorKind::NoEntry));
    }

    #[test]
    fn stream_frames_round_trip() {
        let msg = Frame::stream_message(7, Value::Bool(true));
        assert_eq!(round_trip(&msg), msg);

        let close = Frame::stream_close(7);
        let restored = round_trip(&close);
        assert_eq!(restored.request_type, RequestType::StreamClose);
        assert_eq!(restored.stream_id, 7);
        assert_eq!(restored.payload, Value::Null);
    }

    #[test]
    fn max_size_frame_accepted_oversize_rejected() {
        // Fixed frame overhead: 1 type + 4 stream id + 2 method len +
        // 7 method bytes, plus 5 bytes payload header (tag + u32 length).
        let overhead = 1 + 4 + 2 + 7 + 5;

        let fits = Frame::call(
            "publish",
            Value::Buf(Buffer::from(vec![0u8; MAX_MSG_LEN - overhead])),
        );
        let restored = round_trip(&fits);
        assert_eq!(restored.payload, fits.payload);

        let too_big = Frame::call(
            "publish",
            Value::Buf(Buffer::from(vec![0u8; MAX_MSG_LEN - overhead + 1])),
        );
        let err = block_on(async {
            let mut buf = Cursor::new(Vec::new());
            write_frame(&mut buf, &too_big).await.unwrap_err()
        });
        assert_eq!(err.kind(), ErrorKind::Range);
    }

    #[test]
    fn oversize_length_prefix_rejected_on_read() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((MAX_MSG_LEN + 1) as u32).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);

        let err = block_on(async {
            let mut buf = Cursor::new(bytes);
            read_frame(&mut buf).await.unwrap_err()
        });
        assert_eq!(err.kind(), ErrorKind::Range);
    }

    #[test]
    fn garbage_body_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xff]);

        let err = block_on(async {
            let mut buf = Cursor::new(bytes);
            read_frame(&mut buf).await.unwrap_err()
        });
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}
