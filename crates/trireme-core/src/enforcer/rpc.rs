//! Length-prefixed RPC frames between the proxy enforcer and a remote
//! datapath.
//!
//! A frame is a big-endian `u32` length followed by a JSON body.
//! Oversized frames are rejected before allocation.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::CidrV4;
use crate::policy::PuInfo;
use crate::secrets::SecretsSpec;

/// Maximum accepted frame body.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Errors produced by frame IO.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Socket IO failed.
    #[error("rpc io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer announced a frame above [`MAX_FRAME_LEN`].
    #[error("rpc frame too large: {len} bytes")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
    },

    /// The frame body was not valid JSON for the expected type.
    #[error("rpc frame decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Commands accepted by a remote datapath.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Enforce or update a PU.
    Enforce {
        /// Context identifier.
        context_id: String,
        /// Policy and runtime payload.
        pu: PuInfo,
    },
    /// Stop enforcing a PU.
    Unenforce {
        /// Context identifier.
        context_id: String,
    },
    /// Hot-swap signing material.
    UpdateSecrets {
        /// Declarative secrets description.
        spec: SecretsSpec,
    },
    /// Replace the target networks.
    SetTargetNetworks {
        /// New target CIDRs; empty means intercept everything.
        networks: Vec<CidrV4>,
    },
    /// Start the remote datapath.
    Start,
    /// Stop the remote datapath.
    Stop,
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The command succeeded.
    Ok,
    /// The command failed.
    Err {
        /// Failure description.
        message: String,
    },
}

/// Writes one frame to `writer`.
///
/// # Errors
///
/// Returns [`RpcError::Io`] on socket failure and
/// [`RpcError::FrameTooLarge`] if the serialized body exceeds the
/// frame budget.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), RpcError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge { len: body.len() });
    }

    let mut frame = BytesMut::with_capacity(4 + body.len());
    #[allow(clippy::cast_possible_truncation)]
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);

    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame from `reader`.
///
/// # Errors
///
/// Returns [`RpcError::FrameTooLarge`] before reading an oversized
/// body, and [`RpcError::Io`] / [`RpcError::Decode`] otherwise.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T, RpcError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = (&header[..]).get_u32() as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge { len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let request = Request::Unenforce {
            context_id: "ctx-1".to_string(),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();

        let decoded: Request = read_frame(&mut buf.as_slice()).unwrap();
        assert!(matches!(
            decoded,
            Request::Unenforce { context_id } if context_id == "ctx-1"
        ));
    }

    #[test]
    fn test_multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Response::Ok).unwrap();
        write_frame(
            &mut buf,
            &Response::Err {
                message: "boom".to_string(),
            },
        )
        .unwrap();

        let mut cursor = buf.as_slice();
        assert!(matches!(
            read_frame::<_, Response>(&mut cursor).unwrap(),
            Response::Ok
        ));
        assert!(matches!(
            read_frame::<_, Response>(&mut cursor).unwrap(),
            Response::Err { message } if message == "boom"
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_before_read() {
        let mut buf = Vec::new();
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());

        assert!(matches!(
            read_frame::<_, Response>(&mut buf.as_slice()),
            Err(RpcError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_frame_is_io_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Response::Ok).unwrap();
        buf.truncate(buf.len() - 2);

        assert!(matches!(
            read_frame::<_, Response>(&mut buf.as_slice()),
            Err(RpcError::Io(_))
        ));
    }
}
