// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed JSON framing.
//!
//! Each message, in both directions, is a 4-byte big-endian unsigned length
//! followed by exactly that many bytes of UTF-8 JSON. No magic bytes, no
//! compression.

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Outcome of decoding one inbound frame.
///
/// Protocol-level rejections are items, not stream errors: the caller
/// decides whether to answer and whether the connection survives. Only real
/// I/O failures surface as errors and terminate the stream.
#[derive(Debug)]
pub enum InboundFrame<T> {
    Frame(T),
    /// Declared length exceeds the configured maximum; the connection must
    /// be closed after one error response.
    Oversize { len: usize, max: usize },
    /// Zero-length frame; recoverable.
    Empty,
    /// The payload was not valid JSON for the expected schema; recoverable.
    Malformed(serde_json::Error),
}

/// Codec over one direction of an IPC stream: decodes `In` frames, encodes
/// `Out` frames. Servers use [`ServerCodec`], clients the reverse alias.
#[derive(Debug)]
pub struct IpcCodec<In, Out> {
    max_payload: usize,
    _phantom: PhantomData<(In, Out)>,
}

pub type ServerCodec = IpcCodec<crate::protocol::IpcRequest, crate::protocol::IpcResponse>;
pub type ClientCodec = IpcCodec<crate::protocol::IpcResponse, crate::protocol::IpcRequest>;

impl<In, Out> IpcCodec<In, Out> {
    pub fn new(max_payload: usize) -> Self {
        IpcCodec {
            max_payload,
            _phantom: PhantomData,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl<In, Out> Default for IpcCodec<In, Out> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl<In, Out> Clone for IpcCodec<In, Out> {
    fn clone(&self) -> Self {
        Self::new(self.max_payload)
    }
}

impl<In: DeserializeOwned, Out> Decoder for IpcCodec<In, Out> {
    type Item = InboundFrame<In>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<InboundFrame<In>>> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 {
            src.advance(LENGTH_PREFIX_LEN);
            return Ok(Some(InboundFrame::Empty));
        }
        if len > self.max_payload {
            // Only the prefix is consumed; the connection is torn down
            // right after the error response, so the oversize body is
            // never read.
            src.advance(LENGTH_PREFIX_LEN);
            return Ok(Some(InboundFrame::Oversize {
                len,
                max: self.max_payload,
            }));
        }
        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(len);
        match serde_json::from_slice(&payload) {
            Ok(item) => Ok(Some(InboundFrame::Frame(item))),
            Err(e) => Ok(Some(InboundFrame::Malformed(e))),
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for IpcCodec<In, Out> {
    type Error = io::Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> io::Result<()> {
        let payload =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if payload.len() > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame payload exceeds the 4-byte length prefix",
            ));
        }
        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IpcRequest, IpcResponse};
    use serde_json::json;

    fn frame(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        buf
    }

    fn expect_frame<T: std::fmt::Debug>(decoded: Option<InboundFrame<T>>) -> T {
        match decoded {
            Some(InboundFrame::Frame(item)) => item,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_what_it_encodes() {
        let mut codec = ServerCodec::default();
        let req = IpcRequest::new("GET", "/health").with_data(json!({"probe": true}));

        let mut buf = BytesMut::new();
        let mut client = ClientCodec::default();
        client.encode(req.clone(), &mut buf).unwrap();

        let decoded = expect_frame(codec.decode(&mut buf).unwrap());
        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn wire_length_matches_prefix() {
        let mut codec = ServerCodec::default();
        let resp = IpcResponse::success(json!({"status": "healthy"}), Some("r".into()));
        let mut buf = BytesMut::new();
        codec.encode(resp, &mut buf).unwrap();

        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(buf.len(), LENGTH_PREFIX_LEN + declared);
        assert!(serde_json::from_slice::<IpcResponse>(&buf[LENGTH_PREFIX_LEN..]).is_ok());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = ServerCodec::default();
        let full = frame(br#"{"method":"GET","path":"/health"}"#);

        // Deliver the frame one byte at a time; nothing decodes early.
        let mut buf = BytesMut::new();
        for (i, b) in full.iter().enumerate() {
            buf.put_u8(*b);
            let out = codec.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(out.is_none());
            } else {
                assert_eq!(expect_frame(out).path, "/health");
            }
        }
    }

    #[test]
    fn oversize_frame_is_flagged() {
        let mut codec: ServerCodec = IpcCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u32(2048);
        buf.extend_from_slice(&[b'x'; 16]);
        match codec.decode(&mut buf).unwrap() {
            Some(InboundFrame::Oversize { len, max }) => {
                assert_eq!(len, 2048);
                assert_eq!(max, 1024);
            }
            other => panic!("expected Oversize, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_frame_is_flagged_but_recoverable() {
        let mut codec = ServerCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        // A valid frame queued right behind the empty one.
        buf.extend_from_slice(&frame(br#"{"method":"GET","path":"/health"}"#));

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundFrame::Empty)
        ));
        let decoded = expect_frame(codec.decode(&mut buf).unwrap());
        assert_eq!(decoded.path, "/health");
    }

    #[test]
    fn malformed_json_is_flagged_but_recoverable() {
        let mut codec = ServerCodec::default();
        let mut buf = frame(b"{not json");
        buf.extend_from_slice(&frame(br#"{"method":"GET","path":"/health"}"#));

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundFrame::Malformed(_))
        ));
        let decoded = expect_frame(codec.decode(&mut buf).unwrap());
        assert_eq!(decoded.method, "GET");
    }
}
