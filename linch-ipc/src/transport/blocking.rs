// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Blocking request/response client.
//!
//! Used by command-line tooling and integration tests; the daemon itself is
//! fully asynchronous. One client owns one connection, and requests on it
//! are strictly sequential, matching the server's per-connection FIFO
//! contract.

use std::io::{self, Read, Write};
use std::path::Path;
#[cfg(unix)]
use std::time::Duration;

use bytes::BytesMut;
use serde_json::{json, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{ClientCodec, InboundFrame};
use crate::protocol::{IpcRequest, IpcResponse};

#[cfg(unix)]
type RawStream = std::os::unix::net::UnixStream;
#[cfg(windows)]
type RawStream = std::fs::File;

pub struct BlockingClient {
    stream: RawStream,
    codec: ClientCodec,
    read_buffer: BytesMut,
}

impl BlockingClient {
    /// Connects to the daemon endpoint: a socket path on POSIX, a full
    /// `\\.\pipe\` name on Windows.
    #[cfg(unix)]
    pub fn connect(endpoint: impl AsRef<Path>) -> io::Result<Self> {
        Ok(BlockingClient {
            stream: RawStream::connect(endpoint)?,
            codec: ClientCodec::default(),
            read_buffer: BytesMut::with_capacity(4096),
        })
    }

    #[cfg(windows)]
    pub fn connect(endpoint: impl AsRef<Path>) -> io::Result<Self> {
        let stream = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(endpoint)?;
        Ok(BlockingClient {
            stream,
            codec: ClientCodec::default(),
            read_buffer: BytesMut::with_capacity(4096),
        })
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.codec = ClientCodec::new(max_payload);
        self
    }

    #[cfg(unix)]
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    #[cfg(unix)]
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    /// Writes one framed request without waiting for its response.
    pub fn send(&mut self, request: &IpcRequest) -> io::Result<()> {
        let mut buf = BytesMut::new();
        self.codec.encode(request.clone(), &mut buf)?;
        self.stream.write_all(&buf)
    }

    /// Writes raw bytes, bypassing the framer. Only useful to probe the
    /// server's handling of malformed frames.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Reads exactly one framed response.
    pub fn recv(&mut self) -> io::Result<IpcResponse> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
                return match frame {
                    InboundFrame::Frame(response) => Ok(response),
                    InboundFrame::Oversize { len, max } => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("response frame of {len} bytes exceeds maximum of {max} bytes"),
                    )),
                    InboundFrame::Empty => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "zero-length response frame",
                    )),
                    InboundFrame::Malformed(e) => {
                        Err(io::Error::new(io::ErrorKind::InvalidData, e))
                    }
                };
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn call(&mut self, request: &IpcRequest) -> io::Result<IpcResponse> {
        self.send(request)?;
        self.recv()
    }

    pub fn request(
        &mut self,
        method: &str,
        path: &str,
        data: Option<Value>,
    ) -> io::Result<IpcResponse> {
        let mut request = IpcRequest::new(method, path);
        request.data = data;
        self.call(&request)
    }

    /// Performs the authentication handshake with this process's own PID.
    pub fn handshake(&mut self) -> io::Result<IpcResponse> {
        self.handshake_as(std::process::id() as i64)
    }

    pub fn handshake_as(&mut self, client_pid: i64) -> io::Result<IpcResponse> {
        self.request(
            "POST",
            "/auth/handshake",
            Some(json!({ "client_pid": client_pid })),
        )
    }
}
