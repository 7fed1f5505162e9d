// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The loopback server that the external process reports to.

use crate::{errors::LaunchError, protocol::FrameTransport};
use std::{io, net::SocketAddr};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

/// A listener on an ephemeral port that accepts a single report connection.
#[derive(Debug)]
pub struct ReportServer {
    listener: TcpListener,
    host: String,
    local_addr: SocketAddr,
    max_frame_size: u64,
}

impl ReportServer {
    /// Binds an ephemeral port on `host`.
    ///
    /// Accepted connections reject frames larger than `max_frame_size`.
    pub async fn bind(host: &str, max_frame_size: u64) -> Result<Self, LaunchError> {
        let bind_err = |err: io::Error| LaunchError::Bind {
            host: host.to_owned(),
            err,
        };

        let addr = tokio::net::lookup_host((host, 0))
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "host did not resolve to any address",
                ))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        // Only one connection is ever serviced.
        let listener = socket.listen(1).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        debug!("report server listening on {local_addr}");

        Ok(Self {
            listener,
            host: host.to_owned(),
            local_addr,
            max_frame_size,
        })
    }

    /// The host the server was bound on, as configured.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port the server is listening on.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for a connection and wraps it in a frame transport.
    pub async fn accept(&self) -> Result<FrameTransport<TcpStream>, LaunchError> {
        let (stream, peer) = self.listener.accept().await.map_err(LaunchError::Accept)?;
        stream.set_nodelay(true).map_err(LaunchError::Accept)?;
        debug!("accepted report connection from {peer}");
        Ok(FrameTransport::new(stream, self.max_frame_size))
    }
}
