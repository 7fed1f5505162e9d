// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::{ProtocolViolation, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ciborium::Value;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// The size of the little-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

// Chunk size used when reading from the connection.
const CHUNK_SIZE: usize = 4 * 1024;

/// Splits a byte stream into length-prefixed frames.
///
/// The decoder is fed arbitrary chunks with [`extend`](Self::extend), and yields whole payloads
/// through [`next_frame`](Self::next_frame). A frame split across any number of chunks is
/// reassembled, and several frames in one chunk are yielded one at a time.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: u64,
}

impl FrameDecoder {
    /// Creates a new decoder that rejects frames larger than `max_frame_size` bytes.
    pub fn new(max_frame_size: u64) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends bytes received from the connection.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the number of bytes buffered but not yet yielded as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete payload, or `None` if more bytes are needed.
    ///
    /// The size check happens as soon as the prefix is available, before the payload arrives.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolViolation> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
        let declared = u32::from_le_bytes(prefix);

        if u64::from(declared) > self.max_frame_size {
            return Err(ProtocolViolation::FrameTooLarge {
                declared: u64::from(declared),
                max: self.max_frame_size,
            });
        }

        let len = declared as usize;
        if self.buf.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Encodes a value as a length-prefixed CBOR frame.
pub fn encode_frame<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes, TransportError> {
    let mut body = Vec::new();
    ciborium::into_writer(payload, &mut body).map_err(TransportError::Encode)?;

    let declared = u32::try_from(body.len()).map_err(|_| ProtocolViolation::FrameTooLarge {
        declared: body.len() as u64,
        max: u64::from(u32::MAX),
    })?;

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.put_u32_le(declared);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// A framed, bidirectional connection to the external process.
///
/// At most one read may be outstanding at a time. A read that is started and then abandoned
/// (e.g. its future is dropped) leaves the transport unusable for further reads, since the
/// partially consumed stream can't be resynchronized.
#[derive(Debug)]
pub struct FrameTransport<S> {
    stream: S,
    decoder: FrameDecoder,
    read_pending: bool,
    closed: bool,
}

impl<S> FrameTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream.
    pub fn new(stream: S, max_frame_size: u64) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(max_frame_size),
            read_pending: false,
            closed: false,
        }
    }

    /// Returns true if the remote side is known to have closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Reads the next frame and decodes its CBOR payload.
    pub async fn read_frame(&mut self) -> Result<Value, TransportError> {
        if self.read_pending {
            return Err(ProtocolViolation::ReadAlreadyPending.into());
        }
        self.read_pending = true;

        // The flag is only cleared once the read completes, so a dropped future leaves it set.
        let result = self.read_payload().await;
        self.read_pending = false;
        let payload = result?;

        trace!(len = payload.len(), "received frame");
        ciborium::from_reader(&payload[..])
            .map_err(|err| ProtocolViolation::MalformedPayload { err }.into())
    }

    async fn read_payload(&mut self) -> Result<Bytes, TransportError> {
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return Ok(payload);
            }
            if self.closed {
                return Err(self.connection_closed());
            }

            match self.stream.read(&mut chunk).await {
                Ok(0) => {
                    self.closed = true;
                    return Err(self.connection_closed());
                }
                Ok(n) => self.decoder.extend(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(self.map_io_error(err)),
            }
        }
    }

    /// Encodes `payload` as one frame and writes it in a single operation.
    pub async fn write<T: Serialize + ?Sized>(
        &mut self,
        payload: &T,
    ) -> Result<(), TransportError> {
        if self.closed {
            return Err(self.connection_closed());
        }

        let frame = encode_frame(payload)?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(|err| self.map_io_error(err))?;
        self.stream
            .flush()
            .await
            .map_err(|err| self.map_io_error(err))?;
        trace!(len = frame.len() - LENGTH_PREFIX_SIZE, "sent frame");
        Ok(())
    }

    fn connection_closed(&self) -> TransportError {
        TransportError::ConnectionClosed {
            buffered: self.decoder.buffered(),
        }
    }

    fn map_io_error(&mut self, err: io::Error) -> TransportError {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => {
                self.closed = true;
                self.connection_closed()
            }
            _ => TransportError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::confirmation;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use test_case::test_case;
    use tokio::io::duplex;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decoder_reassembles_split_frames() {
        let mut stream = frame_bytes(b"first");
        stream.extend(frame_bytes(b""));
        stream.extend(frame_bytes(b"third frame"));

        // Feed one byte at a time: every split point must work.
        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for byte in &stream {
            decoder.extend(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().expect("frames are valid") {
                frames.push(frame);
            }
        }

        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"first"),
                Bytes::new(),
                Bytes::from_static(b"third frame"),
            ]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_yields_batched_frames_one_at_a_time() {
        let mut stream = frame_bytes(b"a");
        stream.extend(frame_bytes(b"bc"));
        stream.extend(&[3, 0]);

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&stream);
        assert_eq!(
            decoder.next_frame().expect("valid"),
            Some(Bytes::from_static(b"a"))
        );
        assert_eq!(
            decoder.next_frame().expect("valid"),
            Some(Bytes::from_static(b"bc"))
        );
        assert_eq!(decoder.next_frame().expect("valid"), None);
        assert_eq!(decoder.buffered(), 2);
    }

    #[test_case(16, 17, true ; "one over the limit")]
    #[test_case(16, 16, false ; "exactly at the limit")]
    #[test_case(0, 1, true ; "zero limit")]
    fn decoder_enforces_max_frame_size(max: u64, declared: u32, too_large: bool) {
        let mut decoder = FrameDecoder::new(max);
        // Only the prefix: the check must not wait for the payload.
        decoder.extend(&declared.to_le_bytes());
        let result = decoder.next_frame();
        if too_large {
            match result {
                Err(ProtocolViolation::FrameTooLarge {
                    declared: d,
                    max: m,
                }) => {
                    assert_eq!(d, u64::from(declared));
                    assert_eq!(m, max);
                }
                other => panic!("expected FrameTooLarge, found {other:?}"),
            }
        } else {
            assert!(matches!(result, Ok(None)), "expected more bytes needed");
        }
    }

    #[test]
    fn encode_frame_prefixes_length() {
        let frame = encode_frame(&confirmation()).expect("confirmation encodes");
        let mut body = Vec::new();
        ciborium::into_writer(&confirmation(), &mut body).expect("confirmation encodes");

        assert_eq!(&frame[..4], &(body.len() as u32).to_le_bytes());
        assert_eq!(&frame[4..], &body[..]);
    }

    #[tokio::test]
    async fn transport_reads_and_writes() {
        let (local, mut remote) = duplex(64);
        let mut transport = FrameTransport::new(local, 1024);

        let remote_task = tokio::spawn(async move {
            let frame = encode_frame(&confirmation()).expect("encodes");
            // Deliver the frame in two pieces.
            remote.write_all(&frame[..3]).await.expect("write succeeds");
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.write_all(&frame[3..]).await.expect("write succeeds");

            let mut reply = vec![0u8; frame.len()];
            remote.read_exact(&mut reply).await.expect("read succeeds");
            reply
        });

        let value = transport.read_frame().await.expect("frame is read");
        assert_eq!(value, confirmation());
        transport
            .write(&confirmation())
            .await
            .expect("frame is written");

        let reply = remote_task.await.expect("task succeeds");
        assert_eq!(
            reply,
            encode_frame(&confirmation()).expect("encodes").to_vec()
        );
    }

    #[tokio::test]
    async fn transport_waits_for_rest_of_payload() {
        let (local, mut remote) = duplex(64);
        let mut transport = FrameTransport::new(local, 1024);

        let mut payload = Vec::new();
        ciborium::into_writer(&Value::Text("x".repeat(40)), &mut payload).expect("text encodes");
        let frame = frame_bytes(&payload);
        let split = LENGTH_PREFIX_SIZE + payload.len() / 2;

        let writer = tokio::spawn(async move {
            remote.write_all(&frame[..split]).await.expect("write succeeds");
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.write_all(&frame[split..]).await.expect("write succeeds");
            remote
        });

        let value = transport.read_frame().await.expect("frame is read");
        assert_eq!(value, Value::Text("x".repeat(40)));
        assert!(!transport.read_pending, "read is no longer pending");
        assert_eq!(transport.decoder.buffered(), 0, "no second frame is buffered");

        // The stream stays usable: a second frame reads normally.
        let mut remote = writer.await.expect("writer task succeeds");
        remote
            .write_all(&encode_frame(&confirmation()).expect("encodes"))
            .await
            .expect("write succeeds");
        assert_eq!(
            transport.read_frame().await.expect("second frame is read"),
            confirmation()
        );
        assert!(!transport.read_pending);
    }

    #[tokio::test]
    async fn transport_reports_close_with_partial_frame() {
        let (local, mut remote) = duplex(64);
        let mut transport = FrameTransport::new(local, 1024);

        remote
            .write_all(&[10, 0, 0, 0, 1, 2])
            .await
            .expect("write succeeds");
        drop(remote);

        match transport.read_frame().await {
            Err(TransportError::ConnectionClosed { buffered }) => assert_eq!(buffered, 6),
            other => panic!("expected ConnectionClosed, found {other:?}"),
        }
        assert!(transport.is_closed());

        // Writes after close fail the same way.
        assert!(matches!(
            transport.write(&confirmation()).await,
            Err(TransportError::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn abandoned_read_blocks_further_reads() {
        let (local, _remote) = duplex(64);
        let mut transport = FrameTransport::new(local, 1024);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), transport.read_frame()).await;
        assert!(abandoned.is_err(), "read times out with no data");

        assert!(matches!(
            transport.read_frame().await,
            Err(TransportError::Protocol(
                ProtocolViolation::ReadAlreadyPending
            ))
        ));
    }

    #[tokio::test]
    async fn transport_rejects_malformed_payload() {
        let (local, mut remote) = duplex(64);
        let mut transport = FrameTransport::new(local, 1024);

        // 0xff is a CBOR "break" code, which is invalid at the top level.
        remote
            .write_all(&frame_bytes(&[0xff]))
            .await
            .expect("write succeeds");

        assert!(matches!(
            transport.read_frame().await,
            Err(TransportError::Protocol(
                ProtocolViolation::MalformedPayload { .. }
            ))
        ));
    }
}
