//! Framed byte-stream carrier for sessions.
//!
//! Splits any async stream into a [`FramedConnection`] (the session's
//! sending half, backed by a writer task) and a [`FrameReader`] that decodes
//! incoming frames and delivers them to the session. TCP in the daemon,
//! in-memory duplex pipes in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, watch};

use tasknet_core::message::ProtocolError;
use tasknet_core::wire::{decode_body, encode_frame, FrameHeader, HEADER_LEN};
use tasknet_core::Message;

use crate::hooks::{Connection, ConnectionError};
use crate::session::{SessionEvent, SessionHandle};

const READ_CHUNK: usize = 16 * 1024;

pub struct FramedConnection {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    open: AtomicBool,
    closed: watch::Sender<bool>,
    peer_addr: Option<String>,
}

pub struct FrameReader<R> {
    reader: R,
    closed: watch::Receiver<bool>,
    peer_addr: Option<String>,
}

/// Split `stream` into a sending half and a reader. The writer task is
/// spawned here; the reader runs once the session handle exists.
pub fn framed<S>(stream: S, peer_addr: Option<String>) -> (Arc<FramedConnection>, FrameReader<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (frames, queued) = mpsc::unbounded_channel();
    let (closed, closed_rx) = watch::channel(false);

    tokio::spawn(write_loop(writer, queued, closed_rx.clone()));

    let conn = Arc::new(FramedConnection {
        frames,
        open: AtomicBool::new(true),
        closed,
        peer_addr: peer_addr.clone(),
    });
    let reader = FrameReader {
        reader,
        closed: closed_rx,
        peer_addr,
    };
    (conn, reader)
}

async fn write_loop<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Vec<u8>>, mut closed: watch::Receiver<bool>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            // Frames queued before close() still go out.
            biased;

            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        tracing::warn!(error = %e, "frame write failed");
                        break;
                    }
                }
                None => break,
            },

            _ = closed.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
}

impl Connection for FramedConnection {
    fn send(&self, msg: Message) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        let frame = encode_frame(&msg)?;
        self.frames.send(frame).map_err(|_| ConnectionError::Closed)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.closed.send_replace(true);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.frames.is_closed()
    }

    fn peer_addr(&self) -> Option<String> {
        self.peer_addr.clone()
    }
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Deliver frames to `session` until the stream ends, a header is
    /// malformed, or the connection is closed locally.
    ///
    /// A frame with a valid header but an undecodable body is skipped.
    pub async fn run(mut self, session: SessionHandle) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let peer = self.peer_addr.clone().unwrap_or_default();

        loop {
            loop {
                let (kind, length) = match FrameHeader::parse(&buf) {
                    Ok(parsed) => parsed,
                    Err(ProtocolError::Truncated { .. }) => break,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "malformed frame header, dropping connection");
                        session.send(SessionEvent::ConnectionLost);
                        return;
                    }
                };
                if buf.len() < HEADER_LEN + length {
                    buf.reserve(HEADER_LEN + length - buf.len());
                    break;
                }
                let frame = buf.split_to(HEADER_LEN + length);
                match decode_body(kind, &frame[HEADER_LEN..]) {
                    Ok(msg) => {
                        if !session.deliver(msg) {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(peer = %peer, %kind, error = %e, "undecodable frame skipped"),
                }
            }

            tokio::select! {
                read = self.reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!(peer = %peer, "peer closed the stream");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "read failed");
                        break;
                    }
                },
                _ = self.closed.changed() => return,
            }

            if buf.capacity() - buf.len() < READ_CHUNK / 4 {
                buf.reserve(READ_CHUNK);
            }
        }

        session.send(SessionEvent::ConnectionLost);
    }
}
