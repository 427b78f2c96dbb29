//! Byte-stream transports between a driver and a solver.
//!
//! A [`DialStream`] is the product of [`Driver::dial`](crate::driver::Driver::dial):
//! an opaque duplex connection a solver channel can be layered on. It
//! implements both the tokio and hyper I/O traits so it can back a tonic
//! channel directly.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_core::{ready, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::FramedRead;

use crate::moby::read::FrameDecoder;

type BoxedRead = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// Flattens a demultiplexed exec pipe back into a plain byte reader.
///
/// The daemon's attach framing is stripped by the decoder; whatever part of
/// a decoded frame does not fit the caller's buffer is carried over to the
/// next read.
struct FrameReader {
    frames: FramedRead<BoxedRead, FrameDecoder>,
    carry: Bytes,
    exhausted: bool,
}

impl FrameReader {
    fn new(read: BoxedRead, capacity: usize) -> FrameReader {
        FrameReader {
            frames: FramedRead::with_capacity(read, FrameDecoder::new(), capacity),
            carry: Bytes::new(),
            exhausted: false,
        }
    }
}

impl AsyncRead for FrameReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let reader = self.get_mut();
        loop {
            if !reader.carry.is_empty() {
                let take = reader.carry.len().min(buf.remaining());
                buf.put_slice(&reader.carry[..take]);
                reader.carry.advance(take);
                return Poll::Ready(Ok(()));
            }
            if reader.exhausted {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut reader.frames).poll_next(cx)) {
                Some(Ok(frame)) => reader.carry = frame.into_bytes(),
                Some(Err(e)) => {
                    reader.exhausted = true;
                    return Poll::Ready(Err(e));
                }
                None => {
                    reader.exhausted = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

enum ReadSide {
    Raw { read: BoxedRead },
    Framed { read: FrameReader },
}

/// A duplex byte stream to a solver.
#[allow(missing_debug_implementations)]
pub struct DialStream {
    read: ReadSide,
    write: BoxedWrite,
}

impl DialStream {
    /// A transport over raw halves, such as a TCP connection.
    pub fn new(read: BoxedRead, write: BoxedWrite) -> Self {
        DialStream {
            read: ReadSide::Raw { read },
            write,
        }
    }

    /// A transport over an attached container exec pipe. The read half
    /// carries the daemon's stream framing, which is stripped here.
    pub fn framed(read: BoxedRead, write: BoxedWrite, capacity: usize) -> Self {
        DialStream {
            read: ReadSide::Framed {
                read: FrameReader::new(read, capacity),
            },
            write,
        }
    }
}

impl AsyncRead for DialStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.read {
            ReadSide::Raw { read } => Pin::new(read).poll_read(cx, buf),
            ReadSide::Framed { read } => Pin::new(read).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DialStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}

impl hyper::rt::Read for DialStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let n = unsafe {
            let mut tbuf = ReadBuf::uninit(buf.as_mut());
            match AsyncRead::poll_read(self, cx, &mut tbuf) {
                Poll::Ready(Ok(())) => tbuf.filled().len(),
                other => return other,
            }
        };

        unsafe {
            buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl hyper::rt::Write for DialStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        AsyncWrite::poll_write(self, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        AsyncWrite::poll_flush(self, cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        AsyncWrite::poll_shutdown(self, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn framed_transport_strips_stream_headers() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 5]);
        payload.extend_from_slice(b"hello");
        payload.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 6]);
        payload.extend_from_slice(b" world");

        let read: BoxedRead = Box::pin(std::io::Cursor::new(payload));
        let write: BoxedWrite = Box::pin(tokio::io::sink());
        let mut transport = DialStream::framed(read, write, 8 * 1024);

        let mut out = String::new();
        transport.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn frames_larger_than_the_read_buffer_carry_over() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 8]);
        payload.extend_from_slice(b"abcdefgh");

        let read: BoxedRead = Box::pin(std::io::Cursor::new(payload));
        let write: BoxedWrite = Box::pin(tokio::io::sink());
        let mut transport = DialStream::framed(read, write, 64);

        let mut chunk = [0u8; 3];
        let mut out = Vec::new();
        loop {
            let n = transport.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"abcdefgh");
    }
}
