//! Decoders for the daemon's streaming wire formats.

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, Bytes, BytesMut};
use log::trace;
use serde::de::DeserializeOwned;
use tokio_util::codec::Decoder;

use crate::errors::Error;

/// One demultiplexed frame of an attached stream.
///
/// Attached streams multiplex stdin/stdout/stderr with an 8 byte header
/// unless the exec was created with a TTY, in which case the bytes arrive
/// raw and are reported as `Console`.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// Frame tagged as stdin echo.
    StdIn {
        /// Frame payload.
        message: Bytes,
    },
    /// Frame tagged as stdout.
    StdOut {
        /// Frame payload.
        message: Bytes,
    },
    /// Frame tagged as stderr.
    StdErr {
        /// Frame payload.
        message: Bytes,
    },
    /// Raw bytes of a TTY stream.
    Console {
        /// Frame payload.
        message: Bytes,
    },
}

impl StreamFrame {
    /// The payload regardless of the stream it arrived on.
    pub fn into_bytes(self) -> Bytes {
        match self {
            StreamFrame::StdIn { message }
            | StreamFrame::StdOut { message }
            | StreamFrame::StdErr { message }
            | StreamFrame::Console { message } => message,
        }
    }
}

impl AsRef<[u8]> for StreamFrame {
    fn as_ref(&self) -> &[u8] {
        match self {
            StreamFrame::StdIn { message }
            | StreamFrame::StdOut { message }
            | StreamFrame::StdErr { message }
            | StreamFrame::Console { message } => message.as_ref(),
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum FrameDecoderState {
    WaitingHeader,
    WaitingPayload(u8, usize), // stream type, length
}

/// Decoder for the multiplexed attach framing.
#[derive(Debug, Copy, Clone)]
pub(crate) struct FrameDecoder {
    state: FrameDecoderState,
}

impl FrameDecoder {
    pub(crate) fn new() -> FrameDecoder {
        FrameDecoder {
            state: FrameDecoderState::WaitingHeader,
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = StreamFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                FrameDecoderState::WaitingHeader => {
                    // A TTY stream has no framing; the first byte of a frame
                    // header is always 0, 1 or 2.
                    if !src.is_empty() && src[0] > 2 {
                        return Ok(Some(StreamFrame::Console {
                            message: src.split().freeze(),
                        }));
                    }

                    if src.len() < 8 {
                        return Ok(None);
                    }

                    let header = src.split_to(8);
                    let length =
                        u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
                    self.state = FrameDecoderState::WaitingPayload(header[0], length);
                }
                FrameDecoderState::WaitingPayload(typ, length) => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    trace!("FrameDecoder: reading {length} byte payload");
                    let message = src.split_to(length).freeze();
                    let item = match typ {
                        0 => StreamFrame::StdIn { message },
                        1 => StreamFrame::StdOut { message },
                        2 => StreamFrame::StdErr { message },
                        _ => unreachable!(),
                    };
                    self.state = FrameDecoderState::WaitingHeader;
                    return Ok(Some(item));
                }
            }
        }
    }
}

/// Decoder for newline-delimited JSON streams, such as image pull progress.
#[derive(Debug)]
pub(crate) struct JsonLineDecoder<T> {
    ty: PhantomData<T>,
}

impl<T> JsonLineDecoder<T> {
    #[inline]
    pub(crate) fn new() -> JsonLineDecoder<T> {
        JsonLineDecoder { ty: PhantomData }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLineDecoder<T> {
    type Item = T;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(pos + 1);
            let slice = &line[..line.len() - 1];
            if slice.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return serde_json::from_slice(slice).map(Some).map_err(|e| {
                if e.is_data() {
                    Error::JsonDataError {
                        message: e.to_string(),
                        #[cfg(feature = "json_data_content")]
                        contents: String::from_utf8_lossy(slice).to_string(),
                    }
                } else {
                    e.into()
                }
            });
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.iter().all(u8::is_ascii_whitespace) {
            src.advance(src.len());
            return Ok(None);
        }
        let line = src.split();
        serde_json::from_slice(&line).map(Some).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demultiplexes_framed_output() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 2]);
        buf.extend_from_slice(b"ok");
        buf.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 3]);
        buf.extend_from_slice(b"err");

        match decoder.decode(&mut buf).unwrap() {
            Some(StreamFrame::StdOut { message }) => assert_eq!(&message[..], b"ok"),
            other => panic!("unexpected frame: {other:?}"),
        }
        match decoder.decode(&mut buf).unwrap() {
            Some(StreamFrame::StdErr { message }) => assert_eq!(&message[..], b"err"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn passes_tty_bytes_through() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&b"raw console bytes"[..]);
        match decoder.decode(&mut buf).unwrap() {
            Some(StreamFrame::Console { message }) => {
                assert_eq!(&message[..], b"raw console bytes")
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn waits_for_full_payload() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 4]);
        buf.extend_from_slice(b"ab");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"cd");
        match decoder.decode(&mut buf).unwrap() {
            Some(StreamFrame::StdOut { message }) => assert_eq!(&message[..], b"abcd"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_json_lines() {
        #[derive(Debug, serde_derive::Deserialize, PartialEq)]
        struct Line {
            status: String,
        }
        let mut decoder = JsonLineDecoder::<Line>::new();
        let mut buf = BytesMut::from(&br#"{"status":"pulling"}"#[..]);
        buf.extend_from_slice(b"\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Line {
                status: "pulling".into()
            })
        );
    }
}
