/*! Codec for encoding/decoding length-prefixed `Frame`s in terms of tokio-io
*/

use std::io::Error as IoError;

use bytes::{Buf, BufMut, BytesMut};
use nom::error::Error as NomError;
use nom::sequence::terminated;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use onion_binary_io::*;
use onion_packet::{Frame, MAX_FRAME_SIZE};

use crate::stats::*;

/// Size of the BigEndian length prefix of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Error that can happen when decoding `Frame` from bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Error indicates that the length prefix announces too big frame.
    #[error("Frame should not be longer than {} bytes: {} bytes", MAX_FRAME_SIZE, len)]
    TooBigFrame {
        /// Announced length of the frame.
        len: usize
    },
    /// Error indicates that received frame can't be parsed.
    #[error("Deserialize Frame error: {:?}, frame: {:?}", error, frame)]
    Deserialize {
        /// Parsing error.
        error: nom::Err<NomError<Vec<u8>>>,
        /// Received frame.
        frame: Vec<u8>,
    },
    /// General IO error that can happen with TCP socket.
    #[error("IO Error")]
    Io(IoError),
}

impl DecodeError {
    pub(crate) fn too_big_frame(len: usize) -> DecodeError {
        DecodeError::TooBigFrame { len }
    }

    pub(crate) fn deserialize(e: nom::Err<NomError<&[u8]>>, frame: Vec<u8>) -> DecodeError {
        DecodeError::Deserialize { error: e.map(|e| NomError::new(e.input.to_vec(), e.code)), frame }
    }
}

/// Error that can happen when encoding `Frame` to bytes.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Error indicates that `Frame` is invalid and can't be serialized.
    #[error("Serialize Frame error: {:?}", error)]
    Serialize {
        /// Serialization error.
        error: GenError
    },
    /// General IO error that can happen with TCP socket.
    #[error("IO Error")]
    Io(IoError),
}

impl EncodeError {
    pub(crate) fn serialize(error: GenError) -> EncodeError {
        EncodeError::Serialize { error }
    }
}

impl From<IoError> for DecodeError {
    fn from(error: IoError) -> DecodeError {
        DecodeError::Io(error)
    }
}

impl From<IoError> for EncodeError {
    fn from(error: IoError) -> EncodeError {
        EncodeError::Io(error)
    }
}

/// Struct to use for {de-,}serializing frames on a TCP link.
#[derive(Clone)]
pub struct FrameCodec {
    stats: Stats,
}

impl FrameCodec {
    /// Make object
    pub fn new(stats: Stats) -> Self {
        FrameCodec {
            stats
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DecodeError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None)
        }

        let mut prefix = [0; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DecodeError::too_big_frame(len))
        }

        if buf.len() < LENGTH_PREFIX_SIZE + len {
            buf.reserve(LENGTH_PREFIX_SIZE + len - buf.len());
            return Ok(None)
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let data = buf.split_to(len);

        let result = match terminated(Frame::from_bytes, all_consumed)(&data) {
            Err(error) => Err(DecodeError::deserialize(error, data.to_vec())),
            Ok((_, frame)) => {
                self.stats.counters.record_incoming(len);
                Ok(Some(frame))
            }
        };
        result
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = EncodeError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = to_vec(&frame, frame.size())
            .map_err(EncodeError::serialize)?;

        buf.reserve(LENGTH_PREFIX_SIZE + bytes.len());
        buf.put_u32(bytes.len() as u32);
        buf.extend_from_slice(&bytes);

        self.stats.counters.record_outgoing(bytes.len());

        Ok(())
    }
}
