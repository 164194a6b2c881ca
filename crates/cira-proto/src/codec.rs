//! Length-prefixed bincode framing
//!
//! Every frame on the wire is a 4-byte big-endian length followed by the
//! bincode body. The same codec serves both sockets; the frame type is a
//! type parameter so `Framed` streams stay strongly typed.

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::MAX_FRAME_SIZE;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame of {0} bytes exceeds maximum frame size")]
    FrameTooLarge(usize),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Tokio codec for one frame type.
pub struct FrameCodec<T> {
    _marker: PhantomData<T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, frame: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode::serialize(&frame)?;
        if body.len() > MAX_FRAME_SIZE as usize {
            return Err(CodecError::FrameTooLarge(body.len()));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE as usize {
            return Err(CodecError::FrameTooLarge(len));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(len);
        let frame = bincode::deserialize(&body)?;
        Ok(Some(frame))
    }
}

/// Read a single frame from a raw stream.
///
/// Used during handshakes, before the connection is wrapped in `Framed`.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T, CodecError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let frame = bincode::deserialize(&body)?;
    Ok(frame)
}

/// Write a single frame to a raw stream and flush it.
pub async fn write_frame<T, W>(writer: &mut W, frame: &T) -> Result<(), CodecError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(body.len()));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
