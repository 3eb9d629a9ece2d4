use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::TransportError;

/// Size of the fixed frame header following the length prefix:
/// `tag:u32 | sender:u32 | sequence:u64 | flags:u8`, all big-endian.
pub const HEADER_LEN: usize = 4 + 4 + 8 + 1;

/// The sender asks for an acknowledgement once the frame is delivered.
pub const FLAG_ACK_REQUESTED: u8 = 0b0000_0001;

/// One self-delimiting message on a connection.
///
/// The transport never interprets `tag` or `payload`; the communicator
/// layer assigns their meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub sender: u32,
    pub sequence: u64,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u32, sender: u32, sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            sender,
            sequence,
            flags: 0,
            payload: payload.into(),
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn ack_requested(&self) -> bool {
        self.flags & FLAG_ACK_REQUESTED != 0
    }

    /// Bytes this frame occupies on the wire, length prefix included.
    pub fn wire_size(&self) -> usize {
        4 + HEADER_LEN + self.payload.len()
    }
}

/// Length-prefixed frame codec.
///
/// The outer `u32` length comes from [`LengthDelimitedCodec`], so a short
/// read never yields a frame: the decoder waits until the whole body is
/// buffered.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(max_payload.saturating_add(HEADER_LEN))
            .new_codec();
        Self { inner, max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        let Some(mut body) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if body.len() < HEADER_LEN {
            return Err(TransportError::MalformedFrame(format!(
                "body of {} bytes is shorter than the {HEADER_LEN}-byte header",
                body.len()
            )));
        }

        let tag = body.get_u32();
        let sender = body.get_u32();
        let sequence = body.get_u64();
        let flags = body.get_u8();
        Ok(Some(Frame {
            tag,
            sender,
            sequence,
            flags,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        if frame.payload.len() > self.max_payload {
            return Err(TransportError::FrameTooLarge {
                size: frame.payload.len(),
                max: self.max_payload,
            });
        }

        let mut body = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
        body.put_u32(frame.tag);
        body.put_u32(frame.sender);
        body.put_u64(frame.sequence);
        body.put_u8(frame.flags);
        body.put_slice(&frame.payload);
        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}
