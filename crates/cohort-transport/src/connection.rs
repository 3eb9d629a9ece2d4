use futures_util::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use crate::{BoxedStream, Frame, FrameCodec, TransportError};

/// Read half of a split [`Connection`]; a `Stream` of frames.
pub type FrameReader = FramedRead<ReadHalf<BoxedStream>, FrameCodec>;

/// Write half of a split [`Connection`]; a `Sink` of frames.
pub type FrameWriter = FramedWrite<WriteHalf<BoxedStream>, FrameCodec>;

/// A framed duplex connection to one peer.
///
/// Used whole during rendezvous (strict request/response), then split so
/// a reader task and a writer task can own one half each.
pub struct Connection {
    framed: Framed<BoxedStream, FrameCodec>,
    max_frame_size: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(stream: BoxedStream, max_frame_size: usize) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new(max_frame_size)),
            max_frame_size,
        }
    }

    /// Write one frame and flush it.
    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.framed.send(frame).await
    }

    /// Read the next frame. A clean end of stream is [`TransportError::Closed`].
    pub async fn recv(&mut self) -> Result<Frame, TransportError> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }

    /// Split into independently owned reader and writer halves.
    ///
    /// Bytes already buffered by the codec are carried over to the reader.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        let parts = self.framed.into_parts();
        let (read, write) = tokio::io::split(parts.io);

        let mut reader = FramedRead::new(read, FrameCodec::new(self.max_frame_size));
        reader.read_buffer_mut().extend_from_slice(&parts.read_buf);
        let writer = FramedWrite::new(write, FrameCodec::new(self.max_frame_size));
        (reader, writer)
    }
}
