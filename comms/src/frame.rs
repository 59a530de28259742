//! Length prefixed framing of `Msg`s over async byte streams.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::msg::Msg;

type FrameLen = u64;
const FRAME_LEN_SIZE: usize = size_of::<FrameLen>();

/// The sending half of a channel to a peer.
pub struct FrameWriter<W: AsyncWrite + Unpin> {
    tx: W,
    head: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub(crate) fn new(tx: W) -> Self {
        Self {
            tx,
            head: Vec::new(),
        }
    }

    /// Writes `msg` as a single frame.
    ///
    /// The length prefix, the kind and any encoded bytes go through an internal
    /// buffer, tensor values are written straight out of the message.
    ///
    /// # Arguments
    /// * `msg` - The message to send.
    ///
    /// # Returns
    /// An `io::Error` if the underlying writer fails.
    pub async fn send(&mut self, msg: &Msg<'_>) -> io::Result<()> {
        let Self { tx, head } = self;

        head.clear();
        head.resize(FRAME_LEN_SIZE, 0);

        let tail = msg.encode(head)?;
        let len = (head.len() - FRAME_LEN_SIZE + tail.len()) as FrameLen;
        head[..FRAME_LEN_SIZE].copy_from_slice(&len.to_be_bytes());

        tx.write_all(head).await?;
        if !tail.is_empty() {
            tx.write_all(tail).await?;
        }

        tx.flush().await
    }
}

/// The receiving half of a channel to a peer.
///
/// Frames are read into a `u64` backed buffer, so tensor values can be borrowed
/// straight out of it.
pub struct FrameReader<R: AsyncRead + Unpin> {
    rx: R,
    frame: Vec<u64>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(rx: R) -> Self {
        Self {
            rx,
            frame: Vec::new(),
        }
    }

    /// Waits for the next frame.
    ///
    /// # Returns
    /// The message, borrowing from this reader until the next call, or an
    /// `io::Error` if the stream fails or the frame is malformed.
    pub async fn recv(&mut self) -> io::Result<Msg<'_>> {
        let Self { rx, frame } = self;

        let mut len = [0; FRAME_LEN_SIZE];
        rx.read_exact(&mut len).await?;

        let len = usize::try_from(FrameLen::from_be_bytes(len)).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "the frame doesn't fit in memory")
        })?;

        frame.clear();
        frame.resize(len.div_ceil(size_of::<u64>()), 0);

        let bytes = &mut bytemuck::cast_slice_mut::<u64, u8>(frame)[..len];
        rx.read_exact(bytes).await?;

        Msg::decode(bytes)
    }
}
