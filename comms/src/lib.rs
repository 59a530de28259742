mod frame;
mod mesh;
pub mod msg;

use tokio::io::{AsyncRead, AsyncWrite};

pub use frame::{FrameReader, FrameWriter};
pub use mesh::{LocalMesh, Mesh, local_mesh};

/// Wraps both halves of a byte stream into a framed channel.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// The receiving and sending ends of the channel.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReader<R>, FrameWriter<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReader::new(rx), FrameWriter::new(tx))
}
