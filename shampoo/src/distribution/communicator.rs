use std::io;

use comms::Mesh;
use tokio::io::{AsyncRead, AsyncWrite};

/// The collective operations the optimizer needs from its worker group.
#[allow(unused)]
#[trait_variant::make(Communicator: Send)]
pub trait CommunicatorTemplate {
    /// This worker's rank, in `0..world_size`.
    fn rank(&self) -> usize;

    /// The amount of workers in the group.
    fn world_size(&self) -> usize;

    /// Should implement broadcasting `buf` from `source` to every other worker.
    ///
    /// # Arguments
    /// * `buf` - The data to send when this worker is `source`, otherwise where to write it.
    /// * `source` - The rank of the worker that owns the data.
    ///
    /// # Returns
    /// An io error if the communication fails, which is fatal for the step.
    async fn broadcast(&mut self, buf: &mut [f64], source: usize) -> io::Result<()>;
}

/// A group made of a single worker, broadcasting is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleWorker;

impl Communicator for SingleWorker {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn broadcast(&mut self, _buf: &mut [f64], source: usize) -> io::Result<()> {
        if source != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("broadcast source {source} is out of range"),
            ));
        }

        Ok(())
    }
}

impl<R, W> Communicator for Mesh<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn rank(&self) -> usize {
        Mesh::rank(self)
    }

    fn world_size(&self) -> usize {
        Mesh::world_size(self)
    }

    async fn broadcast(&mut self, buf: &mut [f64], source: usize) -> io::Result<()> {
        Mesh::broadcast(self, buf, source).await
    }
}
