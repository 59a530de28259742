//! A fully connected group of workers that can broadcast tensors to each other.

use std::io;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};

use crate::{
    FrameReader, FrameWriter,
    msg::{Command, Msg, Payload},
};

/// A mesh made of in-memory duplex streams, useful to run every worker inside one process.
pub type LocalMesh = Mesh<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

struct Peer<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> {
    rx: FrameReader<R>,
    tx: FrameWriter<W>,
}

/// One worker's view of the communication group.
///
/// Holds a dedicated channel to every other worker, indexed by the peer's rank.
pub struct Mesh<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> {
    rank: usize,
    world_size: usize,
    peers: Vec<Option<Peer<R, W>>>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Mesh<R, W> {
    /// Creates a new `Mesh` without any connected peer.
    ///
    /// # Arguments
    /// * `rank` - This worker's rank.
    /// * `world_size` - The amount of workers in the group.
    ///
    /// # Returns
    /// A new mesh or an `InvalidInput` error if `rank` isn't smaller than `world_size`.
    pub fn new(rank: usize, world_size: usize) -> io::Result<Self> {
        if rank >= world_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rank {rank} is out of range for a world of size {world_size}"),
            ));
        }

        Ok(Self {
            rank,
            world_size,
            peers: (0..world_size).map(|_| None).collect(),
        })
    }

    /// Registers the channel that connects this worker with `peer`.
    ///
    /// # Arguments
    /// * `peer` - The rank of the worker at the other end of the channel.
    /// * `rx` - The receiving end of the channel.
    /// * `tx` - The sending end of the channel.
    ///
    /// # Returns
    /// An `InvalidInput` error if `peer` is this worker, is out of range or was already added.
    pub fn add_peer(
        &mut self,
        peer: usize,
        rx: FrameReader<R>,
        tx: FrameWriter<W>,
    ) -> io::Result<()> {
        if peer == self.rank || peer >= self.world_size || self.peers[peer].is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot add peer {peer} to the mesh of rank {}", self.rank),
            ));
        }

        self.peers[peer] = Some(Peer { rx, tx });
        Ok(())
    }

    /// Returns this worker's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the amount of workers in the group.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Broadcasts `buf` from the `source` worker to every other worker.
    ///
    /// Every worker of the group must call this method with the same `source` and a buffer
    /// of the same length, the source's buffer is sent and the others are overwritten.
    ///
    /// # Arguments
    /// * `buf` - The tensor to send, or where to write the received tensor.
    /// * `source` - The rank of the worker that owns the data.
    ///
    /// # Returns
    /// An `io::Error` if the communication fails or a peer violates the protocol.
    pub async fn broadcast(&mut self, buf: &mut [f64], source: usize) -> io::Result<()> {
        if source >= self.world_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("broadcast source {source} is out of range"),
            ));
        }

        let Self { rank, peers, .. } = self;

        if *rank == source {
            let msg = Msg::Data(Payload::Tensor(buf));

            for (peer_rank, peer) in peers.iter_mut().enumerate() {
                if peer_rank == *rank {
                    continue;
                }

                let peer = peer.as_mut().ok_or_else(|| not_connected(peer_rank))?;
                peer.tx.send(&msg).await?;
            }

            debug!(rank = *rank, len = buf.len(); "broadcasted tensor");
            return Ok(());
        }

        let peer = peers[source].as_mut().ok_or_else(|| not_connected(source))?;

        match peer.rx.recv().await? {
            Msg::Data(Payload::Tensor(data)) if data.len() == buf.len() => {
                buf.copy_from_slice(data);
                Ok(())
            }
            Msg::Data(Payload::Tensor(data)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "broadcast from {source} has {} values, expected {}",
                    data.len(),
                    buf.len()
                ),
            )),
            Msg::Err(detail) => Err(io::Error::other(format!(
                "worker {source} failed during broadcast: {detail}"
            ))),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected a tensor from {source}, got {}", other.kind()),
            )),
        }
    }

    /// Reports a fatal failure to every peer so they stop waiting on this worker.
    ///
    /// # Arguments
    /// * `detail` - A description of the failure.
    pub async fn abort(&mut self, detail: &str) {
        let msg = Msg::Err(detail.into());

        for peer in self.peers.iter_mut().flatten() {
            if let Err(e) = peer.tx.send(&msg).await {
                warn!("failed to report abort to a peer: {e}");
            }
        }
    }

    /// Gracefully leaves the group, waiting for every peer to leave as well.
    ///
    /// # Returns
    /// An `io::Error` if the communication fails.
    pub async fn disconnect(mut self) -> io::Result<()> {
        let msg = Msg::Control(Command::Disconnect);

        for peer in self.peers.iter_mut().flatten() {
            peer.tx.send(&msg).await?;
        }

        for peer in self.peers.iter_mut().flatten() {
            loop {
                match peer.rx.recv().await {
                    Ok(Msg::Control(Command::Disconnect)) => break,
                    Ok(other) => warn!("ignoring {} while disconnecting", other.kind()),
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }
}

fn not_connected(peer: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("there is no channel to worker {peer}"),
    )
}

/// Creates a complete in-process mesh of `world_size` workers.
///
/// # Arguments
/// * `world_size` - The amount of workers.
/// * `capacity` - The buffer size of every duplex stream.
///
/// # Returns
/// One mesh per rank, ordered by rank.
pub fn local_mesh(world_size: usize, capacity: usize) -> io::Result<Vec<LocalMesh>> {
    let mut meshes = (0..world_size)
        .map(|rank| Mesh::new(rank, world_size))
        .collect::<io::Result<Vec<_>>>()?;

    for a in 0..world_size {
        for b in a + 1..world_size {
            let (stream_a, stream_b) = tokio::io::duplex(capacity);

            let (rx, tx) = tokio::io::split(stream_a);
            let (rx, tx) = crate::channel(rx, tx);
            meshes[a].add_peer(b, rx, tx)?;

            let (rx, tx) = tokio::io::split(stream_b);
            let (rx, tx) = crate::channel(rx, tx);
            meshes[b].add_peer(a, rx, tx)?;
        }
    }

    Ok(meshes)
}
