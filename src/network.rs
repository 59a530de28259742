use std::{io, time::Duration};

use comms::{
    Mesh,
    msg::{Command, Msg},
};
use log::{debug, info};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

const CONNECT_ATTEMPTS: usize = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

pub type TcpMesh = Mesh<OwnedReadHalf, OwnedWriteHalf>;

/// Joins the TCP mesh of `world_size` workers.
///
/// Worker `r` listens at `base_port + r`, dials every lower rank and greets it with
/// its rank, then accepts a connection from every higher rank.
///
/// # Arguments
/// * `host` - The host every worker listens at.
/// * `base_port` - The port of rank 0.
/// * `rank` - This worker's rank.
/// * `world_size` - The amount of workers.
///
/// # Returns
/// A complete mesh or an io error if any connection fails.
pub async fn connect(
    host: &str,
    base_port: u16,
    rank: usize,
    world_size: usize,
) -> io::Result<TcpMesh> {
    let mut mesh = Mesh::new(rank, world_size)?;

    let listener = TcpListener::bind((host, port(base_port, rank)?)).await?;
    info!("listening at {}", listener.local_addr()?);

    for peer in 0..rank {
        let stream = dial(host, port(base_port, peer)?).await?;
        let (rx, tx) = stream.into_split();
        let (rx, mut tx) = comms::channel(rx, tx);

        tx.send(&Msg::Control(Command::Hello { rank, world_size }))
            .await?;
        mesh.add_peer(peer, rx, tx)?;
        debug!(peer = peer; "connected to lower rank");
    }

    for _ in rank + 1..world_size {
        let (stream, addr) = listener.accept().await?;
        let (rx, tx) = stream.into_split();
        let (mut rx, tx) = comms::channel(rx, tx);

        let peer = match rx.recv().await? {
            Msg::Control(Command::Hello {
                rank: peer,
                world_size: theirs,
            }) if theirs == world_size => peer,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected a hello from {addr} for {world_size} workers, got {other:?}"),
                ));
            }
        };

        mesh.add_peer(peer, rx, tx)?;
        debug!(peer = peer; "accepted higher rank");
    }

    info!("joined the mesh as rank {rank} of {world_size}");
    Ok(mesh)
}

fn port(base_port: u16, rank: usize) -> io::Result<u16> {
    u16::try_from(rank)
        .ok()
        .and_then(|rank| base_port.checked_add(rank))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rank {rank} overflows the port range from {base_port}"),
            )
        })
}

/// Connects to a worker that may not be listening yet.
async fn dial(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut attempt = 1;

    loop {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                debug!("connecting to {host}:{port} failed ({e}), retrying");
                attempt += 1;
                time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}
