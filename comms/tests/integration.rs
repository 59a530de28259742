use std::io;

use comms::msg::{Msg, Payload};
use tokio::{io as tokio_io, task::JoinSet};

#[tokio::test]
async fn send_recv_tensor() -> io::Result<()> {
    const SIZE: usize = 128;

    let values = [0.5, -1.0, 3.25, 1e-12, 7.0];

    let (one, two) = tokio_io::duplex(SIZE);
    let (rx, tx) = tokio_io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (rx_two, tx_two) = tokio_io::split(two);
    let (mut rx, _) = comms::channel(rx_two, tx_two);

    let sender = tokio::spawn(async move {
        let msg = Msg::Data(Payload::Tensor(&values));
        tx.send(&msg).await
    });

    match rx.recv().await? {
        Msg::Data(Payload::Tensor(got)) => assert_eq!(got, values),
        other => panic!("unexpected msg: {other:?}"),
    }

    sender.await.unwrap()
}

#[tokio::test]
async fn mesh_broadcast_reaches_every_rank() -> io::Result<()> {
    const WORLD: usize = 3;
    const LEN: usize = 1000;

    let meshes = comms::local_mesh(WORLD, 256)?;
    let mut join_set = JoinSet::new();

    for mut mesh in meshes {
        join_set.spawn(async move {
            let rank = mesh.rank();
            let mut results = Vec::new();

            for source in 0..WORLD {
                let mut buf: Vec<f64> = if rank == source {
                    (0..LEN).map(|i| (source * LEN + i) as f64).collect()
                } else {
                    vec![0.; LEN]
                };

                mesh.broadcast(&mut buf, source).await?;
                results.push(buf);
            }

            mesh.disconnect().await?;
            io::Result::Ok(results)
        });
    }

    while let Some(res) = join_set.join_next().await {
        let results = res.unwrap()?;

        for (source, buf) in results.iter().enumerate() {
            let expected: Vec<f64> = (0..LEN).map(|i| (source * LEN + i) as f64).collect();
            assert_eq!(*buf, expected);
        }
    }

    Ok(())
}

#[tokio::test]
async fn mesh_rejects_length_mismatch() -> io::Result<()> {
    let mut meshes = comms::local_mesh(2, 1024)?;
    let mut receiver = meshes.pop().unwrap();
    let mut sender = meshes.pop().unwrap();

    let send = tokio::spawn(async move {
        let mut buf = vec![1.; 4];
        sender.broadcast(&mut buf, 0).await
    });

    let mut buf = vec![0.; 3];
    let err = receiver.broadcast(&mut buf, 0).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    send.await.unwrap()
}

#[test]
fn mesh_rank_must_be_in_range() {
    assert!(comms::LocalMesh::new(2, 2).is_err());
    assert!(comms::LocalMesh::new(1, 2).is_ok());
}
