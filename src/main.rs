mod network;
mod problem;

use std::{env, fs};

use anyhow::{Context, Result, bail};
use comms::Mesh;
use log::{error, info};
use shampoo::{ShampooBuilder, specs::ShampooSpec};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinSet,
};

use problem::LeastSquares;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_BASE_PORT: u16 = 40000;
const DEFAULT_STEPS: u64 = 100;
const LOCAL_CAPACITY: usize = 1 << 16;
const LOG_EVERY: u64 = 10;

const SAMPLES: usize = 256;
const INPUTS: usize = 32;
const OUTPUTS: usize = 8;
const SEED: u64 = 42;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let spec = load_spec()?;

    match args.get(1).map(String::as_str) {
        Some("local") => {
            let world_size = parse_arg(&args, 2, "world_size")?;
            let steps = parse_steps(&args, 3)?;
            run_local(spec, world_size, steps).await
        }
        Some("node") => {
            let rank = parse_arg(&args, 2, "rank")?;
            let world_size = parse_arg(&args, 3, "world_size")?;
            let steps = parse_steps(&args, 4)?;

            let host = env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
            let base_port = match env::var("BASE_PORT") {
                Ok(port) => port.parse().context("BASE_PORT must be a port number")?,
                Err(_) => DEFAULT_BASE_PORT,
            };

            let mesh = network::connect(&host, base_port, rank, world_size).await?;
            let loss = run_node(spec, mesh, steps).await?;
            info!("rank {rank} finished with loss {loss}");
            Ok(())
        }
        _ => bail!(
            "usage: {} <local <world_size> | node <rank> <world_size>> [steps]",
            args.first().map_or("distributed-shampoo", String::as_str)
        ),
    }
}

/// Reads the optimizer spec from the JSON file at `SHAMPOO_CONFIG`, the defaults if unset.
fn load_spec() -> Result<ShampooSpec> {
    let Ok(path) = env::var("SHAMPOO_CONFIG") else {
        return Ok(ShampooSpec::default());
    };

    let json = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let spec = serde_json::from_str(&json).with_context(|| format!("parsing {path}"))?;
    info!("loaded optimizer spec from {path}");
    Ok(spec)
}

fn parse_arg(args: &[String], idx: usize, name: &str) -> Result<usize> {
    let arg = args
        .get(idx)
        .with_context(|| format!("missing argument `{name}`"))?;

    arg.parse()
        .with_context(|| format!("`{name}` must be a non negative integer, got {arg}"))
}

fn parse_steps(args: &[String], idx: usize) -> Result<u64> {
    match args.get(idx) {
        Some(arg) => arg.parse().context("`steps` must be a non negative integer"),
        None => Ok(DEFAULT_STEPS),
    }
}

/// Runs every worker of the group inside this process, over in-memory streams.
async fn run_local(spec: ShampooSpec, world_size: usize, steps: u64) -> Result<()> {
    let meshes = comms::local_mesh(world_size, LOCAL_CAPACITY)?;
    let mut join_set = JoinSet::new();

    for mesh in meshes {
        let spec = spec.clone();
        join_set.spawn(async move {
            let rank = mesh.rank();
            run_node(spec, mesh, steps).await.map(|loss| (rank, loss))
        });
    }

    while let Some(result) = join_set.join_next().await {
        let (rank, loss) = result??;
        info!("rank {rank} finished with loss {loss}");
    }

    Ok(())
}

/// Trains the least squares problem with distributed shampoo, then leaves the mesh.
///
/// # Returns
/// The final loss.
async fn run_node<R, W>(spec: ShampooSpec, mut mesh: Mesh<R, W>, steps: u64) -> Result<f32>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let rank = mesh.rank();

    match train(spec, &mut mesh, steps).await {
        Ok(loss) => {
            mesh.disconnect().await?;
            Ok(loss)
        }
        Err(e) => {
            error!("rank {rank} failed: {e:#}");
            mesh.abort(&e.to_string()).await;
            Err(e)
        }
    }
}

async fn train<R, W>(spec: ShampooSpec, mesh: &mut Mesh<R, W>, steps: u64) -> Result<f32>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let problem = LeastSquares::generate(SAMPLES, INPUTS, OUTPUTS, SEED);
    let mut params = problem.init_params();
    let shapes: Vec<Vec<usize>> = params.iter().map(|p| p.shape().to_vec()).collect();

    let mut optimizer =
        ShampooBuilder::new(spec).build(&shapes, mesh.rank(), mesh.world_size())?;

    for step in 0..steps {
        let (loss, grads) = problem.loss_and_grads(&params)?;

        if mesh.rank() == 0 && step % LOG_EVERY == 0 {
            info!(step = step, loss = loss, phase:? = optimizer.phase(); "training");
        }

        optimizer.step(&mut params, &grads, mesh).await?;
    }

    let (loss, _) = problem.loss_and_grads(&params)?;
    Ok(loss)
}
