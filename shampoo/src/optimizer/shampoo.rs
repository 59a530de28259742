use log::{debug, info};
use ndarray::ArrayD;
use rayon::prelude::*;

use super::{BlockState, OptimizerConfig, Phase, Schedule};
use crate::{
    blocking::Partition,
    distribution::{Assignment, Communicator},
    error::{Result, ShampooErr},
    preconditioning::BlockPreconditioner,
};

/// The distributed shampoo optimizer.
///
/// Every worker holds the full optimizer state and receives the same gradients. The
/// inverse roots of every block are computed by a single worker and broadcast to the
/// rest, everything else is computed locally and identically on every worker.
#[derive(Debug)]
pub struct DistributedShampoo {
    pub(crate) config: OptimizerConfig,
    pub(crate) schedule: Schedule,
    pub(crate) partitions: Vec<Partition>,
    pub(crate) blocks: Vec<Vec<BlockState>>,
    pub(crate) assignment: Assignment,
    pub(crate) rank: usize,
    pub(crate) step: u64,
}

impl DistributedShampoo {
    /// The index of the next step to be taken.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// The phase the next step will run in.
    pub fn phase(&self) -> Phase {
        self.schedule.phase(self.step)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.assignment.world_size()
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// The total amount of blocks across every parameter.
    pub fn block_count(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// The amount of `f64`s held as optimizer state.
    pub fn parameter_count(&self) -> usize {
        self.blocks.iter().flatten().map(BlockState::len).sum()
    }

    /// Which worker computes the roots of every block, indexed by global block index.
    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    /// The state of a single block.
    pub fn block(&self, param: usize, block: usize) -> Option<&BlockState> {
        self.blocks.get(param)?.get(block)
    }

    /// The cached inverse roots of a block, one per axis.
    pub fn inverse_roots(&self, param: usize, block: usize) -> Option<Vec<ArrayD<f64>>> {
        match &self.block(param, block)?.preconditioner {
            BlockPreconditioner::Shampoo(p) => {
                Some(p.factors().iter().map(|f| f.inverse_root()).collect())
            }
            BlockPreconditioner::Adagrad(_) => None,
        }
    }

    fn check_step_inputs<C: Communicator>(
        &self,
        params: &[ArrayD<f32>],
        grads: &[ArrayD<f32>],
        comm: &C,
    ) -> Result<()> {
        let expected = self.partitions.len();

        if params.len() != expected {
            return Err(ShampooErr::ParamCountMismatch {
                what: "parameters",
                got: params.len(),
                expected,
            });
        }

        if grads.len() != expected {
            return Err(ShampooErr::ParamCountMismatch {
                what: "gradients",
                got: grads.len(),
                expected,
            });
        }

        if comm.world_size() != self.world_size() {
            return Err(ShampooErr::WorldSizeMismatch {
                got: comm.world_size(),
                expected: self.world_size(),
            });
        }

        if comm.rank() != self.rank {
            return Err(ShampooErr::invalid(
                "rank",
                format!(
                    "the optimizer was built for rank {} but the communicator is rank {}",
                    self.rank,
                    comm.rank()
                ),
            ));
        }

        let inputs = params.iter().zip(grads).zip(&self.partitions);
        for (i, ((param, grad), partition)) in inputs.enumerate() {
            for (what, shape) in [("parameter", param.shape()), ("gradient", grad.shape())] {
                if shape != partition.shape() {
                    return Err(ShampooErr::ShapeMismatch {
                        what: format!("{what} {i}"),
                        got: shape.to_vec(),
                        expected: partition.shape().to_vec(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Takes a single optimization step, updating `params` in place.
    ///
    /// Every worker of the group must call this method with the same gradients, the
    /// step blocks until the inverse roots computed elsewhere have been received.
    ///
    /// # Arguments
    /// * `params` - The parameters to optimize, in the order the optimizer was built with.
    /// * `grads` - The gradient of every parameter, a gradient of zeros skips its parameter.
    /// * `comm` - The worker group.
    ///
    /// # Returns
    /// An error if the inputs don't match the optimizer, a root can't be computed
    /// without protection or the communication fails. The step is fatal in all cases.
    pub async fn step<C: Communicator>(
        &mut self,
        params: &mut [ArrayD<f32>],
        grads: &[ArrayD<f32>],
        comm: &mut C,
    ) -> Result<()> {
        self.check_step_inputs(params, grads, comm)?;

        let step = self.step;
        let phase = self.schedule.phase(step);
        let cfg = self.config;

        if phase == Phase::Active && step == self.schedule.start() {
            info!(step = step; "switching from grafting to shampoo");
        }

        let mut filtered = Vec::with_capacity(params.len());
        for ((param, grad), (partition, states)) in params
            .iter()
            .zip(grads)
            .zip(self.partitions.iter().zip(self.blocks.iter_mut()))
        {
            if grad.iter().all(|&g| g == 0.) {
                filtered.push(None);
                continue;
            }

            let mut block_grads = partition.split(grad)?;
            if !cfg.decoupled_weight_decay && cfg.weight_decay != 0. {
                for (g, p) in block_grads.iter_mut().zip(partition.split(param)?) {
                    g.scaled_add(cfg.weight_decay, &p);
                }
            }

            let block_grads = states
                .par_iter_mut()
                .zip(block_grads.into_par_iter())
                .map(|(state, g)| state.accumulate(g, &cfg, step))
                .collect::<Result<Vec<_>>>()?;

            filtered.push(Some(block_grads));
        }

        if self.schedule.refreshes_roots(step) {
            self.refresh_roots(step, comm).await?;
        }

        let decay = if cfg.decoupled_weight_decay {
            1. - cfg.lr * cfg.weight_decay
        } else {
            1.
        };

        for ((param, block_grads), (partition, states)) in params
            .iter_mut()
            .zip(filtered)
            .zip(self.partitions.iter().zip(self.blocks.iter_mut()))
        {
            let Some(block_grads) = block_grads else {
                continue;
            };

            let directions = states
                .par_iter_mut()
                .zip(block_grads.par_iter())
                .map(|(state, g)| {
                    let direction = state.direction(g, phase, &cfg, step)?;
                    Ok(state.apply_momentum(direction, &cfg))
                })
                .collect::<Result<Vec<_>>>()?;

            partition.for_each_block_mut(param, |b, mut view| {
                view.zip_mut_with(&directions[b], |p, &d| {
                    *p = (f64::from(*p) * decay - cfg.lr * d) as f32;
                });
                Ok(())
            })?;
        }

        self.step += 1;
        Ok(())
    }

    /// Recomputes the inverse roots of the blocks owned by this worker and exchanges
    /// them with the rest of the group.
    async fn refresh_roots<C: Communicator>(&mut self, step: u64, comm: &mut C) -> Result<()> {
        let rank = self.rank;
        let cfg = self.config.preconditioner;
        let assignment = &self.assignment;
        let mut states: Vec<&mut BlockState> = self.blocks.iter_mut().flatten().collect();

        let residuals: Vec<Vec<f64>> = states
            .par_iter_mut()
            .enumerate()
            .filter(|(i, _)| assignment.owner(*i) == Some(rank))
            .map(|(_, state)| state.preconditioner.refresh_roots(&cfg, step))
            .collect::<Result<_>>()?;

        debug!(step = step, blocks = residuals.len(); "recomputed inverse roots");

        if cfg.debug_mode {
            let residuals: Vec<f64> = residuals.into_iter().flatten().collect();
            if !residuals.is_empty() {
                let mean = residuals.iter().sum::<f64>() / residuals.len() as f64;
                let max = residuals.iter().copied().fold(0., f64::max);
                debug!(step = step, mean = mean, max = max; "inverse root residuals");
            }
        }

        if assignment.world_size() == 1 {
            return Ok(());
        }

        for source in 0..assignment.world_size() {
            let owned: Vec<usize> = assignment.owned_by(source).collect();
            let len: usize = owned
                .iter()
                .map(|&i| states[i].preconditioner.root_len())
                .sum();

            if len == 0 {
                continue;
            }

            let mut buf = vec![0.; len];
            if source == rank {
                pack_roots(&states, &owned, &mut buf);
            }

            comm.broadcast(&mut buf, source).await?;

            if source != rank {
                unpack_roots(&mut states, &owned, &buf);
            }
        }

        Ok(())
    }
}

fn pack_roots(states: &[&mut BlockState], owned: &[usize], buf: &mut [f64]) {
    let mut offset = 0;
    for &i in owned {
        let len = states[i].preconditioner.root_len();
        states[i]
            .preconditioner
            .write_roots(&mut buf[offset..offset + len]);
        offset += len;
    }
}

fn unpack_roots(states: &mut [&mut BlockState], owned: &[usize], buf: &[f64]) {
    let mut offset = 0;
    for &i in owned {
        let len = states[i].preconditioner.root_len();
        states[i].preconditioner.read_roots(&buf[offset..offset + len]);
        offset += len;
    }
}
