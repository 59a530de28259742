use log::info;

use crate::{
    blocking::{Blocker, Partition},
    distribution::Assignment,
    error::{Result, ShampooErr},
    optimizer::{BlockState, DistributedShampoo, OptimizerConfig, Schedule},
    specs::{LargeDimMethod, ShampooSpec},
};

/// Builds `DistributedShampoo` optimizers given a specification.
#[derive(Debug, Clone, Default)]
pub struct ShampooBuilder {
    spec: ShampooSpec,
}

impl ShampooBuilder {
    /// Creates a new `ShampooBuilder`.
    ///
    /// # Arguments
    /// * `spec` - The specification of the optimizer.
    ///
    /// # Returns
    /// A new `ShampooBuilder` instance.
    pub fn new(spec: ShampooSpec) -> Self {
        Self { spec }
    }

    /// Builds a new `DistributedShampoo` following the spec.
    ///
    /// Every worker of a group must build its optimizer with the same spec and shapes,
    /// so they agree on which worker computes the roots of every block.
    ///
    /// # Arguments
    /// * `shapes` - The shape of every parameter, in the order they'll be stepped.
    /// * `rank` - This worker's rank.
    /// * `world_size` - The amount of workers in the group.
    ///
    /// # Returns
    /// A new optimizer, or an error if any option is invalid.
    pub fn build<S: AsRef<[usize]>>(
        &self,
        shapes: &[S],
        rank: usize,
        world_size: usize,
    ) -> Result<DistributedShampoo> {
        let spec = &self.spec;
        spec.validate()?;

        if world_size == 0 {
            return Err(ShampooErr::invalid("world_size", "must be at least 1"));
        }

        if rank >= world_size {
            return Err(ShampooErr::RankOutOfRange { rank, world_size });
        }

        let config = OptimizerConfig::from_spec(spec)?;
        let schedule = Schedule::new(
            spec.start_step() as u64,
            spec.precondition_frequency as u64,
        );

        let blocker = Blocker::new(
            spec.max_preconditioner_dim,
            spec.use_merge_dims,
            spec.large_dim_method == LargeDimMethod::Blocking,
        );

        let partitions: Vec<Partition> = shapes
            .iter()
            .map(|shape| blocker.partition(shape.as_ref()))
            .collect();

        let blocks: Vec<Vec<BlockState>> = partitions
            .iter()
            .map(|partition| {
                partition
                    .blocks()
                    .iter()
                    .map(|block| BlockState::new(block.shape(), spec))
                    .collect()
            })
            .collect();

        let costs: Vec<Option<u64>> = blocks
            .iter()
            .flatten()
            .map(|state| {
                let preconditioner = state.preconditioner();
                preconditioner.has_roots().then(|| preconditioner.cost())
            })
            .collect();

        let assignment = Assignment::new(&costs, world_size);

        let optimizer = DistributedShampoo {
            config,
            schedule,
            partitions,
            blocks,
            assignment,
            rank,
            step: 0,
        };

        info!(
            params = shapes.len(),
            blocks = optimizer.block_count(),
            state = optimizer.parameter_count(),
            cost = optimizer.assignment().loads()[rank],
            rank = rank,
            world_size = world_size;
            "built distributed shampoo"
        );

        Ok(optimizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{preconditioning::BlockPreconditioner, specs::Precision};

    #[test]
    fn test_blocking_partitions_every_parameter() {
        let spec = ShampooSpec {
            max_preconditioner_dim: 2,
            ..Default::default()
        };
        let optimizer = ShampooBuilder::new(spec)
            .build(&[vec![4usize, 4], vec![3]], 0, 1)
            .unwrap();

        assert_eq!(optimizer.partitions()[0].blocks().len(), 4);
        assert_eq!(optimizer.partitions()[1].blocks().len(), 2);
        assert_eq!(optimizer.block_count(), 6);
    }

    #[test]
    fn test_scalars_use_adagrad() {
        let optimizer = ShampooBuilder::default()
            .build(&[Vec::<usize>::new()], 0, 1)
            .unwrap();

        let block = optimizer.block(0, 0).unwrap();
        assert!(matches!(block.preconditioner(), BlockPreconditioner::Adagrad(_)));
        assert!(optimizer.inverse_roots(0, 0).is_none());
        assert_eq!(optimizer.assignment().owner(0), None);
    }

    #[test]
    fn test_adagrad_large_dim_method() {
        let spec = ShampooSpec {
            max_preconditioner_dim: 4,
            large_dim_method: LargeDimMethod::Adagrad,
            use_merge_dims: false,
            ..Default::default()
        };
        let optimizer = ShampooBuilder::new(spec)
            .build(&[vec![8usize, 2], vec![3, 2]], 0, 1)
            .unwrap();

        assert_eq!(optimizer.block_count(), 2);
        assert!(matches!(
            optimizer.block(0, 0).unwrap().preconditioner(),
            BlockPreconditioner::Adagrad(_)
        ));
        assert!(matches!(
            optimizer.block(1, 0).unwrap().preconditioner(),
            BlockPreconditioner::Shampoo(_)
        ));
    }

    #[test]
    fn test_diagonal_large_dim_method() {
        let spec = ShampooSpec {
            max_preconditioner_dim: 4,
            large_dim_method: LargeDimMethod::Diagonal,
            use_merge_dims: false,
            ..Default::default()
        };
        let optimizer = ShampooBuilder::new(spec).build(&[[8usize, 2]], 0, 1).unwrap();

        let roots = optimizer.inverse_roots(0, 0).unwrap();
        assert_eq!(roots[0].shape(), &[8]);
        assert_eq!(roots[1].shape(), &[2, 2]);
    }

    #[test]
    fn test_rank_must_be_in_world() {
        let result = ShampooBuilder::default().build(&[[2usize]], 2, 2);
        assert!(matches!(
            result,
            Err(ShampooErr::RankOutOfRange { rank: 2, world_size: 2 })
        ));
    }

    #[test]
    fn test_invalid_spec_fails_at_construction() {
        let spec = ShampooSpec {
            root_inverse_precision: Precision::Bf16,
            ..Default::default()
        };

        assert!(ShampooBuilder::new(spec).build(&[[2usize]], 0, 1).is_err());
    }

    #[test]
    fn test_assignment_spreads_cost() {
        let spec = ShampooSpec {
            max_preconditioner_dim: 4,
            ..Default::default()
        };
        let optimizer = ShampooBuilder::new(spec).build(&[[8usize, 8]], 1, 2).unwrap();

        assert_eq!(optimizer.assignment().loads(), &[256, 256]);
        assert_eq!(optimizer.assignment().owned_by(1).count(), 2);
    }
}
