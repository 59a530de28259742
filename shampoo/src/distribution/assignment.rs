use serde::{Deserialize, Serialize};

/// Which worker computes the inverse roots of every block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    owners: Vec<Option<usize>>,
    loads: Vec<u64>,
}

impl Assignment {
    /// Greedily balances blocks across workers by cost.
    ///
    /// Blocks are visited from the most to the least expensive (ties by index) and
    /// each is given to the worker with the lowest accumulated cost (ties to the
    /// lowest rank).
    ///
    /// # Arguments
    /// * `costs` - The cost of every block, `None` for blocks without inverse roots.
    /// * `world_size` - The amount of workers.
    ///
    /// # Returns
    /// The same assignment on every worker given the same inputs.
    pub fn new(costs: &[Option<u64>], world_size: usize) -> Self {
        let mut order: Vec<(usize, u64)> = costs
            .iter()
            .enumerate()
            .filter_map(|(i, cost)| cost.map(|c| (i, c)))
            .collect();
        order.sort_by(|(ia, ca), (ib, cb)| cb.cmp(ca).then(ia.cmp(ib)));

        let mut owners = vec![None; costs.len()];
        let mut loads = vec![0; world_size];

        for (i, cost) in order {
            let Some((rank, _)) = loads
                .iter()
                .enumerate()
                .min_by_key(|&(rank, &load)| (load, rank))
            else {
                break;
            };

            owners[i] = Some(rank);
            loads[rank] += cost;
        }

        Self { owners, loads }
    }

    /// The owner of the block at `index`, `None` if it has no inverse roots.
    pub fn owner(&self, index: usize) -> Option<usize> {
        self.owners.get(index).copied().flatten()
    }

    /// The indices of the blocks owned by `rank`, in ascending order.
    pub fn owned_by(&self, rank: usize) -> impl Iterator<Item = usize> + '_ {
        self.owners
            .iter()
            .enumerate()
            .filter_map(move |(i, owner)| (*owner == Some(rank)).then_some(i))
    }

    /// The accumulated cost of every worker.
    pub fn loads(&self) -> &[u64] {
        &self.loads
    }

    pub fn world_size(&self) -> usize {
        self.loads.len()
    }
}
