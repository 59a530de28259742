use serde::{Deserialize, Serialize};

use crate::{
    blocking::Partition,
    error::{Result, ShampooErr},
    optimizer::{BlockState, DistributedShampoo},
};

/// The persisted state of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub partition: Partition,
    pub blocks: Vec<BlockState>,
}

/// The persisted state of the whole optimizer.
///
/// Every worker of a group holds the same state, so a checkpoint taken on any
/// worker can be restored on every other one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShampooState {
    pub step: u64,
    pub parameters: Vec<ParameterState>,
}

impl ShampooState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn mismatch(what: String, got: &[usize], expected: &[usize]) -> ShampooErr {
    ShampooErr::ShapeMismatch {
        what,
        got: got.to_vec(),
        expected: expected.to_vec(),
    }
}

impl DistributedShampoo {
    /// Snapshots the optimizer state.
    pub fn state_dict(&self) -> ShampooState {
        let parameters = self
            .partitions
            .iter()
            .zip(&self.blocks)
            .map(|(partition, blocks)| ParameterState {
                partition: partition.clone(),
                blocks: blocks.clone(),
            })
            .collect();

        ShampooState {
            step: self.step,
            parameters,
        }
    }

    /// Restores a snapshot taken with `state_dict`.
    ///
    /// # Arguments
    /// * `state` - The snapshot.
    ///
    /// # Returns
    /// An error if the snapshot was taken for differently shaped parameters or a
    /// differently configured optimizer, in which case nothing is restored.
    pub fn load_state_dict(&mut self, state: ShampooState) -> Result<()> {
        if state.parameters.len() != self.partitions.len() {
            return Err(ShampooErr::ParamCountMismatch {
                what: "parameters in the checkpoint",
                got: state.parameters.len(),
                expected: self.partitions.len(),
            });
        }

        for (i, (saved, live)) in state.parameters.iter().zip(&self.partitions).enumerate() {
            let partition = &saved.partition;

            if partition.shape() != live.shape() {
                return Err(mismatch(
                    format!("parameter {i}"),
                    partition.shape(),
                    live.shape(),
                ));
            }

            if partition != live {
                return Err(mismatch(
                    format!("block partition of parameter {i}"),
                    &[partition.blocks().len()],
                    &[live.blocks().len()],
                ));
            }

            if saved.blocks.len() != live.blocks().len() {
                return Err(mismatch(
                    format!("block states of parameter {i}"),
                    &[saved.blocks.len()],
                    &[live.blocks().len()],
                ));
            }

            for (b, (saved, live)) in saved.blocks.iter().zip(&self.blocks[i]).enumerate() {
                live.check_restorable(saved, &format!("block {b} of parameter {i}"))?;

                let (got, expected) = (saved.layout(), live.layout());

                if got.len() != expected.len() {
                    return Err(mismatch(
                        format!("array count of block {b} of parameter {i}"),
                        &[got.len()],
                        &[expected.len()],
                    ));
                }

                if let Some((got, expected)) = got.iter().zip(&expected).find(|(g, e)| g != e) {
                    return Err(mismatch(
                        format!("state of block {b} of parameter {i}"),
                        got,
                        expected,
                    ));
                }
            }
        }

        self.step = state.step;
        self.blocks = state
            .parameters
            .into_iter()
            .map(|parameter| parameter.blocks)
            .collect();

        Ok(())
    }
}
