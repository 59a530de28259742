use std::ops::Range;

use ndarray::{ArrayD, ArrayViewMutD, Slice};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShampooErr};

/// Folds consecutive axes together while their product stays within `max_dim`.
///
/// # Arguments
/// * `shape` - The shape of the tensor.
/// * `max_dim` - The largest dimension a merged axis may have.
///
/// # Returns
/// The merged shape, with the same amount of elements as `shape`.
pub fn merge_small_dims(shape: &[usize], max_dim: usize) -> Vec<usize> {
    let mut merged: Vec<usize> = Vec::with_capacity(shape.len());

    for &dim in shape {
        match merged.last_mut() {
            Some(last) if *last * dim <= max_dim => *last *= dim,
            _ => merged.push(dim),
        }
    }

    merged
}

/// Cuts `len` into `⌈len / max⌉` contiguous chunks whose lengths differ by at most one.
fn chunk_lengths(len: usize, max: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }

    let n = len.div_ceil(max);
    let (base, extra) = (len / n, len % n);
    (0..n).map(|i| base + usize::from(i < extra)).collect()
}

/// A contiguous region of a (merged) parameter, the unit of preconditioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    offsets: Vec<usize>,
    shape: Vec<usize>,
}

impl BlockSpec {
    /// The offset of this block inside the merged parameter, per axis.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The amount of axes of this block.
    pub fn order(&self) -> usize {
        self.shape.len()
    }

    /// The amount of elements in this block.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(&self, axis: usize) -> Range<usize> {
        let start = self.offsets[axis];
        start..start + self.shape[axis]
    }
}

/// Decides how every parameter is cut into blocks.
#[derive(Debug, Clone, Copy)]
pub struct Blocker {
    max_dim: usize,
    merge_dims: bool,
    split: bool,
}

impl Blocker {
    /// Creates a new `Blocker`.
    ///
    /// # Arguments
    /// * `max_dim` - The maximum size of any block along any axis.
    /// * `merge_dims` - Whether to fold small consecutive axes together first.
    /// * `split` - Whether axes larger than `max_dim` are cut into chunks, if not every
    ///   parameter is a single block.
    ///
    /// # Returns
    /// A new `Blocker` instance.
    pub fn new(max_dim: usize, merge_dims: bool, split: bool) -> Self {
        Self {
            max_dim,
            merge_dims,
            split,
        }
    }

    /// Partitions a parameter of the given shape.
    ///
    /// # Arguments
    /// * `shape` - The shape of the parameter.
    ///
    /// # Returns
    /// The partition, with blocks in row major order over the chunk grid.
    pub fn partition(&self, shape: &[usize]) -> Partition {
        let merged = if self.merge_dims {
            merge_small_dims(shape, self.max_dim)
        } else {
            shape.to_vec()
        };

        let mut blocks = vec![BlockSpec {
            offsets: Vec::new(),
            shape: Vec::new(),
        }];

        for &dim in &merged {
            let chunks = if self.split {
                chunk_lengths(dim, self.max_dim)
            } else if dim == 0 {
                Vec::new()
            } else {
                vec![dim]
            };

            blocks = blocks
                .into_iter()
                .flat_map(|block| {
                    let mut offset = 0;
                    chunks
                        .iter()
                        .map(move |&len| {
                            let mut next = block.clone();
                            next.offsets.push(offset);
                            next.shape.push(len);
                            offset += len;
                            next
                        })
                        .collect::<Vec<_>>()
                })
                .collect();
        }

        Partition {
            shape: shape.to_vec(),
            merged,
            blocks,
        }
    }
}

/// The blocks a parameter was cut into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    shape: Vec<usize>,
    merged: Vec<usize>,
    blocks: Vec<BlockSpec>,
}

impl Partition {
    /// The shape of the parameter this partition was made for.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn merged_shape(&self) -> &[usize] {
        &self.merged
    }

    pub fn blocks(&self) -> &[BlockSpec] {
        &self.blocks
    }

    fn check_shape(&self, what: &str, shape: &[usize]) -> Result<()> {
        if shape != self.shape.as_slice() {
            return Err(ShampooErr::ShapeMismatch {
                what: what.to_string(),
                got: shape.to_vec(),
                expected: self.shape.clone(),
            });
        }

        Ok(())
    }

    /// Copies every block of `tensor` out, widened to `f64`.
    ///
    /// # Arguments
    /// * `tensor` - A tensor with the parameter's shape.
    ///
    /// # Returns
    /// One array per block, shaped like the block.
    pub fn split(&self, tensor: &ArrayD<f32>) -> Result<Vec<ArrayD<f64>>> {
        self.check_shape("tensor", tensor.shape())?;
        let merged = tensor.to_shape(self.merged.clone())?;

        let blocks = self
            .blocks
            .iter()
            .map(|block| {
                merged
                    .slice_each_axis(|ax| Slice::from(block.range(ax.axis.index())))
                    .mapv(f64::from)
            })
            .collect();

        Ok(blocks)
    }

    /// Visits every block of `param` mutably, in block order.
    ///
    /// # Arguments
    /// * `param` - The parameter, it's made standard layout if it isn't already.
    /// * `f` - Called with the block index and a mutable view of that block.
    pub fn for_each_block_mut<F>(&self, param: &mut ArrayD<f32>, mut f: F) -> Result<()>
    where
        F: FnMut(usize, ArrayViewMutD<'_, f32>) -> Result<()>,
    {
        self.check_shape("parameter", param.shape())?;

        if !param.is_standard_layout() {
            *param = param.as_standard_layout().into_owned();
        }

        let mut merged = param.view_mut().into_shape_with_order(self.merged.clone())?;

        for (i, block) in self.blocks.iter().enumerate() {
            let view = merged.slice_each_axis_mut(|ax| Slice::from(block.range(ax.axis.index())));
            f(i, view)?;
        }

        Ok(())
    }
}
