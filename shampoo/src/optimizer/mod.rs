mod block;
mod config;
mod phase;
mod shampoo;

pub use block::BlockState;
pub use config::OptimizerConfig;
pub use phase::{Phase, Schedule};
pub use shampoo::DistributedShampoo;
