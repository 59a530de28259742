pub mod blocking;
mod builder;
pub mod checkpoint;
pub mod distribution;
pub mod error;
pub mod grafting;
pub mod linalg;
mod optimizer;
pub mod preconditioning;
pub mod specs;

pub use builder::ShampooBuilder;
pub use checkpoint::ShampooState;
pub use distribution::{Communicator, SingleWorker};
pub use error::{Result, ShampooErr};
pub use optimizer::{BlockState, DistributedShampoo, Phase};
