mod assignment;
mod communicator;

pub use assignment::Assignment;
pub use communicator::{Communicator, SingleWorker};
