mod grafting;
mod precision;
mod root_inverse;
mod shampoo;

pub use grafting::GraftingSpec;
pub use precision::Precision;
pub use root_inverse::{NewtonFallback, NewtonSpec, RootInverseSpec};
pub use shampoo::{LargeDimMethod, ShampooSpec};
