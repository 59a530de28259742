use serde::{Deserialize, Serialize};

/// The specification for the grafting method, the simple optimizer whose per block
/// step norm is borrowed by the shampoo direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraftingSpec {
    None,
    Sgd,
    #[default]
    Adagrad,
    Rmsprop,
    Adam,
    AdagradNormalized,
    RmspropNormalized,
    AdamNormalized,
}

impl GraftingSpec {
    /// Whether this method keeps a running average governed by `grafting_beta2`.
    pub fn uses_beta2(self) -> bool {
        matches!(
            self,
            Self::Rmsprop | Self::Adam | Self::RmspropNormalized | Self::AdamNormalized
        )
    }

    /// Whether the gradient is divided by its own norm before accumulation.
    pub fn is_normalized(self) -> bool {
        matches!(
            self,
            Self::AdagradNormalized | Self::RmspropNormalized | Self::AdamNormalized
        )
    }
}
