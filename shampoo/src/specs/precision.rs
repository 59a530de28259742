use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// The numeric precision at which some stage of the optimizer is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Bf16,
    F16,
    #[default]
    F32,
    F64,
}

impl Precision {
    /// Rounds `x` to the closest value representable at this precision.
    ///
    /// # Arguments
    /// * `x` - The value to round.
    ///
    /// # Returns
    /// The rounded value, widened back to `f64`.
    pub fn round(self, x: f64) -> f64 {
        match self {
            Precision::Bf16 => bf16::from_f64(x).to_f64(),
            Precision::F16 => f16::from_f64(x).to_f64(),
            Precision::F32 => x as f32 as f64,
            Precision::F64 => x,
        }
    }

    /// Whether matrix roots can be computed at this precision.
    pub fn supports_roots(self) -> bool {
        matches!(self, Precision::F32 | Precision::F64)
    }
}
