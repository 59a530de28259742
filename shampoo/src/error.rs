use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;

/// The result type used in the entire shampoo module.
pub type Result<T> = std::result::Result<T, ShampooErr>;

/// The shampoo module's error type.
#[derive(Debug)]
pub enum ShampooErr {
    InvalidConfig {
        field: &'static str,
        reason: String,
    },
    ParamCountMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        what: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    WorldSizeMismatch {
        got: usize,
        expected: usize,
    },
    RankOutOfRange {
        rank: usize,
        world_size: usize,
    },
    NonFinite {
        what: &'static str,
    },
    EigenNotConverged {
        iterations: usize,
    },
    NewtonNotConverged {
        iterations: usize,
        residual: f64,
    },
    Shape(ShapeError),
    Io(io::Error),
    Checkpoint(serde_json::Error),
}

impl ShampooErr {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

impl Display for ShampooErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShampooErr::InvalidConfig { field, reason } => {
                write!(f, "invalid configuration for `{field}`: {reason}")
            }
            ShampooErr::ParamCountMismatch {
                what,
                got,
                expected,
            } => write!(f, "got {got} {what}, expected {expected}"),
            ShampooErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what}: got {got:?}, expected {expected:?}"
            ),
            ShampooErr::WorldSizeMismatch { got, expected } => write!(
                f,
                "the communicator has {got} workers but the optimizer was built for {expected}"
            ),
            ShampooErr::RankOutOfRange { rank, world_size } => {
                write!(f, "rank {rank} is out of range for a world of size {world_size}")
            }
            ShampooErr::NonFinite { what } => write!(f, "found non finite values in {what}"),
            ShampooErr::EigenNotConverged { iterations } => write!(
                f,
                "the eigendecomposition didn't converge after {iterations} iterations"
            ),
            ShampooErr::NewtonNotConverged {
                iterations,
                residual,
            } => write!(
                f,
                "the coupled newton iteration didn't converge after {iterations} iterations, \
                 residual {residual:e}"
            ),
            ShampooErr::Shape(e) => write!(f, "shape error: {e}"),
            ShampooErr::Io(e) => write!(f, "communication error: {e}"),
            ShampooErr::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
        }
    }
}

impl Error for ShampooErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ShampooErr::Shape(e) => Some(e),
            ShampooErr::Io(e) => Some(e),
            ShampooErr::Checkpoint(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for ShampooErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<io::Error> for ShampooErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ShampooErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Checkpoint(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<ShampooErr> for io::Error {
    fn from(value: ShampooErr) -> Self {
        match value {
            ShampooErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
