use anyhow::{Context, Result, ensure};
use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// A synthetic linear regression, `y = W x + b`, fitted by full batch least squares.
///
/// Every worker builds it out of the same seed, so they all compute the same gradients.
pub struct LeastSquares {
    x: Array2<f32>,
    y: Array2<f32>,
}

impl LeastSquares {
    /// Creates a new `LeastSquares` problem.
    ///
    /// # Arguments
    /// * `samples` - The amount of samples in the dataset.
    /// * `inputs` - The size of every input.
    /// * `outputs` - The size of every output.
    /// * `seed` - The seed for the dataset and the hidden solution.
    ///
    /// # Returns
    /// A new `LeastSquares` instance.
    pub fn generate(samples: usize, inputs: usize, outputs: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uniform = |shape: (usize, usize)| {
            Array2::from_shape_fn(shape, |_| rng.random_range(-1f32..1f32))
        };

        let x = uniform((samples, inputs));
        let w = uniform((outputs, inputs));
        let b = uniform((1, outputs));
        let y = x.dot(&w.t()) + &b;

        Self { x, y }
    }

    /// The initial parameters, a zeroed weight matrix and bias.
    pub fn init_params(&self) -> Vec<ArrayD<f32>> {
        let (inputs, outputs) = (self.x.ncols(), self.y.ncols());

        vec![
            Array2::<f32>::zeros((outputs, inputs)).into_dyn(),
            Array1::<f32>::zeros(outputs).into_dyn(),
        ]
    }

    /// Computes the mean squared error and its gradient with respect to every parameter.
    pub fn loss_and_grads(&self, params: &[ArrayD<f32>]) -> Result<(f32, Vec<ArrayD<f32>>)> {
        ensure!(params.len() == 2, "expected a weight and a bias");

        let w = params[0]
            .view()
            .into_dimensionality::<Ix2>()
            .context("the weight must be a matrix")?;
        let b = params[1]
            .view()
            .into_dimensionality::<Ix1>()
            .context("the bias must be a vector")?;

        let n = self.x.nrows() as f32;
        let residual = self.x.dot(&w.t()) + &b - &self.y;
        let loss = residual.mapv(|r| r * r).sum() / (2. * n);

        let grad_w = residual.t().dot(&self.x) / n;
        let grad_b = residual.sum_axis(Axis(0)) / n;

        Ok((loss, vec![grad_w.into_dyn(), grad_b.into_dyn()]))
    }
}
