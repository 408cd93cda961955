//! Streaming weighted mean and covariance.
//!
//! Batches are folded in with the pairwise (parallel-sum) update: each batch is
//! centered on its own weighted mean, and the cross term between the running
//! mean and the batch mean enters as a rank-one correction scaled by
//! `w_a * w_b / (w_a + w_b)`. Merging two partial accumulators uses the same
//! rule, so any split of the pixels over blocks, chunks or threads yields the
//! same statistics up to rounding.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AccumulatorError {
    #[error(
        "accumulated weight {weight_sum:.6} over {pixels} valid pixels is too small to estimate a covariance"
    )]
    Empty { weight_sum: f64, pixels: usize },
    #[error("batch vectors have dimension {found} but the accumulator holds dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("batch holds {rows} vectors but {weights} weights were supplied")]
    WeightCountMismatch { rows: usize, weights: usize },
    #[error("weight {value} at batch row {row} is negative or not finite")]
    InvalidWeight { row: usize, value: f64 },
}

/// Weighted mean, scatter matrix and cumulative weight of a stream of vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedCovariance {
    mean: Array1<f64>,
    scatter: Array2<f64>,
    weight_sum: f64,
    pixels: usize,
}

impl WeightedCovariance {
    pub fn new(dimension: usize) -> Self {
        Self {
            mean: Array1::zeros(dimension),
            scatter: Array2::zeros((dimension, dimension)),
            weight_sum: 0.0,
            pixels: 0,
        }
    }

    /// Clears all state and resizes the accumulator to `dimension`.
    pub fn reset(&mut self, dimension: usize) {
        *self = Self::new(dimension);
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    pub fn weight_sum(&self) -> f64 {
        self.weight_sum
    }

    /// Number of vectors that entered with a strictly positive weight.
    pub fn pixels(&self) -> usize {
        self.pixels
    }

    pub fn means(&self) -> ArrayView1<'_, f64> {
        self.mean.view()
    }

    /// Folds a batch of row vectors into the running statistics. A missing
    /// `weights` argument means every row has weight one.
    pub fn update(
        &mut self,
        batch: ArrayView2<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<(), AccumulatorError> {
        let (rows, dim) = batch.dim();
        if dim != self.dimension() {
            return Err(AccumulatorError::DimensionMismatch {
                expected: self.dimension(),
                found: dim,
            });
        }
        if rows == 0 {
            return Ok(());
        }

        let weights = match weights {
            Some(weights) => {
                if weights.len() != rows {
                    return Err(AccumulatorError::WeightCountMismatch {
                        rows,
                        weights: weights.len(),
                    });
                }
                if let Some((row, &value)) = weights
                    .iter()
                    .enumerate()
                    .find(|(_, w)| !w.is_finite() || **w < 0.0)
                {
                    return Err(AccumulatorError::InvalidWeight { row, value });
                }
                weights.to_owned()
            }
            None => Array1::ones(rows),
        };

        let batch_weight = weights.sum();
        if batch_weight <= 0.0 {
            return Ok(());
        }
        let contributing = weights.iter().filter(|&&w| w > 0.0).count();

        let batch_mean = weights.dot(&batch) / batch_weight;
        let centered = &batch - &batch_mean;
        let weighted = &centered * &weights.view().insert_axis(Axis(1));
        let batch_scatter = weighted.t().dot(&centered);

        self.absorb(
            batch_weight,
            batch_mean.view(),
            batch_scatter.view(),
            contributing,
        );
        Ok(())
    }

    /// Merges another partial accumulator into this one.
    pub fn merge(&mut self, other: &WeightedCovariance) -> Result<(), AccumulatorError> {
        if other.dimension() != self.dimension() {
            return Err(AccumulatorError::DimensionMismatch {
                expected: self.dimension(),
                found: other.dimension(),
            });
        }
        self.absorb(
            other.weight_sum,
            other.mean.view(),
            other.scatter.view(),
            other.pixels,
        );
        Ok(())
    }

    /// Owned merge for reductions where both sides are known to share a
    /// dimension.
    pub(crate) fn combine(mut self, other: WeightedCovariance) -> WeightedCovariance {
        debug_assert_eq!(self.dimension(), other.dimension());
        self.absorb(
            other.weight_sum,
            other.mean.view(),
            other.scatter.view(),
            other.pixels,
        );
        self
    }

    /// Unbiased weighted covariance, `scatter / (weight_sum - 1)`.
    pub fn covariance(&self) -> Result<Array2<f64>, AccumulatorError> {
        if self.weight_sum <= 1.0 {
            return Err(AccumulatorError::Empty {
                weight_sum: self.weight_sum,
                pixels: self.pixels,
            });
        }
        let scale = 1.0 / (self.weight_sum - 1.0);
        let symmetric = (&self.scatter + &self.scatter.t()) * (0.5 * scale);
        Ok(symmetric)
    }

    fn absorb(
        &mut self,
        weight: f64,
        mean: ArrayView1<'_, f64>,
        scatter: ArrayView2<'_, f64>,
        pixels: usize,
    ) {
        self.pixels += pixels;
        if weight <= 0.0 {
            return;
        }

        let total = self.weight_sum + weight;
        let delta = &mean - &self.mean;
        let correction = self.weight_sum * weight / total;

        self.scatter += &scatter;
        if correction > 0.0 {
            let column = delta.view().insert_axis(Axis(1));
            let row = delta.view().insert_axis(Axis(0));
            self.scatter.scaled_add(correction, &column.dot(&row));
        }
        self.mean.scaled_add(weight / total, &delta);
        self.weight_sum = total;
    }
}
