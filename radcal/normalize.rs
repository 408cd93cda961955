//! Relative radiometric normalization of a target image onto a reference.
//!
//! Pixels whose IR-MAD no-change probability exceeds a threshold are treated
//! as radiometrically invariant. For every band an orthogonal regression of
//! the reference on the target is fitted over those pixels, and the target is
//! mapped through the resulting line.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, ShapeError, stack};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mad::accumulate::{AccumulatorError, WeightedCovariance};
use crate::mad::fit::MadError;
use crate::mad::transform::NoChangeProbability;

pub const DEFAULT_NO_CHANGE_THRESHOLD: f64 = 0.95;

#[derive(Debug, Error)]
pub enum RadcalError {
    #[error(
        "only {found} pixels have a no-change probability above {threshold}; at least two are required"
    )]
    TooFewInvariantPixels { found: usize, threshold: f64 },
    #[error("band {band}: reference and target are uncorrelated over the invariant pixels")]
    DegenerateRegression { band: usize },
    #[error("regression statistics failed: {0}")]
    Accumulator(#[from] AccumulatorError),
    #[error(transparent)]
    Mad(#[from] MadError),
    #[error("inconsistent array shapes: {0}")]
    Shape(#[from] ShapeError),
    #[error("{0}")]
    InvalidInput(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizationOptions {
    pub no_change_threshold: f64,
}

impl Default for NormalizationOptions {
    fn default() -> Self {
        Self {
            no_change_threshold: DEFAULT_NO_CHANGE_THRESHOLD,
        }
    }
}

impl NormalizationOptions {
    pub fn validate(&self) -> Result<(), RadcalError> {
        let t = self.no_change_threshold;
        if !(t > 0.0 && t < 1.0) {
            return Err(RadcalError::InvalidInput(format!(
                "no-change threshold must lie strictly between 0 and 1, got {t}"
            )));
        }
        Ok(())
    }
}

/// Total least squares line `y = intercept + slope * x`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrthogonalFit {
    pub slope: f64,
    pub intercept: f64,
    pub correlation: f64,
}

impl OrthogonalFit {
    /// Fits the principal axis of the `(x, y)` scatter. `band` only labels
    /// the error.
    pub fn estimate(
        band: usize,
        x: ArrayView1<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<Self, RadcalError> {
        if x.len() != y.len() {
            return Err(RadcalError::InvalidInput(format!(
                "band {band}: {} target samples but {} reference samples",
                x.len(),
                y.len()
            )));
        }
        let mut stats = WeightedCovariance::new(2);
        stats.update(stack(Axis(1), &[x.view(), y.view()])?.view(), None)?;
        let cov = stats.covariance()?;
        let (sxx, syy, sxy) = (cov[[0, 0]], cov[[1, 1]], cov[[0, 1]]);
        if sxy == 0.0 || !sxy.is_finite() {
            return Err(RadcalError::DegenerateRegression { band });
        }

        let spread = syy - sxx;
        let slope = (spread + (spread * spread + 4.0 * sxy * sxy).sqrt()) / (2.0 * sxy);
        let means = stats.means();
        Ok(Self {
            slope,
            intercept: means[1] - slope * means[0],
            correlation: sxy / (sxx * syy).sqrt(),
        })
    }

    pub fn apply(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Per-band normalization fitted over invariant pixels.
#[derive(Clone, Debug)]
pub struct RadiometricNormalization {
    invariant: Vec<usize>,
    fits: Vec<OrthogonalFit>,
}

impl RadiometricNormalization {
    /// `reference` and `target` are `bands x pixels`; `chi_square` holds one
    /// value per pixel in the same order.
    pub fn fit(
        reference: ArrayView2<'_, f64>,
        target: ArrayView2<'_, f64>,
        chi_square: ArrayView1<'_, f64>,
        degrees_of_freedom: usize,
        options: &NormalizationOptions,
    ) -> Result<Self, RadcalError> {
        options.validate()?;
        if reference.dim() != target.dim() {
            return Err(RadcalError::InvalidInput(format!(
                "reference is {:?} but target is {:?}",
                reference.dim(),
                target.dim()
            )));
        }
        if reference.ncols() != chi_square.len() {
            return Err(RadcalError::InvalidInput(format!(
                "{} image pixels but {} chi-square values",
                reference.ncols(),
                chi_square.len()
            )));
        }

        let no_change = NoChangeProbability::new(degrees_of_freedom)?;
        let threshold = options.no_change_threshold;
        let invariant: Vec<usize> = chi_square
            .iter()
            .enumerate()
            .filter(|&(i, &chi)| {
                has_data(reference.column(i))
                    && has_data(target.column(i))
                    && no_change.evaluate(chi) > threshold
            })
            .map(|(i, _)| i)
            .collect();
        log::info!(
            "{} of {} pixels are invariant at no-change probability > {}",
            invariant.len(),
            chi_square.len(),
            threshold
        );
        if invariant.len() < 2 {
            return Err(RadcalError::TooFewInvariantPixels {
                found: invariant.len(),
                threshold,
            });
        }

        let reference = reference.select(Axis(1), &invariant);
        let target = target.select(Axis(1), &invariant);
        let fits = target
            .rows()
            .into_iter()
            .zip(reference.rows())
            .enumerate()
            .map(|(band, (x, y))| {
                let fit = OrthogonalFit::estimate(band + 1, x, y)?;
                log::info!(
                    "Band {}: slope {:.6}, intercept {:.6}, correlation {:.6}",
                    band + 1,
                    fit.slope,
                    fit.intercept,
                    fit.correlation
                );
                Ok(fit)
            })
            .collect::<Result<Vec<_>, RadcalError>>()?;

        Ok(Self { invariant, fits })
    }

    /// Pixel indices used for the regressions.
    pub fn invariant_pixels(&self) -> &[usize] {
        &self.invariant
    }

    pub fn fits(&self) -> &[OrthogonalFit] {
        &self.fits
    }

    pub fn apply_band(
        &self,
        band: usize,
        target: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, RadcalError> {
        let fit = self.fits.get(band).ok_or_else(|| {
            RadcalError::InvalidInput(format!(
                "band index {band} is outside the {} fitted bands",
                self.fits.len()
            ))
        })?;
        Ok(target.mapv(|v| fit.apply(v)))
    }

    /// Normalizes a `bands x pixels` target array.
    pub fn apply(&self, target: ArrayView2<'_, f64>) -> Result<Array2<f64>, RadcalError> {
        if target.nrows() != self.fits.len() {
            return Err(RadcalError::InvalidInput(format!(
                "target has {} bands but {} were fitted",
                target.nrows(),
                self.fits.len()
            )));
        }
        let mut out = target.to_owned();
        for (mut row, fit) in out.rows_mut().into_iter().zip(&self.fits) {
            row.mapv_inplace(|v| fit.apply(v));
        }
        Ok(out)
    }
}

fn has_data(values: ArrayView1<'_, f64>) -> bool {
    values.iter().all(|v| v.is_finite()) && values.sum() != 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn orthogonal_fit_recovers_an_exact_line() {
        let x = Array::linspace(10.0, 200.0, 50);
        let y = x.mapv(|v| 3.0 + 1.5 * v);
        let fit = OrthogonalFit::estimate(1, x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(fit.slope, 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.intercept, 3.0, epsilon = 1e-7);
        assert_abs_diff_eq!(fit.correlation, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.apply(100.0), 153.0, epsilon = 1e-7);
    }

    #[test]
    fn orthogonal_fit_is_symmetric_in_its_axes() {
        let mut rng = StdRng::seed_from_u64(11);
        let noise = Normal::new(0.0, 2.0).unwrap();
        let x = Array::from_shape_fn(400, |i| i as f64 * 0.5);
        let y = x.mapv(|v| 5.0 + 0.8 * v + noise.sample(&mut rng));
        let forward = OrthogonalFit::estimate(1, x.view(), y.view()).unwrap();
        let backward = OrthogonalFit::estimate(1, y.view(), x.view()).unwrap();
        assert_abs_diff_eq!(forward.slope * backward.slope, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(forward.correlation, backward.correlation, epsilon = 1e-12);
    }

    #[test]
    fn uncorrelated_bands_are_degenerate() {
        let x = array![1.0, 2.0, 1.0, 2.0];
        let y = array![1.0, 1.0, 2.0, 2.0];
        assert!(matches!(
            OrthogonalFit::estimate(2, x.view(), y.view()),
            Err(RadcalError::DegenerateRegression { band: 2 })
        ));
    }

    #[test]
    fn normalization_uses_only_invariant_pixels() {
        // Band values for six pixels; the last one changed.
        let target = array![
            [10.0, 20.0, 30.0, 40.0, 50.0, 60.0],
            [5.0, 15.0, 25.0, 35.0, 45.0, 55.0]
        ];
        let mut reference = target.mapv(|v| 2.0 * v + 1.0);
        reference[[0, 5]] = 900.0;
        reference[[1, 5]] = 5.0;
        let chi_square = array![0.01, 0.02, 0.01, 0.0, 0.03, 40.0];

        let norm = RadiometricNormalization::fit(
            reference.view(),
            target.view(),
            chi_square.view(),
            2,
            &NormalizationOptions::default(),
        )
        .unwrap();

        assert_eq!(norm.invariant_pixels(), &[0, 1, 2, 3, 4]);
        for fit in norm.fits() {
            assert_abs_diff_eq!(fit.slope, 2.0, epsilon = 1e-9);
            assert_abs_diff_eq!(fit.intercept, 1.0, epsilon = 1e-7);
        }
        let normalized = norm.apply(target.view()).unwrap();
        assert_abs_diff_eq!(normalized[[0, 5]], 121.0, epsilon = 1e-6);
        let band = norm.apply_band(1, target.row(1)).unwrap();
        assert_abs_diff_eq!(band[0], 11.0, epsilon = 1e-6);
        assert!(norm.apply_band(2, target.row(1)).is_err());
    }

    #[test]
    fn everything_changed_is_too_few_pixels() {
        let target = array![[10.0, 20.0, 30.0]];
        let reference = array![[12.0, 25.0, 31.0]];
        let chi_square = array![50.0, 60.0, 70.0];
        assert!(matches!(
            RadiometricNormalization::fit(
                reference.view(),
                target.view(),
                chi_square.view(),
                1,
                &NormalizationOptions::default(),
            ),
            Err(RadcalError::TooFewInvariantPixels { found: 0, .. })
        ));
    }

    #[test]
    fn threshold_must_be_a_probability() {
        let options = NormalizationOptions {
            no_change_threshold: 1.0,
        };
        assert!(options.validate().is_err());
        assert!(NormalizationOptions::default().validate().is_ok());
    }
}
