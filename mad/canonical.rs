//! Canonical correlation analysis of a partitioned `2p x 2p` covariance matrix.
//!
//! With `S11`, `S22` the reference/target blocks and `S12 = S21^T` the cross
//! block, the canonical vectors solve the two generalized symmetric problems
//!
//! ```text
//! S12 S22^-1 S21 a = mu^2 S11 a        S21 S11^-1 S12 b = mu^2 S22 b
//! ```
//!
//! Each is reduced to an ordinary symmetric problem through the Cholesky
//! factor `S = L L^T`: the eigenvectors `y` of `L^-1 C L^-T` map back to
//! `a = L^-T y`, which also gives the normalization `a^T S11 a = 1`.

use core::cmp::Ordering;
use core::fmt;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, Eigh, Inverse, UPLO};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest admissible ratio between a Cholesky pivot squared and the largest
/// diagonal entry of the block being factored.
pub const SINGULARITY_TOLERANCE: f64 = 1.0e-12;
/// Below this `b^T S22 b`, a projected target vector is treated as zero.
const PAIRING_FLOOR: f64 = 1.0e-20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceBlock {
    Reference,
    Target,
}

impl fmt::Display for CovarianceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => f.write_str("reference (S11)"),
            Self::Target => f.write_str("target (S22)"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error(
        "the {block} covariance block is singular; the selected bands are constant or collinear: {matrix}"
    )]
    Singular {
        block: CovarianceBlock,
        matrix: Array2<f64>,
    },
    #[error("covariance matrix is {rows}x{cols}, which does not split into two {bands}-band images")]
    Shape {
        rows: usize,
        cols: usize,
        bands: usize,
    },
    #[error("linear algebra failure while solving the canonical problem: {0}")]
    Linalg(#[from] LinalgError),
}

/// Canonical transform for one iteration.
///
/// Column `k` of `a` and of `b` forms the `k`-th pair of canonical variates;
/// `rho` is ascending, so the last pair is the most strongly correlated and the
/// first MAD variate carries the most change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPair {
    pub a: Array2<f64>,
    pub b: Array2<f64>,
    pub rho: Array1<f64>,
    pub sigma: Array1<f64>,
}

impl CanonicalPair {
    pub fn from_covariance(
        cov: ArrayView2<'_, f64>,
        bands: usize,
    ) -> Result<Self, CanonicalError> {
        let (rows, cols) = cov.dim();
        if bands == 0 || rows != 2 * bands || cols != 2 * bands {
            return Err(CanonicalError::Shape { rows, cols, bands });
        }
        let blocks = Blocks::split(cov, bands);

        let (a, b, rho) = if bands == 1 {
            blocks.solve_scalar()?
        } else {
            blocks.solve_generalized()?
        };

        let (a, b) = normalize_signs(a.view(), b.view(), blocks.s11, blocks.s12);
        let sigma = rho.mapv(|r| (2.0 * (1.0 - r)).sqrt());
        Ok(Self { a, b, rho, sigma })
    }

    /// Pair used when both halves are statistically identical but carry no
    /// variance: every canonical correlation is one and every MAD is zero.
    pub fn degenerate_identity(bands: usize) -> Self {
        Self {
            a: Array2::eye(bands),
            b: Array2::eye(bands),
            rho: Array1::ones(bands),
            sigma: Array1::zeros(bands),
        }
    }

    pub fn bands(&self) -> usize {
        self.rho.len()
    }

    /// Bands whose canonical correlation is exactly one (`sigma == 0`).
    pub fn degenerate_bands(&self) -> Vec<usize> {
        self.sigma
            .iter()
            .enumerate()
            .filter(|(_, s)| **s <= 0.0)
            .map(|(k, _)| k)
            .collect()
    }
}

struct Blocks<'a> {
    s11: ArrayView2<'a, f64>,
    s12: ArrayView2<'a, f64>,
    s21: ArrayView2<'a, f64>,
    s22: ArrayView2<'a, f64>,
}

impl<'a> Blocks<'a> {
    fn split(cov: ArrayView2<'a, f64>, bands: usize) -> Self {
        Self {
            s11: cov.slice_move(s![..bands, ..bands]),
            s12: cov.slice_move(s![..bands, bands..]),
            s21: cov.slice_move(s![bands.., ..bands]),
            s22: cov.slice_move(s![bands.., bands..]),
        }
    }

    fn solve_scalar(&self) -> Result<(Array2<f64>, Array2<f64>, Array1<f64>), CanonicalError> {
        let s11 = self.s11[[0, 0]];
        let s22 = self.s22[[0, 0]];
        let s12 = self.s12[[0, 0]];
        if !(s11 > 0.0 && s11.is_finite()) {
            return Err(singular(CovarianceBlock::Reference, self.s11));
        }
        if !(s22 > 0.0 && s22.is_finite()) {
            return Err(singular(CovarianceBlock::Target, self.s22));
        }

        let mu2 = s12 * s12 / (s22 * s11);
        let a = Array2::from_elem((1, 1), 1.0 / s11.sqrt());
        let b = Array2::from_elem((1, 1), 1.0 / s22.sqrt());
        Ok((a, b, Array1::from_elem(1, correlation_from_mu2(mu2))))
    }

    fn solve_generalized(
        &self,
    ) -> Result<(Array2<f64>, Array2<f64>, Array1<f64>), CanonicalError> {
        let l11_inv = inverse_cholesky_factor(self.s11, CovarianceBlock::Reference)?;
        let l22_inv = inverse_cholesky_factor(self.s22, CovarianceBlock::Target)?;
        let s11_inv = l11_inv.t().dot(&l11_inv);
        let s22_inv = l22_inv.t().dot(&l22_inv);

        let c1 = self.s12.dot(&s22_inv).dot(&self.s21);
        let c2 = self.s21.dot(&s11_inv).dot(&self.s12);

        let (mu2_a, a) = reduced_eigh(&c1, &l11_inv)?;
        let (mu2_b, b) = reduced_eigh(&c2, &l22_inv)?;

        let order_a = ascending_order(&mu2_a);
        let order_b = ascending_order(&mu2_b);
        let a = a.select(Axis(1), &order_a);
        let b = b.select(Axis(1), &order_b);
        let rho = mu2_b.select(Axis(0), &order_b).mapv(correlation_from_mu2);
        let b = self.pair_target_vectors(&a, b, &s22_inv);
        Ok((a, b, rho))
    }

    /// Rebuilds each target vector from its reference partner as
    /// `b ~ S22^-1 S21 a`, scaled to `b^T S22 b = 1`.
    ///
    /// For distinct correlations this is the eigenvector of the second problem
    /// up to sign. When correlations coincide (identical images give a
    /// repeated eigenvalue of one) the eigenvectors of the two problems are
    /// free rotations of each other and only this construction keeps the
    /// pairs matched. Columns with no cross-correlation keep the eigenvector.
    fn pair_target_vectors(
        &self,
        a: &Array2<f64>,
        mut b: Array2<f64>,
        s22_inv: &Array2<f64>,
    ) -> Array2<f64> {
        let projected = s22_inv.dot(&self.s21).dot(a);
        for (k, column) in projected.columns().into_iter().enumerate() {
            let norm_sq = column.dot(&self.s22.dot(&column));
            if norm_sq > PAIRING_FLOOR && norm_sq.is_finite() {
                b.column_mut(k).assign(&(&column / norm_sq.sqrt()));
            }
        }
        b
    }
}

fn singular(block: CovarianceBlock, matrix: ArrayView2<'_, f64>) -> CanonicalError {
    CanonicalError::Singular {
        block,
        matrix: matrix.to_owned(),
    }
}

/// Returns `L^-1` for the lower Cholesky factor of `block`, rejecting blocks
/// that are numerically rank deficient.
fn inverse_cholesky_factor(
    block: ArrayView2<'_, f64>,
    which: CovarianceBlock,
) -> Result<Array2<f64>, CanonicalError> {
    let scale = block.diag().iter().copied().fold(0.0_f64, f64::max);
    if !(scale > 0.0 && scale.is_finite()) {
        return Err(singular(which, block));
    }
    let lower = block
        .to_owned()
        .cholesky(UPLO::Lower)
        .map_err(|_| singular(which, block))?;
    let weakest_pivot = lower.diag().iter().copied().fold(f64::INFINITY, f64::min);
    if weakest_pivot * weakest_pivot < SINGULARITY_TOLERANCE * scale {
        return Err(singular(which, block));
    }
    Ok(lower.inv()?)
}

fn reduced_eigh(
    c: &Array2<f64>,
    l_inv: &Array2<f64>,
) -> Result<(Array1<f64>, Array2<f64>), CanonicalError> {
    let reduced = l_inv.dot(c).dot(&l_inv.t());
    let reduced = (&reduced + &reduced.t()) * 0.5;
    let (values, vectors) = reduced.eigh(UPLO::Lower)?;
    Ok((values, l_inv.t().dot(&vectors)))
}

fn ascending_order(values: &Array1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| {
        values[i]
            .partial_cmp(&values[j])
            .unwrap_or(Ordering::Equal)
            .then(i.cmp(&j))
    });
    order
}

fn correlation_from_mu2(mu2: f64) -> f64 {
    if mu2.is_nan() {
        return 0.0;
    }
    mu2.clamp(0.0, 1.0).sqrt()
}

/// Fixes the arbitrary eigenvector signs.
///
/// Each column of `a` is flipped so that the sum of the correlations between
/// its canonical variate and the original reference bands is positive; each
/// column of `b` is then flipped so that the matched pair covariance
/// `diag(A^T S12 B)` is positive. Columns whose criterion is exactly zero are
/// left alone. Applying the function to its own output changes nothing.
pub fn normalize_signs(
    a: ArrayView2<'_, f64>,
    b: ArrayView2<'_, f64>,
    s11: ArrayView2<'_, f64>,
    s12: ArrayView2<'_, f64>,
) -> (Array2<f64>, Array2<f64>) {
    let inv_sd = s11
        .diag()
        .mapv(|v| if v > 0.0 { 1.0 / v.sqrt() } else { 0.0 });
    let scaled = &s11 * &inv_sd.view().insert_axis(Axis(1));
    let orientation = scaled.dot(&a).sum_axis(Axis(0));

    let mut a = a.to_owned();
    for (mut column, &sum) in a.columns_mut().into_iter().zip(orientation.iter()) {
        if sum < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }

    let cross = a.t().dot(&s12);
    let mut b = b.to_owned();
    for (k, mut column) in b.columns_mut().into_iter().enumerate() {
        let pair_cov = cross.row(k).dot(&column);
        if pair_cov < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }
    (a, b)
}
