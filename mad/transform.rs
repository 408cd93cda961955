use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Zip, s};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::error::Error;

use super::canonical::CanonicalPair;
use super::fit::{MadError, block_storage_len};
use super::progress::{NoopTransformProgress, TransformProgressObserver, TransformProgressStage};
use super::source::{PixelBlockSource, is_valid_pixel};

/// Probability that a pixel's chi-square statistic arises from no change,
/// `1 - ChiSquareCDF(x; df)`.
#[derive(Clone, Debug)]
pub struct NoChangeProbability {
    distribution: ChiSquared,
    degrees_of_freedom: usize,
}

impl NoChangeProbability {
    pub fn new(degrees_of_freedom: usize) -> Result<Self, MadError> {
        let distribution = ChiSquared::new(degrees_of_freedom as f64).map_err(|err| {
            MadError::InvalidInput(format!(
                "chi-square distribution with {degrees_of_freedom} degrees of freedom: {err}"
            ))
        })?;
        Ok(Self {
            distribution,
            degrees_of_freedom,
        })
    }

    pub fn degrees_of_freedom(&self) -> usize {
        self.degrees_of_freedom
    }

    pub fn evaluate(&self, chi_square: f64) -> f64 {
        if chi_square.is_nan() {
            return 0.0;
        }
        if chi_square <= 0.0 {
            return 1.0;
        }
        self.distribution.sf(chi_square).clamp(0.0, 1.0)
    }
}

/// The converged IR-MAD transform: canonical vectors, MAD standard
/// deviations and the weighted means of the final cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MadTransform {
    a: Array2<f64>,
    b: Array2<f64>,
    sigma: Array1<f64>,
    means: Array1<f64>,
}

impl MadTransform {
    pub fn new(pair: &CanonicalPair, means: ArrayView1<'_, f64>) -> Result<Self, MadError> {
        let bands = pair.bands();
        if means.len() != 2 * bands {
            return Err(MadError::InvalidInput(format!(
                "mean vector has length {} but {bands} bands per image need {}",
                means.len(),
                2 * bands
            )));
        }
        Ok(Self {
            a: pair.a.clone(),
            b: pair.b.clone(),
            sigma: pair.sigma.clone(),
            means: means.to_owned(),
        })
    }

    pub fn bands(&self) -> usize {
        self.sigma.len()
    }

    pub fn a(&self) -> ArrayView2<'_, f64> {
        self.a.view()
    }

    pub fn b(&self) -> ArrayView2<'_, f64> {
        self.b.view()
    }

    pub fn sigma(&self) -> ArrayView1<'_, f64> {
        self.sigma.view()
    }

    pub fn reference_means(&self) -> ArrayView1<'_, f64> {
        self.means.slice(s![..self.bands()])
    }

    pub fn target_means(&self) -> ArrayView1<'_, f64> {
        self.means.slice(s![self.bands()..])
    }

    /// Writes the MAD variates of one pixel vector into `mads` and returns its
    /// chi-square statistic. Bands with `sigma == 0` add nothing to the
    /// statistic.
    pub fn project_pixel(
        &self,
        pixel: ArrayView1<'_, f64>,
        mut mads: ArrayViewMut1<'_, f64>,
    ) -> f64 {
        let bands = self.bands();
        let mut chi_square = 0.0;
        for k in 0..bands {
            let mut u = 0.0;
            let mut v = 0.0;
            for i in 0..bands {
                u += (pixel[i] - self.means[i]) * self.a[[i, k]];
                v += (pixel[bands + i] - self.means[bands + i]) * self.b[[i, k]];
            }
            let mad = u - v;
            mads[k] = mad;
            let sigma = self.sigma[k];
            if sigma > 0.0 {
                let z = mad / sigma;
                chi_square += z * z;
            }
        }
        chi_square
    }

    pub fn chi_square(&self, pixel: ArrayView1<'_, f64>) -> f64 {
        let mut scratch = Array1::zeros(self.bands());
        self.project_pixel(pixel, scratch.view_mut())
    }

    /// Transforms one block of pixel vectors in parallel. No-data pixels are
    /// written as zero in every output. Returns the number of valid pixels.
    pub fn apply_block(
        &self,
        block: ArrayView2<'_, f64>,
        mut mads: ArrayViewMut2<'_, f64>,
        mut chi_square: ArrayViewMut1<'_, f64>,
    ) -> Result<usize, MadError> {
        let bands = self.bands();
        let pixels = block.nrows();
        if block.ncols() != 2 * bands
            || mads.dim() != (pixels, bands)
            || chi_square.len() != pixels
        {
            return Err(MadError::InvalidInput(format!(
                "block of {:?} with outputs {:?} and {} does not fit a {bands}-band transform",
                block.dim(),
                mads.dim(),
                chi_square.len()
            )));
        }

        Zip::from(block.rows())
            .and(mads.rows_mut())
            .and(&mut chi_square)
            .par_for_each(|pixel, mut mad, chi| {
                if is_valid_pixel(pixel, bands) {
                    *chi = self.project_pixel(pixel, mad.view_mut());
                } else {
                    mad.fill(0.0);
                    *chi = 0.0;
                }
            });

        Ok(block
            .rows()
            .into_iter()
            .filter(|pixel| is_valid_pixel(pixel.view(), bands))
            .count())
    }

    pub fn apply<S>(&self, source: &mut S, block_pixels: usize) -> Result<MadResult, MadError>
    where
        S: PixelBlockSource,
        S::Error: Error + Send + Sync + 'static,
    {
        let mut progress = NoopTransformProgress;
        self.apply_with_progress(source, block_pixels, &mut progress)
    }

    /// Streams every pixel of `source` through the transform, producing the
    /// `p` MAD bands and the chi-square band in raster order.
    pub fn apply_with_progress<S, P>(
        &self,
        source: &mut S,
        block_pixels: usize,
        progress: &mut P,
    ) -> Result<MadResult, MadError>
    where
        S: PixelBlockSource,
        S::Error: Error + Send + Sync + 'static,
        P: TransformProgressObserver,
    {
        let bands = self.bands();
        if source.n_bands() != bands {
            return Err(MadError::InvalidInput(format!(
                "transform was fitted on {bands} bands but the source provides {}",
                source.n_bands()
            )));
        }
        if block_pixels == 0 {
            return Err(MadError::InvalidInput(
                "block size must be at least one pixel".into(),
            ));
        }

        let dim = 2 * bands;
        let n_pixels = source.n_pixels();
        let mut storage = vec![0.0f64; block_storage_len(block_pixels, bands)?];
        let mut mads = Array2::<f64>::zeros((n_pixels, bands));
        let mut chi_square = Array1::<f64>::zeros(n_pixels);
        let mut offset = 0usize;
        let mut valid_pixels = 0usize;

        source.reset().map_err(|e| MadError::Source(Box::new(e)))?;
        progress.on_stage_start(TransformProgressStage::Transform, n_pixels);
        loop {
            let filled = source
                .next_block_into(block_pixels, &mut storage)
                .map_err(|e| MadError::Source(Box::new(e)))?;
            if filled == 0 {
                break;
            }
            if filled > block_pixels || offset + filled > n_pixels {
                return Err(MadError::InvalidInput(format!(
                    "pixel source produced more than the {n_pixels} pixels it announced"
                )));
            }

            let block = ArrayView2::from_shape((filled, dim), &storage[..filled * dim])?;
            valid_pixels += self.apply_block(
                block,
                mads.slice_mut(s![offset..offset + filled, ..]),
                chi_square.slice_mut(s![offset..offset + filled]),
            )?;
            offset += filled;
            progress.on_stage_advance(TransformProgressStage::Transform, offset);
        }
        progress.on_stage_finish(TransformProgressStage::Transform);

        if offset != n_pixels {
            return Err(MadError::InvalidInput(format!(
                "pixel source announced {n_pixels} pixels but produced {offset}"
            )));
        }
        log::debug!(
            "MAD transform finished: {} pixels, {} valid",
            n_pixels,
            valid_pixels
        );

        Ok(MadResult {
            mads,
            chi_square,
            valid_pixels,
        })
    }
}

/// Per-pixel output of the final pass, in the source's raster order.
#[derive(Clone, Debug)]
pub struct MadResult {
    mads: Array2<f64>,
    chi_square: Array1<f64>,
    valid_pixels: usize,
}

impl MadResult {
    pub fn n_pixels(&self) -> usize {
        self.chi_square.len()
    }

    pub fn bands(&self) -> usize {
        self.mads.ncols()
    }

    pub fn valid_pixels(&self) -> usize {
        self.valid_pixels
    }

    /// Pixel-major MAD variates, `n_pixels x bands`.
    pub fn mads(&self) -> ArrayView2<'_, f64> {
        self.mads.view()
    }

    pub fn mad_band(&self, band: usize) -> ArrayView1<'_, f64> {
        self.mads.column(band)
    }

    pub fn chi_square(&self) -> ArrayView1<'_, f64> {
        self.chi_square.view()
    }

    /// Output bands in persisted order: the `p` MAD variates, then chi-square.
    pub fn output_bands(&self) -> impl Iterator<Item = ArrayView1<'_, f64>> {
        self.mads
            .columns()
            .into_iter()
            .chain(std::iter::once(self.chi_square.view()))
    }
}
