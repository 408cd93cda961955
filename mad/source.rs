use core::cmp::min;
use ndarray::{ArrayView1, ArrayView3};
use std::convert::Infallible;

use super::fit::MadError;

/// Number of pixels pulled from a source per block during a full-image pass.
pub const DEFAULT_BLOCK_PIXELS: usize = 16_384;

/// A restartable producer of pixel-vector blocks.
///
/// Every block is written row-major into `storage`: one row per pixel, each
/// row holding the `n_bands()` reference values followed by the `n_bands()`
/// target values. Pixels must come out in the same raster order after every
/// [`reset`](PixelBlockSource::reset) so that the output pass lines up with
/// the spatial window.
pub trait PixelBlockSource {
    type Error;

    /// Band count of each image (the `p` of a `2p` pixel vector).
    fn n_bands(&self) -> usize;
    fn n_pixels(&self) -> usize;
    fn reset(&mut self) -> Result<(), Self::Error>;
    fn next_block_into(
        &mut self,
        max_pixels: usize,
        storage: &mut [f64],
    ) -> Result<usize, Self::Error>;

    fn pixel_dimension(&self) -> usize {
        2 * self.n_bands()
    }
}

/// In-memory image pair stored as `(band, row, col)` arrays.
pub struct DenseImagePair<'a> {
    reference: ArrayView3<'a, f64>,
    target: ArrayView3<'a, f64>,
    cursor: usize,
}

impl<'a> DenseImagePair<'a> {
    pub fn new(
        reference: ArrayView3<'a, f64>,
        target: ArrayView3<'a, f64>,
    ) -> Result<Self, MadError> {
        let (ref_bands, ref_rows, ref_cols) = reference.dim();
        let (tgt_bands, tgt_rows, tgt_cols) = target.dim();
        if ref_bands != tgt_bands {
            return Err(MadError::BandCountMismatch {
                reference: ref_bands,
                target: tgt_bands,
            });
        }
        if ref_bands == 0 {
            return Err(MadError::InvalidInput(
                "DenseImagePair: at least one band is required".into(),
            ));
        }
        if (ref_rows, ref_cols) != (tgt_rows, tgt_cols) {
            return Err(MadError::InvalidInput(format!(
                "DenseImagePair: reference window is {ref_rows}x{ref_cols} but target window is {tgt_rows}x{tgt_cols}"
            )));
        }
        Ok(Self {
            reference,
            target,
            cursor: 0,
        })
    }

    pub fn rows(&self) -> usize {
        self.reference.dim().1
    }

    pub fn cols(&self) -> usize {
        self.reference.dim().2
    }
}

impl PixelBlockSource for DenseImagePair<'_> {
    type Error = Infallible;

    fn n_bands(&self) -> usize {
        self.reference.dim().0
    }

    fn n_pixels(&self) -> usize {
        self.rows() * self.cols()
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.cursor = 0;
        Ok(())
    }

    fn next_block_into(
        &mut self,
        max_pixels: usize,
        storage: &mut [f64],
    ) -> Result<usize, Self::Error> {
        let remaining = self.n_pixels().saturating_sub(self.cursor);
        let filled = min(max_pixels, remaining);
        let bands = self.n_bands();
        let cols = self.cols();
        let dim = 2 * bands;

        for (offset, pixel) in storage.chunks_exact_mut(dim).take(filled).enumerate() {
            let index = self.cursor + offset;
            let (row, col) = (index / cols, index % cols);
            for band in 0..bands {
                pixel[band] = self.reference[[band, row, col]];
                pixel[bands + band] = self.target[[band, row, col]];
            }
        }

        self.cursor += filled;
        Ok(filled)
    }
}

/// A pixel is no-data when any value is non-finite or when either image's
/// band values sum to exactly zero.
pub fn is_valid_pixel(pixel: ArrayView1<'_, f64>, bands: usize) -> bool {
    if pixel.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let reference: f64 = pixel.iter().take(bands).sum();
    let target: f64 = pixel.iter().skip(bands).sum();
    reference != 0.0 && target != 0.0
}
