use core::cmp::min;

use crate::mad::fit::MadError;
use crate::mad::source::PixelBlockSource;
use crate::raster::{BandSelection, Raster, RasterError, Window};

/// Streams co-registered pixel vectors out of two opened rasters.
///
/// `window` is taken from the reference image; the target window has the same
/// extent and starts at `target_origin` (default: the reference origin).
pub struct RasterPairSource<'a> {
    reference: &'a Raster,
    target: &'a Raster,
    reference_bands: BandSelection,
    target_bands: BandSelection,
    window: Window,
    target_window: Window,
    n_pixels: usize,
    cursor: usize,
    row_buffer: Vec<f64>,
}

impl<'a> RasterPairSource<'a> {
    pub fn new(
        reference: &'a Raster,
        reference_bands: BandSelection,
        target: &'a Raster,
        target_bands: BandSelection,
        window: Window,
        target_origin: Option<(usize, usize)>,
    ) -> Result<Self, MadError> {
        if reference_bands.len() != target_bands.len() {
            return Err(MadError::BandCountMismatch {
                reference: reference_bands.len(),
                target: target_bands.len(),
            });
        }
        if reference_bands.is_empty() {
            return Err(MadError::InvalidInput(
                "at least one band must be selected".into(),
            ));
        }
        let (tx, ty) = target_origin.unwrap_or((window.x0, window.y0));
        let target_window = window.at(tx, ty);
        let source_err = |err: RasterError| MadError::Source(Box::new(err));
        check_bands(reference, &reference_bands).map_err(source_err)?;
        check_bands(target, &target_bands).map_err(source_err)?;
        window.check_within(reference.header()).map_err(source_err)?;
        target_window
            .check_within(target.header())
            .map_err(source_err)?;
        let n_pixels = window.pixels().map_err(source_err)?;

        log::debug!(
            "Pairing {} bands of {} with {} over a {}x{} window",
            reference_bands.len(),
            reference.path().display(),
            target.path().display(),
            window.cols,
            window.rows
        );

        Ok(Self {
            reference,
            target,
            reference_bands,
            target_bands,
            window,
            target_window,
            n_pixels,
            cursor: 0,
            row_buffer: vec![0.0; window.cols],
        })
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn target_window(&self) -> Window {
        self.target_window
    }
}

fn check_bands(raster: &Raster, bands: &BandSelection) -> Result<(), RasterError> {
    let available = raster.header().bands;
    match bands.indices().iter().find(|&&band| band >= available) {
        Some(band) => Err(RasterError::OutOfBounds(format!(
            "band {} requested from {}, which has {available} bands",
            band + 1,
            raster.path().display()
        ))),
        None => Ok(()),
    }
}

impl PixelBlockSource for RasterPairSource<'_> {
    type Error = RasterError;

    fn n_bands(&self) -> usize {
        self.reference_bands.len()
    }

    fn n_pixels(&self) -> usize {
        self.n_pixels
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
        let bands = self.n_bands();
        let dim = 2 * bands;
        let total = min(max_pixels, self.n_pixels().saturating_sub(self.cursor));
        let mut filled = 0usize;

        while filled < total {
            let row = self.cursor / self.window.cols;
            let col = self.cursor % self.window.cols;
            let run = min(self.window.cols - col, total - filled);
            let block = &mut storage[filled * dim..(filled + run) * dim];

            let halves = [
                (self.reference, &self.reference_bands, self.window, 0),
                (self.target, &self.target_bands, self.target_window, bands),
            ];
            for (raster, selection, window, offset) in halves {
                for (slot, &band) in selection.indices().iter().enumerate() {
                    let segment = &mut self.row_buffer[..run];
                    raster.read_row(band, window.y0 + row, window.x0 + col, segment)?;
                    for (pixel, &value) in block.chunks_exact_mut(dim).zip(segment.iter()) {
                        pixel[offset + slot] = value;
                    }
                }
            }

            filled += run;
            self.cursor += run;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{DataType, RasterHeader, RasterWriter};
    use std::path::Path;

    fn write_raster(path: &Path, cols: usize, rows: usize, bands: &[Vec<f64>]) -> Raster {
        let header = RasterHeader {
            cols,
            rows,
            bands: bands.len(),
            data_type: DataType::F32,
            geotransform: None,
        };
        let mut writer = RasterWriter::create(path, header).unwrap();
        for (band, values) in bands.iter().enumerate() {
            writer.write_band(band, values.iter().copied()).unwrap();
        }
        writer.finish().unwrap();
        Raster::open(path).unwrap()
    }

    #[test]
    fn blocks_follow_window_raster_order_across_rows() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<f64> = (0..20).map(f64::from).collect();
        let shifted: Vec<f64> = values.iter().map(|v| v + 100.0).collect();
        let reference = write_raster(&dir.path().join("a.tif"), 5, 4, &[values.clone()]);
        let target = write_raster(&dir.path().join("b.bsq"), 5, 4, &[shifted]);
        let window = Window {
            x0: 1,
            y0: 1,
            cols: 3,
            rows: 2,
        };
        let mut source = RasterPairSource::new(
            &reference,
            BandSelection::all(1),
            &target,
            BandSelection::all(1),
            window,
            Some((2, 2)),
        )
        .unwrap();

        assert_eq!(source.n_pixels(), 6);
        let mut storage = vec![0.0; 4 * 2];
        assert_eq!(source.next_block_into(4, &mut storage).unwrap(), 4);
        assert_eq!(
            storage,
            vec![6.0, 112.0, 7.0, 113.0, 8.0, 114.0, 11.0, 117.0]
        );
        assert_eq!(source.next_block_into(4, &mut storage).unwrap(), 2);
        assert_eq!(&storage[..4], &[12.0, 118.0, 13.0, 119.0]);
        assert_eq!(source.next_block_into(4, &mut storage).unwrap(), 0);

        source.reset().unwrap();
        assert_eq!(source.next_block_into(1, &mut storage).unwrap(), 1);
        assert_eq!(&storage[..2], &[6.0, 112.0]);
    }

    #[test]
    fn band_selections_must_have_equal_length() {
        let dir = tempfile::tempdir().unwrap();
        let band = vec![1.0; 4];
        let reference = write_raster(&dir.path().join("a.bsq"), 2, 2, &vec![band.clone(); 3]);
        let target = write_raster(&dir.path().join("b.bsq"), 2, 2, &vec![band; 4]);
        let result = RasterPairSource::new(
            &reference,
            BandSelection::all(3),
            &target,
            BandSelection::all(4),
            Window::full(reference.header()),
            None,
        );
        assert!(matches!(
            result,
            Err(MadError::BandCountMismatch {
                reference: 3,
                target: 4
            })
        ));
    }

    #[test]
    fn target_window_must_fit() {
        let dir = tempfile::tempdir().unwrap();
        let band = vec![1.0; 9];
        let reference = write_raster(&dir.path().join("a.bsq"), 3, 3, &[band.clone()]);
        let target = write_raster(&dir.path().join("b.bsq"), 3, 3, &[band]);
        let result = RasterPairSource::new(
            &reference,
            BandSelection::all(1),
            &target,
            BandSelection::all(1),
            Window::full(reference.header()),
            Some((1, 0)),
        );
        assert!(matches!(result, Err(MadError::Source(_))));

        let far = RasterPairSource::new(
            &reference,
            BandSelection::all(1),
            &target,
            BandSelection::all(1),
            Window::full(reference.header()),
            Some((usize::MAX, 0)),
        );
        assert!(matches!(far, Err(MadError::Source(_))));
    }
}
